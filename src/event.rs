//! Producer-to-worker intents and the self-pipe that interrupts socket
//! waits.
//!
//! Two wakeup channels exist side by side: the engine condvar wakes the
//! worker out of idle waits, the pipe wakes it out of `Multi::wait`. Every
//! event enqueue fires both.

use std::io;
use std::os::fd::RawFd;

use crate::response::RequestId;

/// Intent posted by a producer for the worker to act on. The id pins the
/// slot to the submission it belonged to at enqueue time; a slot that was
/// released and re-acquired in between no longer matches and the event is
/// dropped.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Event {
    Send { slot: usize, id: RequestId },
    Cancel { slot: usize, id: RequestId },
}

/// Non-blocking self-pipe. The read end sits in the worker's wait set so a
/// producer can interrupt a socket wait; the payload bytes carry no meaning.
#[derive(Debug)]
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Write one wakeup byte. Best-effort: a full pipe already has a wakeup
    /// pending, so failure is fine to ignore.
    pub(crate) fn notify(&self) -> bool {
        let byte = 1u8;
        let ret = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        ret == 1
    }

    /// Consume all pending wakeup bytes without blocking.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain() {
        let pipe = WakePipe::new().unwrap();
        assert!(pipe.notify());
        assert!(pipe.notify());
        pipe.drain();
        // Pipe is empty again: a non-blocking read yields EAGAIN.
        let mut buf = [0u8; 1];
        let ret = unsafe {
            libc::read(pipe.read_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1)
        };
        assert_eq!(ret, -1);
    }

    #[test]
    fn drain_on_empty_pipe_does_not_block() {
        let pipe = WakePipe::new().unwrap();
        pipe.drain();
    }
}
