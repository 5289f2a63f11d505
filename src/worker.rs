//! The worker thread: owns the multi handle, attaches and detaches
//! transfers, pumps I/O, reaps completions, and garbage-collects idle
//! native handles.
//!
//! Nothing but this thread ever touches the multi. Producers reach it
//! through the event queue, the condvar, and the wake pipe.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use curl::multi::{Easy2Handle, Multi, WaitFd};
use tracing::{debug, trace, warn};

use crate::completion;
use crate::engine::{EngineShared, WorkerState};
use crate::error::ErrorKind;
use crate::event::Event;
use crate::metrics;
use crate::response::{RequestId, Response, Status};
use crate::transfer::TransferSink;

/// An attached transfer with no observed activity after this long is
/// presumed lost and completed as timed out.
const HANDLE_LOST_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll cadence while transfers are in flight but libcurl offers no
/// deadline.
const BUSY_WAIT: Duration = Duration::from_millis(100);
/// Idle wait with nothing in flight; bounds shutdown latency.
const IDLE_WAIT: Duration = Duration::from_secs(2);
/// Longest single socket wait, so state changes are noticed promptly.
const MAX_SOCKET_WAIT: Duration = Duration::from_millis(1000);

/// Worker entry point. Runs until the engine leaves the started state, then
/// tears everything down and acknowledges the stop.
pub(crate) fn run(shared: Arc<EngineShared>) {
    let mut worker = Worker::new(shared);
    {
        let _inner = worker.shared.lock_inner();
        worker.shared.store_state(WorkerState::Started);
        worker.shared.cv.notify_all();
    }
    trace!("worker running");

    while worker.shared.is_started() {
        worker.iterate();
    }

    worker.teardown();
    {
        let _inner = worker.shared.lock_inner();
        worker.shared.store_state(WorkerState::Stopped);
        worker.shared.cv.notify_all();
    }
    debug!("worker exited");
}

struct Worker {
    shared: Arc<EngineShared>,
    multi: Multi,
    /// Transfers currently owned by the multi, indexed by pool slot.
    attached: Vec<Option<Easy2Handle<TransferSink>>>,
    wake_fd: Option<RawFd>,
}

impl Worker {
    fn new(shared: Arc<EngineShared>) -> Self {
        let slots = shared.config.max_handles;
        let wake_fd = shared
            .lock_inner()
            .wake
            .as_ref()
            .map(|wake| wake.read_fd());
        let mut attached = Vec::with_capacity(slots);
        attached.resize_with(slots, || None);
        Worker {
            shared,
            multi: Multi::new(),
            attached,
            wake_fd,
        }
    }

    fn iterate(&mut self) {
        let forced_failures = self.drain_events();

        if !self.shared.is_started() {
            return;
        }
        for slot in forced_failures {
            completion::complete_transfer(
                &self.shared,
                slot,
                Err(curl::Error::new(curl_sys::CURLE_COULDNT_CONNECT)),
            );
        }

        self.perform();

        let completed = self.reap_completions();
        if !self.shared.is_started() || completed {
            return;
        }

        self.wait_for_work();
        self.collect_idle_natives();
    }

    /// Pop and act on every queued event in FIFO order. Returns the slots
    /// whose attach failed; they are completed as connect failures once the
    /// queue is drained.
    fn drain_events(&mut self) -> Vec<usize> {
        let mut failures = Vec::new();
        loop {
            let mut inner = self.shared.lock_inner();
            if !self.shared.is_started() {
                break;
            }
            let Some(event) = inner.events.pop_front() else {
                break;
            };
            match event {
                Event::Send { slot, id } => {
                    if !inner.pool.is_current(slot, id) {
                        trace!(id, "dropping stale send event");
                        continue;
                    }
                    let Some(easy) = inner.pool.take_easy(slot) else {
                        continue;
                    };
                    match self.multi.add2(easy) {
                        Ok(mut handle) => match handle.set_token(slot) {
                            Ok(()) => self.attached[slot] = Some(handle),
                            Err(error) => {
                                warn!(id, %error, "failed to tag transfer");
                                match self.multi.remove2(handle) {
                                    Ok(easy) => inner.pool.put_easy(slot, easy),
                                    Err(error) => warn!(id, %error, "failed to detach transfer"),
                                }
                                failures.push(slot);
                            }
                        },
                        Err(error) => {
                            warn!(id, %error, "failed to attach transfer");
                            failures.push(slot);
                        }
                    }
                }
                Event::Cancel { slot, id } => {
                    if !inner.pool.is_current(slot, id) {
                        trace!(id, "dropping stale cancel event");
                        continue;
                    }
                    if let Some(handle) = self.attached[slot].take() {
                        match self.multi.remove2(handle) {
                            Ok(easy) => inner.pool.put_easy(slot, easy),
                            Err(error) => {
                                warn!(id, %error, "failed to detach cancelled transfer")
                            }
                        }
                    }
                    drop(inner);
                    completion::complete_transfer(
                        &self.shared,
                        slot,
                        Err(curl::Error::new(curl_sys::CURLE_OPERATION_TIMEDOUT)),
                    );
                }
            }
        }
        failures
    }

    /// Drive I/O for every attached transfer.
    fn perform(&mut self) {
        loop {
            match self.multi.perform() {
                Ok(_running) => break,
                Err(error) if error.is_call_perform() => continue,
                Err(error) => {
                    warn!(%error, "multi perform failed");
                    break;
                }
            }
        }
    }

    /// Drain the multi's completion queue and route every finished
    /// transfer. Returns whether anything completed.
    fn reap_completions(&mut self) -> bool {
        let mut finished: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        self.multi.messages(|message| match message.token() {
            Ok(slot) => {
                if let Some(result) = message.result() {
                    finished.push((slot, result));
                } else {
                    warn!(slot, "transfer message with unknown state");
                }
            }
            Err(error) => warn!(%error, "completion for untagged transfer"),
        });

        let completed = !finished.is_empty();
        for (slot, result) in finished {
            self.detach(slot);
            completion::complete_transfer(&self.shared, slot, result);
        }
        completed
    }

    /// Remove an attached transfer from the multi and park its native
    /// handle back in the slot.
    fn detach(&mut self, slot: usize) {
        let Some(handle) = self.attached.get_mut(slot).and_then(|slot| slot.take()) else {
            return;
        };
        match self.multi.remove2(handle) {
            Ok(easy) => self.shared.lock_inner().pool.put_easy(slot, easy),
            Err(error) => warn!(slot, %error, "failed to detach transfer"),
        }
    }

    /// Sleep until libcurl's suggested deadline, an event arrives, or a
    /// socket becomes ready. With no deadline available, first sweep for
    /// transfers that never got off the ground.
    fn wait_for_work(&mut self) {
        let suggested = match self.multi.get_timeout() {
            Ok(timeout) => timeout,
            Err(error) => {
                warn!(%error, "multi timeout query failed");
                return;
            }
        };

        match suggested {
            None => {
                self.reap_lost_transfers();
                if !self.shared.is_started() {
                    return;
                }
                let inner = self.shared.lock_inner();
                let wait = if inner.pool.any_in_use() {
                    BUSY_WAIT
                } else {
                    IDLE_WAIT
                };
                if inner.events.is_empty() && self.shared.is_started() {
                    let _ = self.shared.cv.wait_timeout(inner, wait);
                }
            }
            Some(timeout) => {
                let timeout = timeout.min(MAX_SOCKET_WAIT);
                if timeout.is_zero() {
                    return;
                }
                match self.wake_fd {
                    Some(fd) => {
                        let mut wait_fds = [WaitFd::new()];
                        wait_fds[0].set_fd(fd);
                        wait_fds[0].poll_on_read(true);
                        if let Err(error) = self.multi.wait(&mut wait_fds, timeout) {
                            warn!(%error, "socket wait failed");
                        }
                    }
                    None => {
                        if let Err(error) = self.multi.wait(&mut [], timeout) {
                            warn!(%error, "socket wait failed");
                        }
                    }
                }
                if let Some(wake) = self.shared.lock_inner().wake.as_ref() {
                    wake.drain();
                }
            }
        }
    }

    /// Complete transfers that have been attached for a while without any
    /// header or body activity. libcurl occasionally loses track of a
    /// transfer when it has no socket to watch; this sweep substitutes for
    /// the missing notification.
    fn reap_lost_transfers(&mut self) {
        let now = Instant::now();
        let lost: Vec<(usize, RequestId)> = {
            let inner = self.shared.lock_inner();
            (0..inner.pool.len())
                .filter(|&slot| {
                    inner.pool.slot(slot).in_use
                        && self.attached[slot]
                            .as_ref()
                            .is_some_and(|handle| !handle.get_ref().has_activity())
                        && now.duration_since(inner.pool.slot(slot).send_time)
                            > HANDLE_LOST_TIMEOUT
                })
                .map(|slot| (slot, inner.pool.slot(slot).id))
                .collect()
        };
        if lost.is_empty() || !self.shared.is_started() {
            return;
        }
        for (slot, id) in lost {
            warn!(id, "releasing lost transfer");
            self.detach(slot);
            completion::complete_transfer(
                &self.shared,
                slot,
                Err(curl::Error::new(curl_sys::CURLE_OPERATION_TIMEDOUT)),
            );
        }
    }

    /// Expire idle non-resident native handles and cap the multi's
    /// connection cache to what can still be reused.
    fn collect_idle_natives(&mut self) {
        let usable = {
            let mut inner = self.shared.lock_inner();
            inner.pool.expire_idle(Instant::now());
            (0..inner.pool.len())
                .filter(|&slot| {
                    slot < inner.pool.static_count()
                        || inner.pool.has_native(slot)
                        || self.attached[slot].is_some()
                })
                .count()
        };
        if let Err(error) = self.multi.set_max_connects(usable) {
            warn!(%error, "failed to cap connection cache");
        }
    }

    /// Final cleanup once the loop has exited: flush the event queue, pull
    /// every transfer off the multi, drop all native handles, close the
    /// wake pipe, and fail whatever was still pending.
    fn teardown(&mut self) {
        debug!("worker tearing down");
        let pending = {
            let mut inner = self.shared.lock_inner();
            inner.events.clear();

            let mut pending = Vec::new();
            for slot_index in 0..inner.pool.len() {
                if let Some(handle) = self.attached[slot_index].take() {
                    if let Err(error) = self.multi.remove2(handle) {
                        warn!(slot = slot_index, %error, "failed to detach transfer in teardown");
                    }
                }
                let slot = inner.pool.slot_mut(slot_index);
                if slot.in_use {
                    if let Some(callback) = slot.callback.take() {
                        pending.push((slot.id, callback));
                    }
                }
                slot.easy = None;
            }
            inner.wake = None;
            pending
        };

        for (id, callback) in pending {
            metrics::REQUESTS_COMPLETED.increment();
            callback(Response::new(
                id,
                Status::Failed(ErrorKind::Offline),
                "Offline: network is deinitialized",
            ));
        }
    }
}
