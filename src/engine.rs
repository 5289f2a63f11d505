//! Engine lifetime and the public submission API.
//!
//! One mutex (on [`Inner`]) guards the pool, the event queue, the wake
//! pipe, and the request-id counter; a second serializes initialize and
//! deinitialize. User callbacks are never invoked while either is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::event::{Event, WakePipe};
use crate::metrics;
use crate::pool::HandlePool;
use crate::request::Request;
use crate::response::{
    Callback, DataCallback, HeaderCallback, Payload, RequestId, REQUEST_ID_MIN,
};
use crate::{transfer, worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerState {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            1 => WorkerState::Started,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Everything behind the engine mutex.
pub(crate) struct Inner {
    pub(crate) pool: HandlePool,
    pub(crate) events: VecDeque<Event>,
    pub(crate) wake: Option<WakePipe>,
    next_id: RequestId,
}

impl Inner {
    /// Allocate the next request id, wrapping back to the minimum past the
    /// end of the range.
    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = id.checked_add(1).unwrap_or(REQUEST_ID_MIN);
        id
    }
}

/// State shared between producers, the worker, and the sink trampolines
/// (which hold it weakly).
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    state: AtomicU8,
    inner: Mutex<Inner>,
    pub(crate) cv: Condvar,
}

impl EngineShared {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        let max_handles = config.max_handles;
        let static_count = config.static_handle_count();
        Arc::new_cyclic(|weak| EngineShared {
            config,
            state: AtomicU8::new(WorkerState::Stopped as u8),
            inner: Mutex::new(Inner {
                pool: HandlePool::new(max_handles, static_count, weak.clone()),
                events: VecDeque::new(),
                wake: None,
                next_id: REQUEST_ID_MIN,
            }),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn store_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state() == WorkerState::Started
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Post an event and fire both wakeup channels: the condvar for the
    /// worker's idle waits, the pipe for its socket waits. Caller holds the
    /// engine mutex.
    pub(crate) fn enqueue_locked(&self, inner: &mut Inner, event: Event) {
        inner.events.push_back(event);
        self.cv.notify_all();
        if let Some(wake) = inner.wake.as_ref() {
            if !wake.notify() {
                debug!("wake pipe write failed");
            }
        }
    }
}

/// Pooled, multiplexed HTTP transfer engine.
///
/// Producers on any thread submit requests; a single worker thread drives
/// all in-flight transfers over libcurl's multi interface and delivers
/// results through per-request callbacks. See the crate documentation for
/// an end-to-end example.
pub struct Engine {
    shared: Arc<EngineShared>,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    worker: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Create an engine. The worker thread starts lazily, on `initialize`
    /// or the first `send`.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        trace!(handles = config.max_handles, "created engine");
        Ok(Engine {
            shared: EngineShared::new(config),
            lifecycle: Mutex::new(Lifecycle { worker: None }),
        })
    }

    /// Start the worker thread. Idempotent; blocks until the worker is
    /// ready to accept events.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if self.shared.state() != WorkerState::Stopped {
            debug!("engine already initialized");
            return Ok(());
        }

        curl::init();
        let wake = WakePipe::new()?;
        {
            let mut inner = self.shared.lock_inner();
            inner.events.clear();
            inner.pool.reset_all();
            inner.pool.init_resident();
            inner.wake = Some(wake);
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("tidepool-worker".to_string())
            .spawn(move || worker::run(shared))?;
        lifecycle.worker = Some(handle);

        let mut inner = self.shared.lock_inner();
        while self.shared.state() == WorkerState::Stopped {
            inner = self.shared.cv.wait(inner).unwrap();
        }
        drop(inner);
        Ok(())
    }

    /// Stop the worker and deliver an offline failure for every pending
    /// submission. No-op unless the engine is running.
    pub fn deinitialize(&self) {
        if self.shared.state() != WorkerState::Started {
            debug!("engine already deinitialized");
            return;
        }
        trace!("deinitializing engine");
        {
            let mut inner = self.shared.lock_inner();
            self.shared.store_state(WorkerState::Stopping);
            self.shared.cv.notify_all();
            if let Some(wake) = inner.wake.as_mut() {
                wake.notify();
            }
        }

        let handle = self.lifecycle.lock().unwrap().worker.take();
        if let Some(handle) = handle {
            // A callback running on the worker may deinitialize the engine;
            // the worker cannot join itself, so just let it run out.
            if thread::current().id() == handle.thread().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    /// Submit a request.
    ///
    /// On acceptance the request id is returned and `callback` will fire
    /// exactly once with the terminal [`Response`](crate::Response); header
    /// lines and body chunks stream through `header_callback`,
    /// `data_callback`, and `payload` while the transfer runs. Starts the
    /// engine if it is not running yet.
    pub fn send(
        &self,
        request: Request,
        payload: Option<Box<dyn Payload>>,
        callback: Option<Callback>,
        header_callback: Option<HeaderCallback>,
        data_callback: Option<DataCallback>,
    ) -> Result<RequestId, ErrorKind> {
        if !self.shared.is_started() {
            if let Err(err) = self.initialize() {
                error!(error = %err, url = request.url(), "send failed - engine could not start");
                return Err(ErrorKind::Offline);
            }
        }

        let id = self.shared.lock_inner().next_request_id();
        self.submit(request, id, payload, callback, header_callback, data_callback)
            .map(|()| id)
    }

    fn submit(
        &self,
        request: Request,
        id: RequestId,
        payload: Option<Box<dyn Payload>>,
        callback: Option<Callback>,
        header_callback: Option<HeaderCallback>,
        data_callback: Option<DataCallback>,
    ) -> Result<(), ErrorKind> {
        if !self.shared.is_started() {
            error!(url = request.url(), "send failed - engine is offline");
            return Err(ErrorKind::Io);
        }

        let settings = request.settings().clone();
        let mut inner = self.shared.lock_inner();
        let Some(slot_index) = inner.pool.acquire(id) else {
            debug!(id, "send rejected - all transfer handles are busy");
            metrics::REQUESTS_OVERLOADED.increment();
            return Err(ErrorKind::Overload);
        };

        debug!(id, url = request.url(), "sending request");
        let configured = {
            let slot = inner.pool.slot_mut(slot_index);
            slot.max_retries = settings.retries;
            slot.transfer_timeout = settings.transfer_timeout;
            slot.callback = callback;
            match slot.easy.as_mut() {
                Some(easy) => {
                    easy.get_mut().begin_request(
                        id,
                        self.shared.config.verbose,
                        settings.skip_content,
                        settings.ignore_offset,
                        payload,
                        header_callback,
                        data_callback,
                    );
                    transfer::configure(easy, &request, &self.shared.config)
                }
                // acquire() just instantiated it; only an exhausted process
                // could leave the slot bare.
                None => Err(curl::Error::new(curl_sys::CURLE_FAILED_INIT)),
            }
        };
        if let Err(err) = configured {
            warn!(id, error = %err, "transfer setup failed");
            inner.pool.release(slot_index);
            return Err(ErrorKind::Unknown);
        }

        metrics::REQUESTS_SUBMITTED.increment();
        self.shared
            .enqueue_locked(&mut inner, Event::Send { slot: slot_index, id });
        Ok(())
    }

    /// Request cancellation of an in-flight submission. Best-effort: a
    /// transfer that already completed is left alone, silently.
    pub fn cancel(&self, id: RequestId) {
        if !self.shared.is_started() {
            error!(id, "cancel failed - engine is offline");
            return;
        }
        let mut inner = self.shared.lock_inner();
        match inner.pool.find_in_use(id) {
            Some(slot) => {
                inner.pool.slot(slot).cancelled.store(true, Ordering::Relaxed);
                trace!(id, "cancelling request");
                self.shared
                    .enqueue_locked(&mut inner, Event::Cancel { slot, id });
            }
            None => warn!(id, "cancel for unknown request"),
        }
    }

    /// True when the engine is running and at least one handle is free.
    pub fn ready(&self) -> bool {
        self.shared.is_started() && self.shared.lock_inner().pool.any_free()
    }

    /// Number of submissions currently holding a handle.
    pub fn amount_pending(&self) -> usize {
        self.shared.lock_inner().pool.count_in_use()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::REQUEST_ID_MAX;

    #[test]
    fn request_ids_wrap_at_range_end() {
        let shared = EngineShared::new(Config::default());
        let mut inner = shared.lock_inner();
        inner.next_id = REQUEST_ID_MAX;
        assert_eq!(inner.next_request_id(), REQUEST_ID_MAX);
        assert_eq!(inner.next_request_id(), REQUEST_ID_MIN);
        assert_eq!(inner.next_request_id(), REQUEST_ID_MIN + 1);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let shared = EngineShared::new(Config::default());
        let mut inner = shared.lock_inner();
        let first = inner.next_request_id();
        let second = inner.next_request_id();
        assert_eq!(first, REQUEST_ID_MIN);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn stopped_engine_reports_not_ready() {
        let engine = Engine::new(Config::default()).unwrap();
        assert!(!engine.ready());
        assert_eq!(engine.amount_pending(), 0);
    }

    #[test]
    fn cancel_on_stopped_engine_is_silent() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.cancel(42);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.max_handles = 0;
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn state_round_trip() {
        assert_eq!(WorkerState::from_u8(0), WorkerState::Stopped);
        assert_eq!(WorkerState::from_u8(1), WorkerState::Started);
        assert_eq!(WorkerState::from_u8(2), WorkerState::Stopping);
        assert_eq!(WorkerState::from_u8(200), WorkerState::Stopped);
    }
}
