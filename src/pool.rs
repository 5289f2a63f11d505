//! Bounded pool of reusable transfer handles.
//!
//! Slots below the resident count keep their native handle for the engine's
//! lifetime; the rest create one lazily on first use and give it back after
//! [`HANDLE_REUSE_TIMEOUT`] of idleness. All slot metadata is guarded by the
//! engine mutex; the worker additionally owns whichever native handles are
//! currently attached to the multi.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use curl::easy::Easy2;
use tracing::{debug, trace};

use crate::engine::EngineShared;
use crate::response::{Callback, RequestId};
use crate::transfer::TransferSink;

/// Idle time after which a non-resident slot's native handle is destroyed.
pub(crate) const HANDLE_REUSE_TIMEOUT: Duration = Duration::from_secs(120);

/// One pool entry: engine bookkeeping plus the native transfer handle.
///
/// `easy` is `None` while the transfer is attached to the multi (the worker
/// holds it then) and for lazy slots with no native handle instantiated.
pub(crate) struct HandleSlot {
    pub(crate) index: usize,
    pub(crate) in_use: bool,
    pub(crate) id: RequestId,
    /// Shared with the slot's sink so cancellation is visible to the
    /// trampolines without taking the engine mutex.
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) transfer_timeout: Duration,
    /// Set at acquisition; doubles as the idle timestamp for expiry.
    pub(crate) send_time: Instant,
    pub(crate) callback: Option<Callback>,
    pub(crate) easy: Option<Easy2<TransferSink>>,
}

pub(crate) struct HandlePool {
    engine: Weak<EngineShared>,
    slots: Vec<HandleSlot>,
    static_count: usize,
}

impl HandlePool {
    pub(crate) fn new(
        max_handles: usize,
        static_count: usize,
        engine: Weak<EngineShared>,
    ) -> Self {
        let slots = (0..max_handles)
            .map(|index| HandleSlot {
                index,
                in_use: false,
                id: 0,
                cancelled: Arc::new(AtomicBool::new(false)),
                retry_count: 0,
                max_retries: 0,
                transfer_timeout: Duration::from_secs(30),
                send_time: Instant::now(),
                callback: None,
                easy: None,
            })
            .collect();
        HandlePool {
            engine,
            slots,
            static_count,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn static_count(&self) -> usize {
        self.static_count
    }

    pub(crate) fn slot(&self, index: usize) -> &HandleSlot {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut HandleSlot {
        &mut self.slots[index]
    }

    /// The slot still belongs to the submission an event was posted for.
    pub(crate) fn is_current(&self, index: usize, id: RequestId) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.in_use && slot.id == id)
    }

    pub(crate) fn find_in_use(&self, id: RequestId) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.in_use && slot.id == id)
            .map(|slot| slot.index)
    }

    pub(crate) fn any_in_use(&self) -> bool {
        self.slots.iter().any(|slot| slot.in_use)
    }

    pub(crate) fn count_in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    pub(crate) fn any_free(&self) -> bool {
        self.slots.iter().any(|slot| !slot.in_use)
    }

    pub(crate) fn has_native(&self, index: usize) -> bool {
        self.slots[index].easy.is_some()
    }

    pub(crate) fn take_easy(&mut self, index: usize) -> Option<Easy2<TransferSink>> {
        self.slots[index].easy.take()
    }

    pub(crate) fn put_easy(&mut self, index: usize, easy: Easy2<TransferSink>) {
        self.slots[index].easy = Some(easy);
    }

    /// Instantiate the native handles of the resident slots.
    pub(crate) fn init_resident(&mut self) {
        let engine = self.engine.clone();
        for slot in &mut self.slots[..self.static_count] {
            if slot.easy.is_none() {
                slot.easy = Some(new_native(engine.clone(), slot.cancelled.clone()));
            }
        }
    }

    /// Return every slot to its pristine state. Used when (re)initializing
    /// the engine.
    pub(crate) fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.in_use = false;
            slot.id = 0;
            slot.cancelled.store(false, Ordering::Relaxed);
            slot.retry_count = 0;
            slot.callback = None;
            slot.easy = None;
        }
    }

    /// Claim the first free slot for a new submission and reset its
    /// per-request state. Returns `None` when every slot is busy.
    pub(crate) fn acquire(&mut self, id: RequestId) -> Option<usize> {
        let engine = self.engine.clone();
        for slot in &mut self.slots {
            if slot.in_use {
                continue;
            }
            if slot.easy.is_none() {
                trace!(slot = slot.index, "instantiating native handle");
                slot.easy = Some(new_native(engine.clone(), slot.cancelled.clone()));
            }
            slot.in_use = true;
            slot.id = id;
            slot.retry_count = 0;
            slot.max_retries = 3;
            slot.transfer_timeout = Duration::from_secs(30);
            slot.cancelled.store(false, Ordering::Relaxed);
            slot.send_time = Instant::now();
            return Some(slot.index);
        }
        None
    }

    /// Release a slot back to the pool: reset the native handle, drop the
    /// submission's callbacks and payload, then clear `in_use`. Must run
    /// under the engine mutex so the two steps are one critical section.
    pub(crate) fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(easy) = slot.easy.as_mut() {
            easy.reset();
            easy.get_mut().clear_request();
        }
        slot.callback = None;
        slot.in_use = false;
    }

    /// Drop the native handle of every non-resident slot that has sat idle
    /// past [`HANDLE_REUSE_TIMEOUT`].
    pub(crate) fn expire_idle(&mut self, now: Instant) {
        for slot in &mut self.slots[self.static_count..] {
            if !slot.in_use
                && slot.easy.is_some()
                && now.duration_since(slot.send_time) > HANDLE_REUSE_TIMEOUT
            {
                debug!(slot = slot.index, "dropping idle native handle");
                slot.easy = None;
            }
        }
    }
}

fn new_native(engine: Weak<EngineShared>, cancelled: Arc<AtomicBool>) -> Easy2<TransferSink> {
    Easy2::new(TransferSink::new(engine, cancelled))
}
