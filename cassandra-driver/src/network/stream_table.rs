//! Per-connection table of stream ids and the requests waiting on them.
//!
//! A version 1 connection carries at most 128 concurrent streams. Stream 0 is
//! kept for connection management traffic and is never handed out by
//! [`StreamTable::acquire`]; the remaining 127 ids are shared by user requests.

use std::sync::{Arc, Mutex};

use tracing::trace;

/// Number of stream ids in a version 1 frame header (non-negative `i8` values).
pub const MAX_STREAMS: usize = 128;

/// A stream id in `[0, MAX_STREAMS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u8);

impl StreamId {
    /// The management stream.
    pub const MANAGEMENT: StreamId = StreamId(0);

    /// Panics if `id` is outside `[0, MAX_STREAMS)`.
    pub fn new(id: usize) -> StreamId {
        assert!(
            id < MAX_STREAMS,
            "stream id {} out of range [0, {})",
            id,
            MAX_STREAMS
        );
        StreamId(id as u8)
    }

    /// Maps a header stream field to an id, if it names a request stream.
    pub fn from_header(stream: i8) -> Option<StreamId> {
        u8::try_from(stream).ok().map(StreamId)
    }

    pub fn as_i8(self) -> i8 {
        self.0 as i8
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

enum Slot<H> {
    Free,
    Acquired,
    Pending(H),
    /// Its request was abandoned before the response came back. The id stays
    /// taken until the server answers it, so it cannot be matched to a newer request.
    Orphaned,
}

impl<H> Slot<H> {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

struct Slots<H> {
    slots: Vec<Slot<H>>,
    in_use: usize,
}

/// Thread-safe stream id allocator with one response handler slot per id.
pub struct StreamTable<H> {
    inner: Mutex<Slots<H>>,
}

impl<H> Default for StreamTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> StreamTable<H> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_STREAMS);
        slots.resize_with(MAX_STREAMS, || Slot::Free);
        // The management stream is never given out.
        slots[0] = Slot::Acquired;
        Self {
            inner: Mutex::new(Slots { slots, in_use: 0 }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<H>> {
        // Critical sections never panic halfway through an update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a free stream id, or returns `None` when all 127 are taken.
    pub fn acquire(&self) -> Option<StreamId> {
        let mut inner = self.lock();
        let index = inner.slots.iter().position(Slot::is_free)?;
        inner.slots[index] = Slot::Acquired;
        inner.in_use += 1;
        Some(StreamId(index as u8))
    }

    /// Returns `id` to the free set and drops its handler, if any.
    /// Releasing a free id does nothing.
    pub fn release(&self, id: StreamId) {
        let index = id.index();
        if index == 0 {
            let mut inner = self.lock();
            if matches!(inner.slots[0], Slot::Pending(_)) {
                inner.slots[0] = Slot::Acquired;
            }
            return;
        }
        let mut inner = self.lock();
        if !inner.slots[index].is_free() {
            inner.slots[index] = Slot::Free;
            inner.in_use -= 1;
        }
    }

    /// Like [`StreamTable::release`], except that an id whose handler is still
    /// registered is only freed once the late response for it has been read.
    pub fn abandon(&self, id: StreamId) {
        let mut inner = self.lock();
        let index = id.index();
        match inner.slots[index] {
            Slot::Pending(_) if index != 0 => {
                trace!(stream = index, "Orphaning stream");
                inner.slots[index] = Slot::Orphaned;
            }
            Slot::Pending(_) => inner.slots[0] = Slot::Acquired,
            Slot::Acquired if index != 0 => {
                inner.slots[index] = Slot::Free;
                inner.in_use -= 1;
            }
            _ => {}
        }
    }

    /// Registers the handler waiting for the response on `id`.
    pub fn set_pending(&self, id: StreamId, handler: H) {
        let mut inner = self.lock();
        let slot = &mut inner.slots[id.index()];
        debug_assert!(!slot.is_free(), "set_pending on a free stream");
        *slot = Slot::Pending(handler);
    }

    /// Removes and returns the handler registered on `id`. Whoever takes it
    /// first completes the request; everyone else gets `None`.
    pub fn take_pending(&self, id: StreamId) -> Option<H> {
        let mut inner = self.lock();
        let index = id.index();
        match std::mem::replace(&mut inner.slots[index], Slot::Free) {
            Slot::Pending(handler) => {
                inner.slots[index] = Slot::Acquired;
                Some(handler)
            }
            Slot::Orphaned => {
                // The late answer to an abandoned request has arrived.
                inner.in_use -= 1;
                None
            }
            other => {
                inner.slots[index] = other;
                None
            }
        }
    }

    pub fn has_pending(&self, id: StreamId) -> bool {
        matches!(self.lock().slots[id.index()], Slot::Pending(_))
    }

    /// Takes every registered handler, e.g. to fail them when the connection dies.
    pub fn take_all_pending(&self) -> Vec<(StreamId, H)> {
        let mut inner = self.lock();
        let mut taken = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Pending(_)) {
                if let Slot::Pending(handler) = std::mem::replace(slot, Slot::Acquired) {
                    taken.push((StreamId(index as u8), handler));
                }
            }
        }
        taken
    }

    /// Number of user stream ids currently taken.
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Frees ids held only for late responses. Used once the socket those
    /// responses would have come from is gone.
    pub(crate) fn clear_orphans(&self) {
        let mut inner = self.lock();
        let mut cleared = 0;
        for slot in inner.slots.iter_mut() {
            if matches!(slot, Slot::Orphaned) {
                *slot = Slot::Free;
                cleared += 1;
            }
        }
        inner.in_use -= cleared;
    }
}

/// Owns an acquired stream id and gives it back to its table when dropped.
pub struct StreamGuard<H> {
    table: Arc<StreamTable<H>>,
    id: StreamId,
}

impl<H> StreamGuard<H> {
    pub fn acquire(table: &Arc<StreamTable<H>>) -> Option<Self> {
        let id = table.acquire()?;
        Some(Self {
            table: Arc::clone(table),
            id,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn belongs_to(&self, table: &Arc<StreamTable<H>>) -> bool {
        Arc::ptr_eq(&self.table, table)
    }
}

impl<H> Drop for StreamGuard<H> {
    fn drop(&mut self) {
        self.table.abandon(self.id);
    }
}

impl<H> std::fmt::Debug for StreamGuard<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGuard").field("id", &self.id).finish()
    }
}
