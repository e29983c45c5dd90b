//! Hand-off of fetch results from the dispatch callback to the waiter.
//!
//! A [`PendingFetch`] is the single-use slot one fetch waits on. The
//! callback running inside the source's dispatch pump writes into it, the
//! fetch operation reads from it, and both sides go through the same lock.
//! A condition variable wakes the waiter as soon as the slot settles, so
//! the waiter no longer depends on somebody pumping again to notice.
//!
//! # Write protocol
//!
//! 1. Ignore the response unless its request id is the slot's expected id.
//! 2. Under the lock, ignore it unless the slot is still waiting. This
//!    covers duplicates and responses that arrive after the waiter gave up.
//! 3. Copy exactly `payload_size` bytes, mark the slot received, notify.
//!
//! A payload shorter than `payload_size` is never over-read; it settles the
//! slot as failed instead.
//!
//! The [`PendingRegistry`] maps request ids to the slots currently being
//! waited on so the dispatch callback can find the right one. Its lock is
//! released before a slot's lock is taken.
//!
//! # Stale responses
//!
//! Every entry reuses its request id, so a response owed to a fetch that
//! timed out carries the same id as the next fetch for that entry. When a
//! guard drops after its request went out but before an answer arrived, the
//! registry records one stale response for that id. The next matching
//! response is discarded instead of being offered to a newer slot. Stale
//! records expire after [`DEFAULT_STALE_TTL`] so a source that dropped the
//! request cannot starve later fetches forever.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::ids::RequestId;

/// How long a timed-out fetch's response is still expected.
pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(10);

/// Why a slot settled without data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFailure {
    /// The matching response carried fewer bytes than the entry declares.
    ShortPayload {
        /// Bytes the entry declares.
        expected: usize,
        /// Bytes the response carried.
        actual: usize,
    },
    /// The source went away before answering.
    Disconnected,
}

/// What happened to a response offered to a slot or the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The response filled the slot.
    Accepted,
    /// The response's request id belongs to some other fetch.
    Foreign,
    /// Nobody is waiting on this request id.
    Unclaimed,
    /// The slot had already settled.
    Duplicate,
    /// The waiter gave up before the response arrived.
    Abandoned,
    /// The response was too short and failed the slot.
    ShortPayload,
}

/// Result of waiting on a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The payload, exactly `payload_size` bytes long.
    Ready(Vec<u8>),
    /// The slot settled without data.
    Failed(SlotFailure),
    /// Nothing arrived before the wait ended.
    Pending,
}

/// Error returned when a request id already has a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a fetch tagged {request_id} is already in flight")]
pub struct InFlight {
    /// The contested request id.
    pub request_id: RequestId,
}

#[derive(Debug)]
struct SlotState {
    requested: bool,
    received: bool,
    abandoned: bool,
    failure: Option<SlotFailure>,
    buffer: Vec<u8>,
}

impl SlotState {
    const fn is_settled(&self) -> bool {
        self.received || self.failure.is_some()
    }
}

/// A single in-flight fetch waiting for its response.
#[derive(Debug)]
pub struct PendingFetch {
    expected: RequestId,
    payload_size: usize,
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl PendingFetch {
    /// Create a fresh, unsettled slot.
    pub fn new(expected: RequestId, payload_size: usize) -> Self {
        Self {
            expected,
            payload_size,
            state: Mutex::new(SlotState {
                requested: false,
                received: false,
                abandoned: false,
                failure: None,
                buffer: vec![0; payload_size],
            }),
            settled: Condvar::new(),
        }
    }

    /// Request id this slot accepts.
    pub const fn expected(&self) -> RequestId {
        self.expected
    }

    /// Bytes copied out of the accepted response.
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a response to this slot. Only a response tagged with the
    /// expected id can settle it, and only once.
    pub fn offer(&self, request_id: RequestId, payload: &[u8]) -> Delivery {
        if request_id != self.expected {
            return Delivery::Foreign;
        }

        let mut state = self.lock();
        if state.abandoned {
            return Delivery::Abandoned;
        }
        if state.is_settled() {
            return Delivery::Duplicate;
        }

        let Some(bytes) = payload.get(..self.payload_size) else {
            state.failure = Some(SlotFailure::ShortPayload {
                expected: self.payload_size,
                actual: payload.len(),
            });
            self.settled.notify_all();
            return Delivery::ShortPayload;
        };

        state.buffer.copy_from_slice(bytes);
        state.received = true;
        self.settled.notify_all();
        Delivery::Accepted
    }

    /// Settle the slot as failed. Returns `false` if it had already settled
    /// or been abandoned.
    pub fn fail(&self, failure: SlotFailure) -> bool {
        let mut state = self.lock();
        if state.abandoned || state.is_settled() {
            return false;
        }
        state.failure = Some(failure);
        self.settled.notify_all();
        true
    }

    /// Record that the request for this slot reached the source, so a
    /// response is owed.
    pub fn mark_requested(&self) {
        self.lock().requested = true;
    }

    /// Mark the slot as given up. Later offers are discarded.
    ///
    /// Returns `true` if a response is still owed: the request went out and
    /// the slot never settled.
    pub fn abandon(&self) -> bool {
        let mut state = self.lock();
        if state.is_settled() {
            return false;
        }
        state.abandoned = true;
        state.requested
    }

    /// Whether a matching response has been accepted.
    pub fn is_received(&self) -> bool {
        self.lock().received
    }

    /// Block until the slot settles or `deadline` passes.
    ///
    /// Once received, the payload stays in the slot; every call after that
    /// returns the same bytes.
    pub fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = Self::settled_outcome(&state) {
                return outcome;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::Pending;
            }
            state = self
                .settled
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Block for at most `slice`.
    pub fn wait_for(&self, slice: Duration) -> WaitOutcome {
        let deadline = Instant::now()
            .checked_add(slice)
            .unwrap_or_else(Instant::now);
        self.wait_until(deadline)
    }

    fn settled_outcome(state: &SlotState) -> Option<WaitOutcome> {
        if let Some(failure) = state.failure {
            return Some(WaitOutcome::Failed(failure));
        }
        if state.received {
            return Some(WaitOutcome::Ready(state.buffer.clone()));
        }
        None
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    slots: BTreeMap<RequestId, Arc<PendingFetch>>,
    /// Per id, when each owed-but-abandoned response stops being expected,
    /// oldest first.
    stale: BTreeMap<RequestId, VecDeque<Instant>>,
}

impl RegistryState {
    /// Consume one unexpired stale record for `request_id`, if any.
    fn take_stale(&mut self, request_id: RequestId, now: Instant) -> bool {
        let Some(owed) = self.stale.get_mut(&request_id) else {
            return false;
        };
        while owed.front().is_some_and(|expires| *expires <= now) {
            owed.pop_front();
        }
        let taken = owed.pop_front().is_some();
        if owed.is_empty() {
            self.stale.remove(&request_id);
        }
        taken
    }
}

/// Slots currently being waited on, keyed by request id.
#[derive(Debug)]
pub struct PendingRegistry {
    state: Mutex<RegistryState>,
    stale_ttl: Duration,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::with_stale_ttl(DEFAULT_STALE_TTL)
    }
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose stale records last `stale_ttl`.
    pub fn with_stale_ttl(stale_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            stale_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh slot for `request_id`.
    ///
    /// The returned guard removes and abandons the slot when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`InFlight`] if the id already has a waiter.
    pub fn open(
        self: &Arc<Self>,
        request_id: RequestId,
        payload_size: usize,
    ) -> Result<PendingGuard, InFlight> {
        let mut state = self.lock();
        if state.slots.contains_key(&request_id) {
            return Err(InFlight { request_id });
        }
        let slot = Arc::new(PendingFetch::new(request_id, payload_size));
        state.slots.insert(request_id, Arc::clone(&slot));
        Ok(PendingGuard {
            registry: Arc::clone(self),
            slot,
        })
    }

    /// Route a data response to the slot waiting on its request id.
    ///
    /// A response still owed to an abandoned fetch is discarded first, even
    /// when a newer slot is waiting on the same id.
    pub fn deliver(&self, request_id: RequestId, payload: &[u8]) -> Delivery {
        let slot = {
            let mut state = self.lock();
            if state.take_stale(request_id, Instant::now()) {
                return Delivery::Abandoned;
            }
            state.slots.get(&request_id).cloned()
        };
        slot.map_or(Delivery::Unclaimed, |slot| slot.offer(request_id, payload))
    }

    /// Fail every waiting slot. Returns how many were settled.
    pub fn fail_all(&self, failure: SlotFailure) -> usize {
        let slots: Vec<Arc<PendingFetch>> = self.lock().slots.values().cloned().collect();
        slots.iter().filter(|slot| slot.fail(failure)).count()
    }

    /// Number of slots being waited on.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether nothing is being waited on.
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Responses still owed to abandoned fetches on `request_id`.
    pub fn stale_count(&self, request_id: RequestId) -> usize {
        let now = Instant::now();
        self.lock()
            .stale
            .get(&request_id)
            .map_or(0, |owed| owed.iter().filter(|expires| **expires > now).count())
    }

    fn release(&self, slot: &Arc<PendingFetch>, owed: bool) {
        let mut state = self.lock();
        let id = slot.expected();
        if state
            .slots
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            state.slots.remove(&id);
        }
        if owed {
            let now = Instant::now();
            let expires = now.checked_add(self.stale_ttl).unwrap_or(now);
            state.stale.entry(id).or_default().push_back(expires);
        }
    }
}

/// Ownership of one registered slot.
#[derive(Debug)]
pub struct PendingGuard {
    registry: Arc<PendingRegistry>,
    slot: Arc<PendingFetch>,
}

impl PendingGuard {
    /// The slot this guard owns.
    pub fn slot(&self) -> &PendingFetch {
        &self.slot
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let owed = self.slot.abandon();
        self.registry.release(&self.slot, owed);
    }
}
