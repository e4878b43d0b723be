use std::collections::HashMap;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::store::Store;
use super::{Engine, EngineError};

/// A document an operation needs to lock. Slots and swap requests share one
/// id space, so sorting by id gives a single global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Doc {
    Slot(Ulid),
    Swap(Ulid),
}

impl Doc {
    fn id(&self) -> Ulid {
        match self {
            Doc::Slot(id) | Doc::Swap(id) => *id,
        }
    }
}

fn lock_order(docs: &[Doc]) -> Vec<Doc> {
    let mut order = docs.to_vec();
    order.sort_by_key(|d| d.id());
    order.dedup();
    order
}

enum Write {
    Slot {
        id: Ulid,
        expected: SlotStatus,
        status: SlotStatus,
        owner: Option<Ulid>,
    },
    SwapStatus {
        id: Ulid,
        expected: SwapStatus,
        status: SwapStatus,
    },
}

/// Multi-document write transaction.
///
/// `begin` write-locks every document in ascending id order. Writes are
/// staged as compare-and-set operations and only touch the documents in
/// `commit`, after every expectation has been re-checked and the single
/// WAL record for the operation is durable. Dropping an uncommitted `Txn`
/// releases the locks with nothing changed.
pub(super) struct Txn {
    slots: HashMap<Ulid, OwnedRwLockWriteGuard<Slot>>,
    swaps: HashMap<Ulid, OwnedRwLockWriteGuard<SwapRequest>>,
    writes: Vec<Write>,
    created: Option<SwapRequest>,
}

impl Txn {
    /// Lock `docs`. Documents that do not exist (or were deleted while we
    /// waited) are simply absent from the transaction.
    pub(super) async fn begin(store: &Store, docs: &[Doc]) -> Self {
        let mut slots = HashMap::new();
        let mut swaps = HashMap::new();
        for doc in lock_order(docs) {
            match doc {
                Doc::Slot(id) => {
                    let Some(shared) = store.get_slot(&id) else { continue };
                    let guard = shared.clone().write_owned().await;
                    if store.is_live_slot(&id, &shared) {
                        slots.insert(id, guard);
                    }
                }
                Doc::Swap(id) => {
                    let Some(shared) = store.get_swap(&id) else { continue };
                    swaps.insert(id, shared.write_owned().await);
                }
            }
        }
        Self {
            slots,
            swaps,
            writes: Vec::new(),
            created: None,
        }
    }

    pub(super) fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.get(id).map(|g| &**g)
    }

    pub(super) fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values().map(|g| &**g)
    }

    pub(super) fn swap(&self, id: &Ulid) -> Option<&SwapRequest> {
        self.swaps.get(id).map(|g| &**g)
    }

    /// Stage `status` (and optionally a new owner) for a slot, conditional
    /// on it still being `expected` at commit.
    pub(super) fn compare_and_set_slot(
        &mut self,
        id: Ulid,
        expected: SlotStatus,
        status: SlotStatus,
        owner: Option<Ulid>,
    ) {
        self.writes.push(Write::Slot { id, expected, status, owner });
    }

    pub(super) fn compare_and_set_swap_status(
        &mut self,
        id: Ulid,
        expected: SwapStatus,
        status: SwapStatus,
    ) {
        self.writes.push(Write::SwapStatus { id, expected, status });
    }

    /// Stage a new PENDING request. It becomes visible at commit, while the
    /// slot locks are still held.
    pub(super) fn create_swap_request(
        &mut self,
        requester: Ulid,
        offered_slot: Ulid,
        requested_slot: Ulid,
        created_at: Ms,
    ) -> SwapRequest {
        let request = SwapRequest {
            id: Ulid::new(),
            requester,
            requested_slot,
            offered_slot,
            status: SwapStatus::Pending,
            created_at,
        };
        self.created = Some(request.clone());
        request
    }

    fn verify(&self) -> Result<(), EngineError> {
        for write in &self.writes {
            match write {
                Write::Slot { id, expected, .. } => match self.slots.get(id) {
                    Some(slot) if slot.status == *expected => {}
                    _ => return Err(EngineError::Conflict(*id)),
                },
                Write::SwapStatus { id, expected, .. } => match self.swaps.get(id) {
                    Some(req) if req.status == *expected => {}
                    _ => return Err(EngineError::Conflict(*id)),
                },
            }
        }
        Ok(())
    }

    /// Verify every staged write, log `event`, then apply. All or nothing.
    pub(super) async fn commit(mut self, engine: &Engine, event: &Event) -> Result<(), EngineError> {
        if let Err(e) = self.verify() {
            warn!("commit aborted: {e}");
            metrics::counter!(crate::observability::SWAP_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        engine.wal_append(event).await?;

        for write in std::mem::take(&mut self.writes) {
            match write {
                Write::Slot { id, status, owner, .. } => {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.status = status;
                        if let Some(owner) = owner {
                            slot.owner = owner;
                        }
                    }
                }
                Write::SwapStatus { id, status, .. } => {
                    if let Some(req) = self.swaps.get_mut(&id) {
                        req.status = status;
                    }
                }
            }
        }
        if let Some(request) = self.created.take() {
            engine.store.insert_swap(request);
        }
        Ok(())
    }
}

/// Read locks over a set of documents, taken in the same order as `Txn`,
/// so a projection never sees half of a commit.
pub(super) struct ReadSet {
    slots: HashMap<Ulid, OwnedRwLockReadGuard<Slot>>,
    swaps: HashMap<Ulid, OwnedRwLockReadGuard<SwapRequest>>,
}

impl ReadSet {
    pub(super) async fn acquire(store: &Store, docs: &[Doc]) -> Self {
        let mut slots = HashMap::new();
        let mut swaps = HashMap::new();
        for doc in lock_order(docs) {
            match doc {
                Doc::Slot(id) => {
                    let Some(shared) = store.get_slot(&id) else { continue };
                    let guard = shared.clone().read_owned().await;
                    if store.is_live_slot(&id, &shared) {
                        slots.insert(id, guard);
                    }
                }
                Doc::Swap(id) => {
                    let Some(shared) = store.get_swap(&id) else { continue };
                    swaps.insert(id, shared.read_owned().await);
                }
            }
        }
        Self { slots, swaps }
    }

    pub(super) fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.get(id).map(|g| &**g)
    }

    pub(super) fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values().map(|g| &**g)
    }

    pub(super) fn swap(&self, id: &Ulid) -> Option<&SwapRequest> {
        self.swaps.get(id).map(|g| &**g)
    }
}
