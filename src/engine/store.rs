use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

pub type SharedSlot = Arc<RwLock<Slot>>;
pub type SharedSwap = Arc<RwLock<SwapRequest>>;

/// Slot store, swap ledger and user directory for one tenant.
///
/// Every slot and swap request is its own document behind its own lock.
/// The maps only hand out handles; reads and writes go through the
/// document locks.
pub struct Store {
    slots: DashMap<Ulid, SharedSlot>,
    swaps: DashMap<Ulid, SharedSwap>,
    users: DashMap<Ulid, User>,
    /// Ids with a registration in flight, between the check and the insert.
    claimed_users: DashMap<Ulid, ()>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            swaps: DashMap::new(),
            users: DashMap::new(),
            claimed_users: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert_slot(&self, slot: Slot) {
        self.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
    }

    pub fn remove_slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.remove(id).map(|(_, shared)| shared)
    }

    /// True if `shared` is still the document stored under `id`. A handle
    /// taken before a concurrent delete stays lockable but is no longer live.
    pub fn is_live_slot(&self, id: &Ulid, shared: &SharedSlot) -> bool {
        self.slots.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    pub fn slot_ids(&self) -> Vec<Ulid> {
        self.slots.iter().map(|e| *e.key()).collect()
    }

    pub fn slot_handles(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    // ── Swap ledger ──────────────────────────────────────────

    pub fn swap_count(&self) -> usize {
        self.swaps.len()
    }

    pub fn get_swap(&self, id: &Ulid) -> Option<SharedSwap> {
        self.swaps.get(id).map(|e| e.value().clone())
    }

    pub fn insert_swap(&self, request: SwapRequest) {
        self.swaps.insert(request.id, Arc::new(RwLock::new(request)));
    }

    pub fn swap_handles(&self) -> Vec<SharedSwap> {
        self.swaps.iter().map(|e| e.value().clone()).collect()
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Reserve `id` for one registration. False if the id is already
    /// registered or another registration holds it. The holder must insert
    /// the user before calling `release_user_claim`.
    pub fn claim_user(&self, id: Ulid) -> bool {
        match self.claimed_users.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if self.users.contains_key(&id) {
                    return false;
                }
                slot.insert(());
                true
            }
        }
    }

    pub fn release_user_claim(&self, id: &Ulid) {
        self.claimed_users.remove(id);
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn user_name(&self, id: &Ulid) -> Option<String> {
        self.users.get(id).map(|u| u.name.clone())
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a logged event during startup replay. The store is not shared
    /// yet, so every `try_write` is uncontended.
    pub fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name } => {
                self.insert_user(User { id: *id, name: name.clone() });
            }
            Event::SlotCreated { id, owner, title, span, status } => {
                self.insert_slot(Slot {
                    id: *id,
                    owner: *owner,
                    title: title.clone(),
                    span: *span,
                    status: *status,
                });
            }
            Event::SlotUpdated { id, title, span, status } => {
                self.with_slot(id, |slot| {
                    slot.title = title.clone();
                    slot.span = *span;
                    slot.status = *status;
                });
            }
            Event::SlotDeleted { id } => {
                self.remove_slot(id);
            }
            Event::SwapProposed { id, requester, offered_slot, requested_slot, created_at } => {
                for slot_id in [offered_slot, requested_slot] {
                    self.with_slot(slot_id, |slot| slot.status = SlotStatus::SwapPending);
                }
                self.insert_swap(SwapRequest {
                    id: *id,
                    requester: *requester,
                    requested_slot: *requested_slot,
                    offered_slot: *offered_slot,
                    status: SwapStatus::Pending,
                    created_at: *created_at,
                });
            }
            Event::SwapAccepted { id, requester, responder, offered_slot, requested_slot } => {
                self.with_slot(offered_slot, |slot| {
                    slot.owner = *responder;
                    slot.status = SlotStatus::Busy;
                });
                self.with_slot(requested_slot, |slot| {
                    slot.owner = *requester;
                    slot.status = SlotStatus::Busy;
                });
                self.with_swap(id, |req| req.status = SwapStatus::Accepted);
            }
            Event::SwapRejected { id, offered_slot, requested_slot } => {
                for slot_id in [offered_slot, requested_slot] {
                    self.with_slot(slot_id, |slot| slot.status = SlotStatus::Swappable);
                }
                self.with_swap(id, |req| req.status = SwapStatus::Rejected);
            }
            Event::SwapRecorded { request } => {
                self.insert_swap(request.clone());
            }
        }
    }

    fn with_slot(&self, id: &Ulid, f: impl FnOnce(&mut Slot)) {
        let Some(shared) = self.get_slot(id) else {
            warn!("replay: event for unknown slot {id}");
            return;
        };
        match shared.try_write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => warn!("replay: slot {id} unexpectedly locked"),
        }
    }

    fn with_swap(&self, id: &Ulid, f: impl FnOnce(&mut SwapRequest)) {
        let Some(shared) = self.get_swap(id) else {
            warn!("replay: event for unknown swap request {id}");
            return;
        };
        match shared.try_write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => warn!("replay: swap request {id} unexpectedly locked"),
        }
    }
}
