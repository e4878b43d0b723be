use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::txn::{Doc, ReadSet};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let shared = self.store.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let slot = shared.read().await.clone();
        Ok(slot)
    }

    pub async fn get_swap_request(&self, id: Ulid) -> Result<SwapRequest, EngineError> {
        let shared = self.store.get_swap(&id).ok_or(EngineError::NotFound(id))?;
        let request = shared.read().await.clone();
        Ok(request)
    }

    /// Every committed slot, unordered. All slots are read under one
    /// `ReadSet`, so a swap commit is either wholly visible or not at all.
    async fn snapshot_slots(&self) -> Vec<Slot> {
        let docs: Vec<Doc> = self.store.slot_ids().into_iter().map(Doc::Slot).collect();
        let reads = ReadSet::acquire(&self.store, &docs).await;
        reads.slots().cloned().collect()
    }

    /// Slots currently owned by `owner`, earliest first.
    pub async fn list_slots(&self, owner: Ulid) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .snapshot_slots()
            .await
            .into_iter()
            .filter(|s| s.owner == owner)
            .collect();
        slots.sort_by_key(|s| (s.span.start, s.id));
        slots
    }

    /// The marketplace: every `SWAPPABLE` slot with its owner's name.
    pub async fn list_swappable(&self) -> Vec<SwappableSlot> {
        let mut slots: Vec<SwappableSlot> = self
            .snapshot_slots()
            .await
            .into_iter()
            .filter(|s| s.status == SlotStatus::Swappable)
            .map(|slot| SwappableSlot {
                owner_name: self.store.user_name(&slot.owner),
                slot,
            })
            .collect();
        slots.sort_by_key(|s| (s.slot.span.start, s.slot.id));
        slots
    }

    /// Requests touching a slot `user` currently owns, on either side,
    /// excluding the ones `user` made. Newest first.
    pub async fn list_incoming(&self, user: Ulid) -> Vec<SwapView> {
        self.collect_views(|view| {
            view.request.requester != user
                && (view.offered.as_ref().is_some_and(|s| s.owner == user)
                    || view.requested.as_ref().is_some_and(|s| s.owner == user))
        })
        .await
    }

    /// Requests made by `user`. Newest first.
    pub async fn list_outgoing(&self, user: Ulid) -> Vec<SwapView> {
        self.collect_views(|view| view.request.requester == user).await
    }

    async fn collect_views(&self, keep: impl Fn(&SwapView) -> bool) -> Vec<SwapView> {
        let mut views = Vec::new();
        for shared in self.store.swap_handles() {
            let (id, offered, requested) = {
                let req = shared.read().await;
                (req.id, req.offered_slot, req.requested_slot)
            };
            if let Some(view) = self.resolve_view(id, offered, requested).await
                && keep(&view)
            {
                views.push(view);
            }
        }
        views.sort_by_key(|v| Reverse((v.request.created_at, v.request.id)));
        views
    }

    /// Read a request and both its slots under one set of read locks.
    async fn resolve_view(&self, id: Ulid, offered: Ulid, requested: Ulid) -> Option<SwapView> {
        let reads = ReadSet::acquire(
            &self.store,
            &[Doc::Swap(id), Doc::Slot(offered), Doc::Slot(requested)],
        )
        .await;
        let request = reads.swap(&id)?.clone();
        Some(SwapView {
            requester_name: self.store.user_name(&request.requester),
            offered: reads.slot(&offered).cloned(),
            requested: reads.slot(&requested).cloned(),
            request,
        })
    }
}
