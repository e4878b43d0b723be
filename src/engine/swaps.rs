use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::SWAPS_TOTAL;

use super::txn::{Doc, Txn};
use super::validate::now_ms;
use super::{Engine, EngineError};

fn invalid(id: Ulid, reason: &'static str) -> EngineError {
    EngineError::InvalidSlot { id, reason }
}

impl Engine {
    /// Offer `my_slot_id` in exchange for `their_slot_id`.
    ///
    /// Both slots are locked (lowest id first) and re-validated before the
    /// request is created and both slots move `SWAPPABLE → SWAP_PENDING` in
    /// one commit. Of two concurrent proposals claiming the same slot, the
    /// second finds it `SWAP_PENDING` and fails with `InvalidSlot`.
    pub async fn propose(
        &self,
        requester: Ulid,
        my_slot_id: Ulid,
        their_slot_id: Ulid,
    ) -> Result<SwapRequest, EngineError> {
        if my_slot_id == their_slot_id {
            return Err(invalid(my_slot_id, "slot offered in exchange for itself"));
        }
        if self.store.swap_count() >= MAX_SWAPS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many swap requests"));
        }

        let _gate = self.commit_gate.read().await;
        let mut txn = Txn::begin(&self.store, &[Doc::Slot(my_slot_id), Doc::Slot(their_slot_id)]).await;

        let mine = txn
            .slot(&my_slot_id)
            .ok_or_else(|| invalid(my_slot_id, "offered slot does not exist"))?;
        if mine.owner != requester {
            return Err(invalid(my_slot_id, "offered slot is not owned by requester"));
        }
        if mine.status != SlotStatus::Swappable {
            return Err(invalid(my_slot_id, "offered slot is not swappable"));
        }
        let theirs = txn
            .slot(&their_slot_id)
            .ok_or_else(|| invalid(their_slot_id, "requested slot does not exist"))?;
        if theirs.owner == requester {
            return Err(invalid(their_slot_id, "requested slot already belongs to requester"));
        }
        if theirs.status != SlotStatus::Swappable {
            return Err(invalid(their_slot_id, "requested slot is not swappable"));
        }

        for id in [my_slot_id, their_slot_id] {
            txn.compare_and_set_slot(id, SlotStatus::Swappable, SlotStatus::SwapPending, None);
        }
        let request = txn.create_swap_request(requester, my_slot_id, their_slot_id, now_ms());
        let event = Event::SwapProposed {
            id: request.id,
            requester,
            offered_slot: my_slot_id,
            requested_slot: their_slot_id,
            created_at: request.created_at,
        };
        txn.commit(self, &event).await?;

        metrics::counter!(SWAPS_TOTAL, "outcome" => "proposed").increment(1);
        info!(
            "swap {} proposed by {requester}: {my_slot_id} for {their_slot_id}",
            request.id
        );
        Ok(request)
    }

    /// Accept or reject a pending request. Only the current owner of the
    /// requested slot may answer.
    ///
    /// Status is checked before authorization: once resolved, the requested
    /// slot may belong to someone else, and a retry must still read as
    /// `AlreadyResolved` rather than `Forbidden`.
    pub async fn respond(
        &self,
        responder: Ulid,
        request_id: Ulid,
        accept: bool,
    ) -> Result<SwapRequest, EngineError> {
        let _gate = self.commit_gate.read().await;

        // Slot ids on a request never change, so reading them unlocked is
        // enough to know what to lock.
        let (offered, requested) = {
            let shared = self
                .store
                .get_swap(&request_id)
                .ok_or(EngineError::NotFound(request_id))?;
            let req = shared.read().await;
            (req.offered_slot, req.requested_slot)
        };

        let mut txn = Txn::begin(
            &self.store,
            &[Doc::Swap(request_id), Doc::Slot(offered), Doc::Slot(requested)],
        )
        .await;

        let mut request = txn
            .swap(&request_id)
            .cloned()
            .ok_or(EngineError::NotFound(request_id))?;
        if request.status.is_terminal() {
            debug!("respond on resolved swap {request_id} by {responder}");
            return Err(EngineError::AlreadyResolved { id: request_id, status: request.status });
        }

        // A pending request always has both slots; a missing one means the
        // store no longer matches the ledger.
        let requested_owner = txn
            .slot(&requested)
            .map(|s| s.owner)
            .ok_or(EngineError::Conflict(requested))?;
        if requested_owner != responder {
            return Err(EngineError::Forbidden(request_id));
        }
        let offered_owner = txn
            .slot(&offered)
            .map(|s| s.owner)
            .ok_or(EngineError::Conflict(offered))?;
        if offered_owner != request.requester {
            return Err(EngineError::Conflict(offered));
        }

        let (slot_status, swap_status, event) = if accept {
            txn.compare_and_set_slot(offered, SlotStatus::SwapPending, SlotStatus::Busy, Some(responder));
            txn.compare_and_set_slot(
                requested,
                SlotStatus::SwapPending,
                SlotStatus::Busy,
                Some(request.requester),
            );
            let event = Event::SwapAccepted {
                id: request_id,
                requester: request.requester,
                responder,
                offered_slot: offered,
                requested_slot: requested,
            };
            (SlotStatus::Busy, SwapStatus::Accepted, event)
        } else {
            for id in [offered, requested] {
                txn.compare_and_set_slot(id, SlotStatus::SwapPending, SlotStatus::Swappable, None);
            }
            let event = Event::SwapRejected {
                id: request_id,
                offered_slot: offered,
                requested_slot: requested,
            };
            (SlotStatus::Swappable, SwapStatus::Rejected, event)
        };
        txn.compare_and_set_swap_status(request_id, SwapStatus::Pending, swap_status);
        txn.commit(self, &event).await?;

        request.status = swap_status;
        let outcome = if accept { "accepted" } else { "rejected" };
        metrics::counter!(SWAPS_TOTAL, "outcome" => outcome).increment(1);
        info!("swap {request_id} {outcome} by {responder}; slots now {slot_status}");
        Ok(request)
    }
}
