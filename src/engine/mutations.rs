use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{validate_span, validate_title};
use super::{Engine, EngineError};

impl Engine {
    pub async fn register_user(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.store.user_count() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let _gate = self.commit_gate.read().await;
        if !self.store.claim_user(id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::UserRegistered { id, name: name.clone() };
        let logged = self.wal_append(&event).await;
        if logged.is_ok() {
            self.store.insert_user(User { id, name });
        }
        self.store.release_user_claim(&id);
        logged?;
        info!("registered user {id}");
        Ok(())
    }

    /// Publish a new slot owned by `owner`. Starts `BUSY` unless the owner
    /// asks for `SWAPPABLE`.
    pub async fn create_slot(
        &self,
        owner: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        status: Option<SlotStatus>,
    ) -> Result<Slot, EngineError> {
        let span = validate_span(start, end)?;
        validate_title(&title)?;
        let status = status.unwrap_or(SlotStatus::Busy);
        if !status.is_owner_settable() {
            return Err(EngineError::InvalidTransition { from: SlotStatus::Busy, to: status });
        }
        if self.store.slot_count() >= MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let slot = Slot { id: Ulid::new(), owner, title, span, status };
        let event = Event::SlotCreated {
            id: slot.id,
            owner,
            title: slot.title.clone(),
            span,
            status,
        };
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.store.insert_slot(slot.clone());
        Ok(slot)
    }

    /// Edit title, time window or `BUSY ⇄ SWAPPABLE` status of an owned slot.
    /// Refused while the slot is part of a pending swap.
    pub async fn update_slot(
        &self,
        principal: Ulid,
        id: Ulid,
        patch: SlotPatch,
    ) -> Result<Slot, EngineError> {
        if let Some(ref title) = patch.title {
            validate_title(title)?;
        }
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_owned_slot(principal, id).await?;

        let status = patch.status.unwrap_or(guard.status);
        if !status.is_owner_settable() {
            return Err(EngineError::InvalidTransition { from: guard.status, to: status });
        }
        let span = validate_span(
            patch.start.unwrap_or(guard.span.start),
            patch.end.unwrap_or(guard.span.end),
        )?;
        let title = patch.title.unwrap_or_else(|| guard.title.clone());

        let event = Event::SlotUpdated { id, title: title.clone(), span, status };
        self.wal_append(&event).await?;
        guard.title = title;
        guard.span = span;
        guard.status = status;
        Ok(guard.clone())
    }

    pub async fn delete_slot(&self, principal: Ulid, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = self.lock_owned_slot(principal, id).await?;

        let event = Event::SlotDeleted { id };
        self.wal_append(&event).await?;
        // Removed while still locked: anyone queued on this document sees it
        // as gone once they get the lock.
        self.store.remove_slot(&id);
        drop(guard);
        info!("slot {id} deleted by {principal}");
        Ok(())
    }

    /// Write-lock a live slot owned by `principal` that is not mid-swap.
    async fn lock_owned_slot(
        &self,
        principal: Ulid,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Slot>, EngineError> {
        let shared = self.store.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.clone().write_owned().await;
        if !self.store.is_live_slot(&id, &shared) {
            return Err(EngineError::NotFound(id));
        }
        if guard.owner != principal {
            return Err(EngineError::Forbidden(id));
        }
        if guard.status == SlotStatus::SwapPending {
            return Err(EngineError::SlotPending(id));
        }
        Ok(guard)
    }
}
