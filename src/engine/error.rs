use ulid::Ulid;

use crate::model::{Ms, SlotStatus, SwapStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Referenced slot or swap request does not exist.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A `propose` precondition on ownership, status or self-reference failed.
    InvalidSlot { id: Ulid, reason: &'static str },
    /// The principal may not act on this slot or request.
    Forbidden(Ulid),
    /// `respond` on a request that is no longer PENDING.
    AlreadyResolved { id: Ulid, status: SwapStatus },
    /// Compare-and-set mismatch at commit. Retry from a fresh read.
    Conflict(Ulid),
    /// Owner tried to modify a slot that is part of a pending swap.
    SlotPending(Ulid),
    InvalidTransition { from: SlotStatus, to: SlotStatus },
    InvalidSpan { start: Ms, end: Ms },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// `Conflict` is the only failure worth retrying with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidSlot { id, reason } => write!(f, "invalid slot {id}: {reason}"),
            EngineError::Forbidden(id) => write!(f, "forbidden: {id}"),
            EngineError::AlreadyResolved { id, status } => {
                write!(f, "swap request {id} already resolved: {status}")
            }
            EngineError::Conflict(id) => write!(f, "concurrent update on {id}, retry"),
            EngineError::SlotPending(id) => write!(f, "slot {id} has a pending swap"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition {from} -> {to}")
            }
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid time window [{start}, {end})")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_is_retryable() {
        let id = Ulid::new();
        assert!(EngineError::Conflict(id).is_retryable());
        assert!(!EngineError::NotFound(id).is_retryable());
        assert!(!EngineError::Forbidden(id).is_retryable());
        assert!(!EngineError::InvalidSlot { id, reason: "x" }.is_retryable());
        assert!(
            !EngineError::AlreadyResolved { id, status: SwapStatus::Accepted }.is_retryable()
        );
    }

    #[test]
    fn display_names_the_status() {
        let id = Ulid::new();
        let msg = EngineError::AlreadyResolved { id, status: SwapStatus::Rejected }.to_string();
        assert!(msg.contains("REJECTED"));
        assert!(msg.contains(&id.to_string()));
    }
}
