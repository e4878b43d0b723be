use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }
}

/// Availability of a slot.
///
/// `SwapPending` is entered and left only by the swap engine; owners can
/// only move between `Busy` and `Swappable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Busy,
    Swappable,
    SwapPending,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Busy => "BUSY",
            SlotStatus::Swappable => "SWAPPABLE",
            SlotStatus::SwapPending => "SWAP_PENDING",
        }
    }

    /// Statuses an owner may set directly.
    pub fn is_owner_settable(&self) -> bool {
        matches!(self, SlotStatus::Busy | SlotStatus::Swappable)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUSY" => Ok(SlotStatus::Busy),
            "SWAPPABLE" => Ok(SlotStatus::Swappable),
            "SWAP_PENDING" => Ok(SlotStatus::SwapPending),
            other => Err(format!("unknown slot status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapStatus {
    Pending,
    Accepted,
    Rejected,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "PENDING",
            SwapStatus::Accepted => "ACCEPTED",
            SwapStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SwapStatus::Pending)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SwapStatus::Pending),
            "ACCEPTED" => Ok(SwapStatus::Accepted),
            "REJECTED" => Ok(SwapStatus::Rejected),
            other => Err(format!("unknown swap status: {other}")),
        }
    }
}

/// A bookable time interval owned by exactly one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub owner: Ulid,
    pub title: String,
    pub span: Span,
    pub status: SlotStatus,
}

/// A proposal to exchange ownership of `offered_slot` (the requester's)
/// for `requested_slot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub id: Ulid,
    pub requester: Ulid,
    pub requested_slot: Ulid,
    pub offered_slot: Ulid,
    pub status: SwapStatus,
    pub created_at: Ms,
}

impl SwapRequest {
    pub fn references(&self, slot_id: &Ulid) -> bool {
        self.offered_slot == *slot_id || self.requested_slot == *slot_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
}

/// WAL record format. One flat event per committed operation.
///
/// Every engine operation writes exactly one event, so a multi-document
/// swap is replayed whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
    },
    SlotCreated {
        id: Ulid,
        owner: Ulid,
        title: String,
        span: Span,
        status: SlotStatus,
    },
    SlotUpdated {
        id: Ulid,
        title: String,
        span: Span,
        status: SlotStatus,
    },
    SlotDeleted {
        id: Ulid,
    },
    SwapProposed {
        id: Ulid,
        requester: Ulid,
        offered_slot: Ulid,
        requested_slot: Ulid,
        created_at: Ms,
    },
    /// `offered_slot` passes to `responder`, `requested_slot` to `requester`.
    SwapAccepted {
        id: Ulid,
        requester: Ulid,
        responder: Ulid,
        offered_slot: Ulid,
        requested_slot: Ulid,
    },
    SwapRejected {
        id: Ulid,
        offered_slot: Ulid,
        requested_slot: Ulid,
    },
    /// Ledger entry restored verbatim by compaction; touches no slot.
    SwapRecorded {
        request: SwapRequest,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwappableSlot {
    pub slot: Slot,
    pub owner_name: Option<String>,
}

/// A swap request resolved with both referenced slots and the requester's
/// display name. A slot is `None` once it has been deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapView {
    pub request: SwapRequest,
    pub requester_name: Option<String>,
    pub offered: Option<Slot>,
    pub requested: Option<Slot>,
}

/// Owner-side edit of a slot. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub title: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<SlotStatus>,
}

impl SlotPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.start.is_none() && self.end.is_none() && self.status.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_status_parses_case_insensitive() {
        assert_eq!("swappable".parse::<SlotStatus>().unwrap(), SlotStatus::Swappable);
        assert_eq!("SWAP_PENDING".parse::<SlotStatus>().unwrap(), SlotStatus::SwapPending);
        assert!("free".parse::<SlotStatus>().is_err());
    }

    #[test]
    fn slot_status_display_matches_parse() {
        for s in [SlotStatus::Busy, SlotStatus::Swappable, SlotStatus::SwapPending] {
            assert_eq!(s.to_string().parse::<SlotStatus>().unwrap(), s);
        }
    }

    #[test]
    fn only_busy_and_swappable_are_owner_settable() {
        assert!(SlotStatus::Busy.is_owner_settable());
        assert!(SlotStatus::Swappable.is_owner_settable());
        assert!(!SlotStatus::SwapPending.is_owner_settable());
    }

    #[test]
    fn swap_status_terminal() {
        assert!(!SwapStatus::Pending.is_terminal());
        assert!(SwapStatus::Accepted.is_terminal());
        assert!(SwapStatus::Rejected.is_terminal());
        assert_eq!("accepted".parse::<SwapStatus>().unwrap(), SwapStatus::Accepted);
    }

    #[test]
    fn swap_request_references_both_sides() {
        let req = SwapRequest {
            id: Ulid::new(),
            requester: Ulid::new(),
            requested_slot: Ulid::new(),
            offered_slot: Ulid::new(),
            status: SwapStatus::Pending,
            created_at: 0,
        };
        assert!(req.references(&req.offered_slot));
        assert!(req.references(&req.requested_slot));
        assert!(!req.references(&Ulid::new()));
    }

    #[test]
    fn empty_patch() {
        assert!(SlotPatch::default().is_empty());
        let patch = SlotPatch {
            status: Some(SlotStatus::Busy),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SwapAccepted {
            id: Ulid::new(),
            requester: Ulid::new(),
            responder: Ulid::new(),
            offered_slot: Ulid::new(),
            requested_slot: Ulid::new(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
