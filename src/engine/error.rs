use ulid::Ulid;

use crate::model::{Actor, Viewing, ViewingStatus};
use crate::store::StoreError;

#[derive(Debug)]
pub enum BookingError {
    InvalidInput(&'static str),
    DuplicateActiveBooking {
        tenant_id: Ulid,
        property_id: Ulid,
    },
    /// The slot overlaps these active viewings.
    SlotUnavailable(Vec<Viewing>),
    /// Gave up after repeated optimistic conflicts; the slot may still be free.
    ConflictRetryExhausted {
        attempts: u32,
    },
    InvalidTransition {
        from: ViewingStatus,
        action: &'static str,
    },
    Unauthorized {
        actor: Actor,
        action: &'static str,
    },
    NotFound(Ulid),
    Storage(String),
}

impl BookingError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::DuplicateActiveBooking { .. } => "duplicate_active_booking",
            BookingError::SlotUnavailable(_) => "slot_unavailable",
            BookingError::ConflictRetryExhausted { .. } => "conflict_retry_exhausted",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::Unauthorized { .. } => "unauthorized",
            BookingError::NotFound(_) => "not_found",
            BookingError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::DuplicateActiveBooking {
                tenant_id,
                property_id,
            } => write!(
                f,
                "tenant {tenant_id} already has an active viewing for property {property_id}"
            ),
            BookingError::SlotUnavailable(conflicts) => {
                let ids: Vec<String> = conflicts.iter().map(|v| v.id.to_string()).collect();
                write!(f, "slot unavailable: conflicts with [{}]", ids.join(", "))
            }
            BookingError::ConflictRetryExhausted { attempts } => write!(
                f,
                "gave up after {attempts} attempts due to concurrent writes; try again later"
            ),
            BookingError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a viewing in state {from}")
            }
            BookingError::Unauthorized { actor, action } => {
                write!(f, "{actor} is not allowed to {action} this viewing")
            }
            BookingError::NotFound(id) => write!(f, "viewing not found: {id}"),
            BookingError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            other => BookingError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_booking_kinds() {
        let id = Ulid::new();
        assert_eq!(BookingError::from(StoreError::NotFound(id)).kind(), "not_found");
        let e = BookingError::from(StoreError::Io("disk full".into()));
        assert_eq!(e.kind(), "storage");
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn kinds_label_skipped_maintenance_rows() {
        let lost_race = BookingError::InvalidTransition {
            from: crate::model::ViewingStatus::Cancelled,
            action: "complete",
        };
        assert_eq!(lost_race.kind(), "invalid_transition");
        assert_eq!(
            BookingError::ConflictRetryExhausted { attempts: 3 }.kind(),
            "conflict_retry_exhausted"
        );
    }
}
