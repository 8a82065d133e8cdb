mod log;

pub use log::LogStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Ms, Span, Viewing, ViewingStatus};

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Row-level optimistic lock: someone else wrote this viewing first.
    VersionConflict { id: Ulid, expected: u64, actual: u64 },
    /// The property's timeline changed after it was read; the interval write must be redone.
    SerializationFailure { property_id: Ulid },
    Rejected(&'static str),
    Io(String),
}

impl StoreError {
    /// Conflicts a caller can resolve by re-reading and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::SerializationFailure { .. }
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "viewing not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "viewing already exists: {id}"),
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on viewing {id}: expected {expected}, found {actual}"
            ),
            StoreError::SerializationFailure { property_id } => {
                write!(f, "concurrent write to property {property_id} timeline")
            }
            StoreError::Rejected(msg) => write!(f, "write rejected: {msg}"),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Active viewings of one property as of `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub property_id: Ulid,
    /// Bumped by every interval write on the property.
    pub revision: u64,
    /// REQUESTED/CONFIRMED viewings, ordered by start.
    pub bookings: Vec<Viewing>,
}

/// An interval write (new viewing or reschedule), committed only if the
/// timeline is still at `expected_revision` and the row still at `viewing.version`.
/// A new viewing carries version 0.
#[derive(Debug, Clone)]
pub struct SlotWrite {
    pub viewing: Viewing,
    pub expected_revision: u64,
}

#[async_trait]
pub trait ViewingStore: Send + Sync {
    async fn find_active_bookings(&self, property_id: Ulid) -> Result<Timeline, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Viewing>, StoreError>;

    /// Persist a state-only change. `viewing.version` must match the stored row;
    /// scheduling fields must be unchanged. Returns the stored copy with its new version.
    async fn save(&self, viewing: Viewing) -> Result<Viewing, StoreError>;

    /// Serializable interval write, see [`SlotWrite`].
    async fn commit_slot(&self, write: SlotWrite) -> Result<Viewing, StoreError>;

    /// CONFIRMED viewings whose scheduled end is at or before `now`.
    async fn find_overdue(&self, now: Ms) -> Result<Vec<Viewing>, StoreError>;

    /// CONFIRMED viewings starting inside `window`.
    async fn find_upcoming(&self, window: Span) -> Result<Vec<Viewing>, StoreError>;

    async fn find_by_status(&self, status: ViewingStatus) -> Result<Vec<Viewing>, StoreError>;

    async fn count_active_by_tenant_and_property(
        &self,
        tenant_id: Ulid,
        property_id: Ulid,
    ) -> Result<usize, StoreError>;

    /// Rewrite durable state once `threshold` appends have accumulated.
    /// Returns whether anything was compacted. Stores without a log have nothing to do.
    async fn compact(&self, _threshold: u64) -> Result<bool, StoreError> {
        Ok(false)
    }
}
