use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

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

    /// Span starting at `start` lasting `minutes`.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + Ms::from(minutes) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewingStatus {
    Requested,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl ViewingStatus {
    /// Active viewings occupy their slot and take part in conflict checks.
    pub fn is_active(self) -> bool {
        matches!(self, ViewingStatus::Requested | ViewingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViewingStatus::Requested => "REQUESTED",
            ViewingStatus::Confirmed => "CONFIRMED",
            ViewingStatus::Cancelled => "CANCELLED",
            ViewingStatus::Completed => "COMPLETED",
            ViewingStatus::NoShow => "NO_SHOW",
        }
    }
}

impl std::fmt::Display for ViewingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The relationship a user has to a particular viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Tenant,
    Landlord,
    Agent,
}

/// Who is driving a change. User identity comes from the caller's auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User(Ulid),
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Contact details captured when the request was made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notes {
    pub tenant: Option<String>,
    pub landlord: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// 1..=5
    pub rating: u8,
    pub comment: Option<String>,
    pub submitted_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewing {
    pub id: Ulid,
    pub property_id: Ulid,
    pub tenant_id: Ulid,
    pub landlord_id: Ulid,
    pub agent_id: Option<Ulid>,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub status: ViewingStatus,
    pub created_at: Ms,
    pub confirmed_at: Option<Ms>,
    pub confirmed_by: Option<Ulid>,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<Actor>,
    pub cancellation_reason: Option<String>,
    pub completed_at: Option<Ms>,
    pub feedback: Option<Feedback>,
    pub notes: Notes,
    pub contact: Contact,
    /// Bumped on every successful write; stale writers get a version conflict.
    pub version: u64,
}

impl Viewing {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.scheduled_at, self.duration_minutes)
    }

    pub fn ends_at(&self) -> Ms {
        self.span().end
    }

    pub fn party_of(&self, user_id: Ulid) -> Option<Party> {
        if user_id == self.tenant_id {
            Some(Party::Tenant)
        } else if user_id == self.landlord_id {
            Some(Party::Landlord)
        } else if self.agent_id == Some(user_id) {
            Some(Party::Agent)
        } else {
            None
        }
    }

    /// Everyone who should hear about changes to this viewing.
    pub fn participants(&self) -> Vec<Ulid> {
        let mut ids = vec![self.tenant_id, self.landlord_id];
        if let Some(agent) = self.agent_id {
            ids.push(agent);
        }
        ids
    }
}

/// A tenant's booking request before it has been materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewingDraft {
    pub property_id: Ulid,
    pub tenant_id: Ulid,
    pub landlord_id: Ulid,
    pub agent_id: Option<Ulid>,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub tenant_notes: Option<String>,
    pub contact: Contact,
}

impl ViewingDraft {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.scheduled_at, self.duration_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    ViewingRequested,
    ViewingConfirmed,
    ViewingRescheduled,
    ViewingCancelled,
    ViewingCompleted,
    ViewingNoShow,
    ViewingReminder,
    FeedbackReceived,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ViewingRequested => "viewing_requested",
            NotificationKind::ViewingConfirmed => "viewing_confirmed",
            NotificationKind::ViewingRescheduled => "viewing_rescheduled",
            NotificationKind::ViewingCancelled => "viewing_cancelled",
            NotificationKind::ViewingCompleted => "viewing_completed",
            NotificationKind::ViewingNoShow => "viewing_no_show",
            NotificationKind::ViewingReminder => "viewing_reminder",
            NotificationKind::FeedbackReceived => "feedback_received",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

#[cfg(test)]
pub(crate) fn sample_viewing(property_id: Ulid, span: Span, status: ViewingStatus) -> Viewing {
    Viewing {
        id: Ulid::new(),
        property_id,
        tenant_id: Ulid::new(),
        landlord_id: Ulid::new(),
        agent_id: None,
        scheduled_at: span.start,
        duration_minutes: (span.duration_ms() / MINUTE_MS) as u32,
        status,
        created_at: 0,
        confirmed_at: None,
        confirmed_by: None,
        cancelled_at: None,
        cancelled_by: None,
        cancellation_reason: None,
        completed_at: None,
        feedback: None,
        notes: Notes::default(),
        contact: Contact::default(),
        version: 1,
    }
}
