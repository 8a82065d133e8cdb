//! Viewing state machine.
//!
//! ```text
//! REQUESTED ──confirm──▶ CONFIRMED ──complete──▶ COMPLETED
//!     │                     │   └──no-show──▶ NO_SHOW
//!     └──cancel──▶ CANCELLED ◀──cancel──┘
//! ```
//!
//! The pure functions here decide whether a change is allowed and produce the
//! updated viewing. [`LifecycleManager`] loads, applies, saves, and notifies;
//! it is the only path through which a viewing's status changes.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notifier;
use crate::store::ViewingStore;

use super::conflict::validate_text;
use super::retry::RetryPolicy;
use super::BookingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Cancel { reason: Option<String> },
    Complete,
    MarkNoShow,
}

impl Transition {
    pub fn target(&self) -> ViewingStatus {
        match self {
            Transition::Confirm => ViewingStatus::Confirmed,
            Transition::Cancel { .. } => ViewingStatus::Cancelled,
            Transition::Complete => ViewingStatus::Completed,
            Transition::MarkNoShow => ViewingStatus::NoShow,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Transition::Confirm => "confirm",
            Transition::Cancel { .. } => "cancel",
            Transition::Complete => "complete",
            Transition::MarkNoShow => "mark as no-show",
        }
    }

    fn notification(&self) -> NotificationKind {
        match self {
            Transition::Confirm => NotificationKind::ViewingConfirmed,
            Transition::Cancel { .. } => NotificationKind::ViewingCancelled,
            Transition::Complete => NotificationKind::ViewingCompleted,
            Transition::MarkNoShow => NotificationKind::ViewingNoShow,
        }
    }
}

/// Edges of the state machine. Nothing leads back to REQUESTED.
pub fn can_transition(from: ViewingStatus, to: ViewingStatus) -> bool {
    use ViewingStatus::*;
    matches!(
        (from, to),
        (Requested, Confirmed)
            | (Requested, Cancelled)
            | (Confirmed, Cancelled)
            | (Confirmed, Completed)
            | (Confirmed, NoShow)
    )
}

/// Who may drive `transition` out of `from`. `None` is the system.
fn permitted(from: ViewingStatus, transition: &Transition, party: Option<Party>) -> bool {
    use Party::*;
    match transition {
        Transition::Confirm => matches!(party, Some(Landlord | Agent)),
        Transition::Cancel { .. } => match from {
            ViewingStatus::Requested => true,
            _ => party.is_some(),
        },
        Transition::Complete => !matches!(party, Some(Tenant)),
        Transition::MarkNoShow => party.is_none(),
    }
}

/// Resolve the actor's relationship to the viewing. Users with none are rejected outright.
fn party_for(viewing: &Viewing, actor: Actor, action: &'static str) -> Result<Option<Party>, BookingError> {
    match actor {
        Actor::System => Ok(None),
        Actor::User(uid) => viewing
            .party_of(uid)
            .map(Some)
            .ok_or(BookingError::Unauthorized { actor, action }),
    }
}

pub fn apply_transition(
    viewing: &Viewing,
    actor: Actor,
    transition: &Transition,
    now: Ms,
) -> Result<Viewing, BookingError> {
    let action = transition.action();
    let party = party_for(viewing, actor, action)?;
    if !can_transition(viewing.status, transition.target()) {
        return Err(BookingError::InvalidTransition {
            from: viewing.status,
            action,
        });
    }
    if !permitted(viewing.status, transition, party) {
        return Err(BookingError::Unauthorized { actor, action });
    }

    let mut next = viewing.clone();
    next.status = transition.target();
    match transition {
        Transition::Confirm => {
            next.confirmed_at = Some(now);
            next.confirmed_by = match actor {
                Actor::User(uid) => Some(uid),
                Actor::System => None,
            };
        }
        Transition::Cancel { reason } => {
            validate_text(reason.as_deref(), MAX_REASON_LEN, "cancellation reason too long")?;
            next.cancelled_at = Some(now);
            next.cancelled_by = Some(actor);
            next.cancellation_reason = reason.clone();
        }
        Transition::Complete => {
            next.completed_at = Some(now);
        }
        Transition::MarkNoShow => {}
    }
    Ok(next)
}

pub fn apply_feedback(
    viewing: &Viewing,
    actor: Actor,
    rating: u8,
    comment: Option<String>,
    now: Ms,
) -> Result<Viewing, BookingError> {
    const ACTION: &str = "leave feedback on";
    let party = party_for(viewing, actor, ACTION)?;
    if viewing.status != ViewingStatus::Completed {
        return Err(BookingError::InvalidTransition {
            from: viewing.status,
            action: ACTION,
        });
    }
    if party != Some(Party::Tenant) {
        return Err(BookingError::Unauthorized { actor, action: ACTION });
    }
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(BookingError::InvalidInput("rating must be between 1 and 5"));
    }
    validate_text(comment.as_deref(), MAX_COMMENT_LEN, "feedback comment too long")?;

    let mut next = viewing.clone();
    next.feedback = Some(Feedback {
        rating,
        comment,
        submitted_at: now,
    });
    Ok(next)
}

/// Set the note belonging to the actor's role. Allowed in any state.
pub fn apply_note(viewing: &Viewing, actor: Actor, note: Option<String>) -> Result<Viewing, BookingError> {
    const ACTION: &str = "annotate";
    validate_text(note.as_deref(), MAX_NOTES_LEN, "note too long")?;
    let mut next = viewing.clone();
    match party_for(viewing, actor, ACTION)? {
        Some(Party::Tenant) => next.notes.tenant = note,
        Some(Party::Landlord) => next.notes.landlord = note,
        Some(Party::Agent) => next.notes.agent = note,
        None => return Err(BookingError::Unauthorized { actor, action: ACTION }),
    }
    Ok(next)
}

/// Move an active viewing to a new slot. Status and version are untouched;
/// overlap checking is the coordinator's job.
pub fn apply_reschedule(
    viewing: &Viewing,
    actor: Actor,
    scheduled_at: Ms,
    duration_minutes: u32,
) -> Result<Viewing, BookingError> {
    const ACTION: &str = "reschedule";
    if party_for(viewing, actor, ACTION)?.is_none() {
        return Err(BookingError::Unauthorized { actor, action: ACTION });
    }
    if !viewing.status.is_active() {
        return Err(BookingError::InvalidTransition {
            from: viewing.status,
            action: ACTION,
        });
    }
    let mut next = viewing.clone();
    next.scheduled_at = scheduled_at;
    next.duration_minutes = duration_minutes;
    Ok(next)
}

/// A fresh REQUESTED viewing for `draft`. Version 0 marks it as not yet stored.
pub fn materialize(draft: &ViewingDraft, now: Ms) -> Viewing {
    Viewing {
        id: Ulid::new(),
        property_id: draft.property_id,
        tenant_id: draft.tenant_id,
        landlord_id: draft.landlord_id,
        agent_id: draft.agent_id,
        scheduled_at: draft.scheduled_at,
        duration_minutes: draft.duration_minutes,
        status: ViewingStatus::Requested,
        created_at: now,
        confirmed_at: None,
        confirmed_by: None,
        cancelled_at: None,
        cancelled_by: None,
        cancellation_reason: None,
        completed_at: None,
        feedback: None,
        notes: Notes {
            tenant: draft.tenant_notes.clone(),
            landlord: None,
            agent: None,
        },
        contact: draft.contact.clone(),
        version: 0,
    }
}

fn payload(viewing: &Viewing) -> serde_json::Value {
    json!({
        "viewing_id": viewing.id.to_string(),
        "property_id": viewing.property_id.to_string(),
        "status": viewing.status.as_str(),
        "scheduled_at": viewing.scheduled_at,
        "duration_minutes": viewing.duration_minutes,
    })
}

pub struct LifecycleManager {
    store: Arc<dyn ViewingStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ViewingStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            retry,
        }
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn materialize(&self, draft: &ViewingDraft) -> Viewing {
        materialize(draft, self.now())
    }

    /// Tell every participant about `viewing`. Never fails.
    pub fn announce(&self, viewing: &Viewing, kind: NotificationKind) {
        let body = payload(viewing);
        for user_id in viewing.participants() {
            self.notifier.notify(user_id, kind, body.clone());
        }
    }

    pub async fn transition(
        &self,
        id: Ulid,
        actor: Actor,
        transition: Transition,
    ) -> Result<Viewing, BookingError> {
        let kind = transition.notification();
        let target = transition.target();
        let saved = self
            .mutate(id, |viewing, now| apply_transition(viewing, actor, &transition, now))
            .await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => target.as_str())
            .increment(1);
        info!("viewing {id} -> {target} by {actor}");
        self.announce(&saved, kind);
        Ok(saved)
    }

    pub async fn confirm(&self, id: Ulid, actor: Actor) -> Result<Viewing, BookingError> {
        self.transition(id, actor, Transition::Confirm).await
    }

    pub async fn cancel(
        &self,
        id: Ulid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Viewing, BookingError> {
        self.transition(id, actor, Transition::Cancel { reason }).await
    }

    pub async fn complete(&self, id: Ulid, actor: Actor) -> Result<Viewing, BookingError> {
        self.transition(id, actor, Transition::Complete).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Viewing, BookingError> {
        self.transition(id, Actor::System, Transition::MarkNoShow).await
    }

    pub async fn leave_feedback(
        &self,
        id: Ulid,
        actor: Actor,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Viewing, BookingError> {
        let saved = self
            .mutate(id, |viewing, now| {
                apply_feedback(viewing, actor, rating, comment.clone(), now)
            })
            .await?;
        self.notifier
            .notify(saved.landlord_id, NotificationKind::FeedbackReceived, payload(&saved));
        if let Some(agent) = saved.agent_id {
            self.notifier
                .notify(agent, NotificationKind::FeedbackReceived, payload(&saved));
        }
        Ok(saved)
    }

    pub async fn set_note(
        &self,
        id: Ulid,
        actor: Actor,
        note: Option<String>,
    ) -> Result<Viewing, BookingError> {
        self.mutate(id, |viewing, _| apply_note(viewing, actor, note.clone()))
            .await
    }

    /// Load, apply, save with the row version. A version conflict means someone
    /// else wrote first: reload and re-validate against their result.
    async fn mutate<F>(&self, id: Ulid, apply: F) -> Result<Viewing, BookingError>
    where
        F: Fn(&Viewing, Ms) -> Result<Viewing, BookingError>,
    {
        let max_attempts = self.retry.max_attempts();
        for attempt in 1..=max_attempts {
            let current = self
                .store
                .find_by_id(id)
                .await?
                .ok_or(BookingError::NotFound(id))?;
            let next = apply(&current, self.now())?;
            match self.store.save(next).await {
                Ok(saved) => return Ok(saved),
                Err(e) if e.is_retryable() => {
                    debug!("viewing {id}: {e} (attempt {attempt}/{max_attempts})");
                    metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for_retry(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        metrics::counter!(crate::observability::RETRIES_EXHAUSTED_TOTAL).increment(1);
        Err(BookingError::ConflictRetryExhausted {
            attempts: max_attempts,
        })
    }
}
