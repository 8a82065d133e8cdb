use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{SlotWrite, StoreError};

use super::conflict::{find_conflicts, validate_lead_time, validate_slot, validate_text};
use super::lifecycle::apply_reschedule;
use super::{BookingCoordinator, BookingError};

impl BookingCoordinator {
    /// Request a viewing on behalf of the draft's tenant. The result is REQUESTED.
    pub async fn create_booking(
        &self,
        actor: Actor,
        draft: ViewingDraft,
    ) -> Result<Viewing, BookingError> {
        if actor != Actor::User(draft.tenant_id) {
            return Err(BookingError::Unauthorized {
                actor,
                action: "request",
            });
        }
        if draft.tenant_id == draft.landlord_id {
            return Err(BookingError::InvalidInput("tenant and landlord must differ"));
        }
        let span = validate_slot(draft.scheduled_at, draft.duration_minutes)?;
        validate_lead_time(span.start, self.now(), self.settings.min_lead)?;
        validate_text(draft.tenant_notes.as_deref(), MAX_NOTES_LEN, "note too long")?;
        validate_text(draft.contact.phone.as_deref(), MAX_CONTACT_LEN, "contact phone too long")?;
        validate_text(draft.contact.email.as_deref(), MAX_CONTACT_LEN, "contact email too long")?;

        if self
            .store
            .count_active_by_tenant_and_property(draft.tenant_id, draft.property_id)
            .await?
            > 0
        {
            return Err(BookingError::DuplicateActiveBooking {
                tenant_id: draft.tenant_id,
                property_id: draft.property_id,
            });
        }

        // Cheap pre-check without the lock; the locked check is authoritative.
        let timeline = self.store.find_active_bookings(draft.property_id).await?;
        reject_conflicts(&timeline.bookings, &span, None, "precheck")?;

        let viewing = self
            .locks
            .with_property_lock(draft.property_id, || self.commit_request(&draft, span))
            .await?;

        metrics::counter!(crate::observability::VIEWINGS_REQUESTED_TOTAL).increment(1);
        info!(
            "viewing {} requested on property {} at [{}, {})",
            viewing.id, viewing.property_id, span.start, span.end
        );
        self.lifecycle
            .announce(&viewing, NotificationKind::ViewingRequested);
        Ok(viewing)
    }

    /// Move an active viewing to a new slot. Any party on the viewing may do this;
    /// the viewing's own current slot never counts as a conflict.
    pub async fn reschedule_booking(
        &self,
        actor: Actor,
        id: Ulid,
        new_start: Ms,
        new_duration_minutes: u32,
    ) -> Result<Viewing, BookingError> {
        let span = validate_slot(new_start, new_duration_minutes)?;
        validate_lead_time(span.start, self.now(), self.settings.min_lead)?;

        let current = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(BookingError::NotFound(id))?;
        apply_reschedule(&current, actor, new_start, new_duration_minutes)?;

        let timeline = self.store.find_active_bookings(current.property_id).await?;
        reject_conflicts(&timeline.bookings, &span, Some(id), "precheck")?;

        let viewing = self
            .locks
            .with_property_lock(current.property_id, || {
                self.commit_reschedule(actor, id, span, new_duration_minutes)
            })
            .await?;

        metrics::counter!(crate::observability::VIEWINGS_RESCHEDULED_TOTAL).increment(1);
        info!(
            "viewing {id} rescheduled by {actor} to [{}, {})",
            span.start, span.end
        );
        self.lifecycle
            .announce(&viewing, NotificationKind::ViewingRescheduled);
        Ok(viewing)
    }

    /// Runs under the property lock.
    async fn commit_request(&self, draft: &ViewingDraft, span: Span) -> Result<Viewing, BookingError> {
        let max_attempts = self.settings.retry.max_attempts();
        for attempt in 1..=max_attempts {
            let timeline = self.store.find_active_bookings(draft.property_id).await?;
            if timeline.bookings.iter().any(|v| v.tenant_id == draft.tenant_id) {
                return Err(BookingError::DuplicateActiveBooking {
                    tenant_id: draft.tenant_id,
                    property_id: draft.property_id,
                });
            }
            reject_conflicts(&timeline.bookings, &span, None, "locked")?;

            let write = SlotWrite {
                viewing: self.lifecycle.materialize(draft),
                expected_revision: timeline.revision,
            };
            match self.store.commit_slot(write).await {
                Ok(saved) => return Ok(saved),
                Err(e) if e.is_retryable() => {
                    self.back_off(draft.property_id, attempt, max_attempts, &e).await
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.exhausted(draft.property_id, max_attempts))
    }

    /// Runs under the property lock.
    async fn commit_reschedule(
        &self,
        actor: Actor,
        id: Ulid,
        span: Span,
        duration_minutes: u32,
    ) -> Result<Viewing, BookingError> {
        let max_attempts = self.settings.retry.max_attempts();
        let mut property_id = None;
        for attempt in 1..=max_attempts {
            let current = self
                .store
                .find_by_id(id)
                .await?
                .ok_or(BookingError::NotFound(id))?;
            property_id = Some(current.property_id);
            let moved = apply_reschedule(&current, actor, span.start, duration_minutes)?;

            let timeline = self.store.find_active_bookings(current.property_id).await?;
            reject_conflicts(&timeline.bookings, &span, Some(id), "locked")?;

            let write = SlotWrite {
                viewing: moved,
                expected_revision: timeline.revision,
            };
            match self.store.commit_slot(write).await {
                Ok(saved) => return Ok(saved),
                Err(e) if e.is_retryable() => {
                    self.back_off(current.property_id, attempt, max_attempts, &e).await
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.exhausted(property_id.unwrap_or(id), max_attempts))
    }

    async fn back_off(&self, property_id: Ulid, attempt: u32, max_attempts: u32, err: &StoreError) {
        metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
        debug!("property {property_id}: {err} (attempt {attempt}/{max_attempts})");
        if attempt < max_attempts {
            tokio::time::sleep(self.settings.retry.delay_for_retry(attempt)).await;
        }
    }

    fn exhausted(&self, property_id: Ulid, attempts: u32) -> BookingError {
        metrics::counter!(crate::observability::RETRIES_EXHAUSTED_TOTAL).increment(1);
        warn!("property {property_id}: giving up after {attempts} conflicting commits");
        BookingError::ConflictRetryExhausted { attempts }
    }
}

fn reject_conflicts(
    bookings: &[Viewing],
    span: &Span,
    exclude: Option<Ulid>,
    stage: &'static str,
) -> Result<(), BookingError> {
    let conflicts = find_conflicts(bookings, span, exclude);
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL, "stage" => stage).increment(1);
    Err(BookingError::SlotUnavailable(conflicts))
}
