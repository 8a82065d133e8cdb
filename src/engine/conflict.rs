use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::BookingError;

/// Active viewings in `bookings` whose slot overlaps `span`, skipping `exclude`.
///
/// Terminal viewings never conflict. Slots are half-open, so back-to-back
/// viewings are fine.
pub fn find_conflicts(bookings: &[Viewing], span: &Span, exclude: Option<Ulid>) -> Vec<Viewing> {
    bookings
        .iter()
        .filter(|v| v.status.is_active())
        .filter(|v| Some(v.id) != exclude)
        .filter(|v| v.span().overlaps(span))
        .cloned()
        .collect()
}

pub(crate) fn validate_slot(start: Ms, duration_minutes: u32) -> Result<Span, BookingError> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(BookingError::InvalidInput("duration out of range"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || start > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::InvalidInput("timestamp out of range"));
    }
    Ok(Span::from_minutes(start, duration_minutes))
}

pub(crate) fn validate_lead_time(start: Ms, now: Ms, min_lead: Ms) -> Result<(), BookingError> {
    if start < now + min_lead {
        return Err(BookingError::InvalidInput(
            "viewing must be scheduled further in the future",
        ));
    }
    Ok(())
}

pub(crate) fn validate_text(text: Option<&str>, max: usize, what: &'static str) -> Result<(), BookingError> {
    match text {
        Some(t) if t.len() > max => Err(BookingError::InvalidInput(what)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(property_id: Ulid, start: Ms, end: Ms, status: ViewingStatus) -> Viewing {
        sample_viewing(property_id, Span::new(start, end), status)
    }

    #[test]
    fn overlapping_active_bookings_conflict() {
        let pid = Ulid::new();
        let existing = vec![
            at(pid, 10 * HOUR_MS, 11 * HOUR_MS, ViewingStatus::Confirmed),
            at(pid, 13 * HOUR_MS, 14 * HOUR_MS, ViewingStatus::Requested),
        ];
        let hits = find_conflicts(&existing, &Span::new(10 * HOUR_MS + 30 * MINUTE_MS, 13 * HOUR_MS + 1), None);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn adjacent_slots_do_not_conflict() {
        let pid = Ulid::new();
        let existing = vec![at(pid, 10 * HOUR_MS, 11 * HOUR_MS, ViewingStatus::Confirmed)];
        assert!(find_conflicts(&existing, &Span::new(11 * HOUR_MS, 12 * HOUR_MS), None).is_empty());
        assert!(find_conflicts(&existing, &Span::new(9 * HOUR_MS, 10 * HOUR_MS), None).is_empty());
    }

    #[test]
    fn terminal_bookings_never_conflict() {
        let pid = Ulid::new();
        let existing = vec![
            at(pid, 0, HOUR_MS, ViewingStatus::Cancelled),
            at(pid, 0, HOUR_MS, ViewingStatus::Completed),
            at(pid, 0, HOUR_MS, ViewingStatus::NoShow),
        ];
        assert!(find_conflicts(&existing, &Span::new(0, HOUR_MS), None).is_empty());
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let pid = Ulid::new();
        let me = at(pid, 0, HOUR_MS, ViewingStatus::Confirmed);
        let id = me.id;
        let existing = vec![me];
        assert!(find_conflicts(&existing, &Span::new(30 * MINUTE_MS, 90 * MINUTE_MS), Some(id)).is_empty());
        assert_eq!(find_conflicts(&existing, &Span::new(30 * MINUTE_MS, 90 * MINUTE_MS), None).len(), 1);
    }

    #[test]
    fn containing_interval_conflicts() {
        let pid = Ulid::new();
        let existing = vec![at(pid, 2 * HOUR_MS, 3 * HOUR_MS, ViewingStatus::Requested)];
        assert_eq!(find_conflicts(&existing, &Span::new(HOUR_MS, 4 * HOUR_MS), None).len(), 1);
    }

    #[test]
    fn slot_validation() {
        let start = MIN_VALID_TIMESTAMP_MS + DAY_MS;
        assert!(validate_slot(start, 30).is_ok());
        assert!(matches!(validate_slot(start, 5), Err(BookingError::InvalidInput(_))));
        assert!(matches!(validate_slot(start, 24 * 60), Err(BookingError::InvalidInput(_))));
        assert!(matches!(validate_slot(0, 30), Err(BookingError::InvalidInput(_))));
    }

    #[test]
    fn lead_time_is_inclusive() {
        assert!(validate_lead_time(1_000 + HOUR_MS, 1_000, HOUR_MS).is_ok());
        assert!(validate_lead_time(1_000 + HOUR_MS - 1, 1_000, HOUR_MS).is_err());
    }
}
