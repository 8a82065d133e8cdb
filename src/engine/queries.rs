use ulid::Ulid;

use crate::model::*;

use super::conflict::find_conflicts;
use super::{BookingCoordinator, BookingError};

impl BookingCoordinator {
    pub async fn get_viewing(&self, id: Ulid) -> Result<Viewing, BookingError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(BookingError::NotFound(id))
    }

    /// Active viewings on a property, ordered by start.
    pub async fn property_timeline(&self, property_id: Ulid) -> Result<Vec<Viewing>, BookingError> {
        Ok(self.store.find_active_bookings(property_id).await?.bookings)
    }

    /// Read-only overlap query against the property's current timeline.
    pub async fn find_conflicts(
        &self,
        property_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Viewing>, BookingError> {
        let timeline = self.store.find_active_bookings(property_id).await?;
        Ok(find_conflicts(&timeline.bookings, &span, exclude))
    }
}
