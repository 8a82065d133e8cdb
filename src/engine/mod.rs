mod conflict;
mod error;
pub mod lifecycle;
mod mutations;
mod queries;
mod retry;

pub use conflict::find_conflicts;
pub use error::BookingError;
pub use lifecycle::{LifecycleManager, Transition};
pub use retry::RetryPolicy;

use std::sync::Arc;

use crate::clock::Clock;
use crate::locks::LockRegistry;
use crate::model::*;
use crate::notify::Notifier;
use crate::store::ViewingStore;

#[derive(Debug, Clone, PartialEq)]
pub struct BookingSettings {
    /// Earliest a viewing may start, relative to now.
    pub min_lead: Ms,
    pub retry: RetryPolicy,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            min_lead: HOUR_MS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Owns every write to a property's viewing timeline.
///
/// Creates and reschedules run under the property's in-process lock, re-check
/// overlap against a fresh timeline snapshot, and commit conditionally on that
/// snapshot's revision; optimistic conflicts are retried up to the policy cap.
/// Status changes are delegated to the [`LifecycleManager`].
pub struct BookingCoordinator {
    store: Arc<dyn ViewingStore>,
    locks: LockRegistry,
    lifecycle: Arc<LifecycleManager>,
    clock: Arc<dyn Clock>,
    settings: BookingSettings,
}

impl BookingCoordinator {
    pub fn new(
        store: Arc<dyn ViewingStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: BookingSettings,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            notifier,
            clock.clone(),
            settings.retry.clone(),
        ));
        Self {
            store,
            locks: LockRegistry::new(),
            lifecycle,
            clock,
            settings,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<dyn ViewingStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn settings(&self) -> &BookingSettings {
        &self.settings
    }

    pub(crate) fn now(&self) -> Ms {
        self.clock.now_ms()
    }
}
