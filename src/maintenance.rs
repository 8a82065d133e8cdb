use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{BookingCoordinator, BookingError};
use crate::model::*;

const EXPIRY_REASON: &str = "Request expired without confirmation";

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    pub overdue_every: Duration,
    pub reminder_every: Duration,
    pub expiry_every: Duration,
    pub lock_sweep_every: Duration,
    pub compact_every: Duration,
    /// WAL appends since the last compaction before the log is rewritten.
    pub compact_threshold: u64,
    /// Past this long after the scheduled end, a confirmed viewing is a no-show.
    pub no_show_after: Ms,
    /// How long after the scheduled end auto-completion waits.
    pub auto_complete_grace: Ms,
    /// Remind about confirmed viewings starting in `[now + start, now + end)`.
    pub reminder_window_start: Ms,
    pub reminder_window_end: Ms,
    /// Unconfirmed requests older than this are cancelled.
    pub request_ttl: Ms,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            overdue_every: Duration::from_secs(30 * 60),
            reminder_every: Duration::from_secs(60 * 60),
            expiry_every: Duration::from_secs(24 * 60 * 60),
            lock_sweep_every: Duration::from_secs(60 * 60),
            compact_every: Duration::from_secs(60),
            compact_threshold: 1000,
            no_show_after: 2 * HOUR_MS,
            auto_complete_grace: 0,
            reminder_window_start: 23 * HOUR_MS,
            reminder_window_end: 25 * HOUR_MS,
            request_ttl: 7 * DAY_MS,
        }
    }
}

/// Outcome of one pass of a job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: usize,
    pub applied: usize,
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, job: &'static str, id: Ulid, result: Result<(), BookingError>) {
        match result {
            Ok(()) => {
                self.applied += 1;
                metrics::counter!(crate::observability::MAINTENANCE_ITEMS_TOTAL, "job" => job, "outcome" => "applied")
                    .increment(1);
            }
            Err(e) => {
                self.skipped += 1;
                metrics::counter!(crate::observability::MAINTENANCE_ITEMS_TOTAL, "job" => job, "outcome" => "skipped", "reason" => e.kind())
                    .increment(1);
                // Losing a race to a user action is expected; anything else is worth a look.
                match e {
                    BookingError::InvalidTransition { .. } | BookingError::NotFound(_) => {
                        debug!("{job}: skipped viewing {id}: {e}")
                    }
                    _ => warn!("{job}: skipped viewing {id}: {e}"),
                }
            }
        }
    }
}

/// Time-driven transitions. Every pass is idempotent, so a pass that is
/// interrupted or repeated leaves the same end state.
pub struct Maintenance {
    coordinator: Arc<BookingCoordinator>,
    config: MaintenanceConfig,
    /// Viewing id → the start each reminder was sent for, by this process.
    reminded: DashMap<Ulid, Ms>,
}

impl Maintenance {
    pub fn new(coordinator: Arc<BookingCoordinator>, config: MaintenanceConfig) -> Self {
        Self {
            coordinator,
            config,
            reminded: DashMap::new(),
        }
    }

    fn now(&self) -> Ms {
        self.coordinator.lifecycle().now()
    }

    /// Confirmed viewings past their end become NO_SHOW once `no_show_after`
    /// has elapsed, otherwise COMPLETED once the grace window has passed.
    pub async fn process_overdue(&self) -> Result<PassReport, BookingError> {
        let now = self.now();
        let overdue = self.coordinator.store().find_overdue(now).await?;
        let lifecycle = self.coordinator.lifecycle();
        let mut report = PassReport {
            scanned: overdue.len(),
            ..Default::default()
        };
        for viewing in overdue {
            let elapsed = now - viewing.ends_at();
            let result = if elapsed > self.config.no_show_after {
                lifecycle.mark_no_show(viewing.id).await
            } else if elapsed >= self.config.auto_complete_grace {
                lifecycle.complete(viewing.id, Actor::System).await
            } else {
                continue;
            };
            report.record("overdue", viewing.id, result.map(drop));
        }
        Ok(report)
    }

    /// One reminder per confirmed viewing entering the reminder window.
    pub async fn dispatch_reminders(&self) -> Result<PassReport, BookingError> {
        let now = self.now();
        self.reminded.retain(|_, start| *start > now);

        let window = Span::new(
            now + self.config.reminder_window_start,
            now + self.config.reminder_window_end,
        );
        let upcoming = self.coordinator.store().find_upcoming(window).await?;
        let mut report = PassReport {
            scanned: upcoming.len(),
            ..Default::default()
        };
        for viewing in upcoming {
            // A reschedule moves the start, and the new start earns its own reminder.
            if self.reminded.insert(viewing.id, viewing.scheduled_at) == Some(viewing.scheduled_at) {
                continue;
            }
            self.coordinator
                .lifecycle()
                .announce(&viewing, NotificationKind::ViewingReminder);
            report.record("reminders", viewing.id, Ok(()));
        }
        Ok(report)
    }

    /// Cancel REQUESTED viewings nobody confirmed within `request_ttl`.
    pub async fn expire_requests(&self) -> Result<PassReport, BookingError> {
        let now = self.now();
        let requested = self
            .coordinator
            .store()
            .find_by_status(ViewingStatus::Requested)
            .await?;
        let mut report = PassReport::default();
        for viewing in requested {
            if now - viewing.created_at <= self.config.request_ttl {
                continue;
            }
            report.scanned += 1;
            let result = self
                .coordinator
                .lifecycle()
                .cancel(viewing.id, Actor::System, Some(EXPIRY_REASON.to_string()))
                .await;
            report.record("expiry", viewing.id, result.map(drop));
        }
        Ok(report)
    }

    pub fn sweep_locks(&self) -> PassReport {
        let removed = self.coordinator.locks().sweep();
        PassReport {
            scanned: removed + self.coordinator.locks().len(),
            applied: removed,
            skipped: 0,
        }
    }

    pub async fn compact_log(&self) -> Result<PassReport, BookingError> {
        let compacted = self
            .coordinator
            .store()
            .compact(self.config.compact_threshold)
            .await?;
        Ok(PassReport {
            scanned: 1,
            applied: usize::from(compacted),
            skipped: 0,
        })
    }

    /// Start every job on its own ticker. Aborting the returned handle stops them.
    pub fn spawn(self: Arc<Self>) -> MaintenanceHandle {
        let mut tasks = Vec::new();

        let m = self.clone();
        tasks.push(tokio::spawn(run_periodic("overdue", self.config.overdue_every, move || {
            let m = m.clone();
            async move { m.process_overdue().await }
        })));

        let m = self.clone();
        tasks.push(tokio::spawn(run_periodic("reminders", self.config.reminder_every, move || {
            let m = m.clone();
            async move { m.dispatch_reminders().await }
        })));

        let m = self.clone();
        tasks.push(tokio::spawn(run_periodic("expiry", self.config.expiry_every, move || {
            let m = m.clone();
            async move { m.expire_requests().await }
        })));

        let m = self.clone();
        tasks.push(tokio::spawn(run_periodic("lock_sweep", self.config.lock_sweep_every, move || {
            let m = m.clone();
            async move { Ok(m.sweep_locks()) }
        })));

        let m = self.clone();
        tasks.push(tokio::spawn(run_periodic("compaction", self.config.compact_every, move || {
            let m = m.clone();
            async move { m.compact_log().await }
        })));

        MaintenanceHandle { tasks }
    }
}

pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Tick forever. Each pass runs as its own task, so a failed or panicking
/// pass is logged and the next tick runs as usual.
async fn run_periodic<F, Fut>(job: &'static str, every: Duration, pass: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<PassReport, BookingError>> + Send + 'static,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match tokio::spawn(pass()).await {
            Ok(Ok(report)) => {
                metrics::counter!(crate::observability::MAINTENANCE_PASSES_TOTAL, "job" => job, "status" => "ok")
                    .increment(1);
                if report.applied > 0 || report.skipped > 0 {
                    info!(
                        "{job}: scanned {}, applied {}, skipped {}",
                        report.scanned, report.applied, report.skipped
                    );
                } else {
                    debug!("{job}: nothing to do");
                }
            }
            Ok(Err(e)) => {
                metrics::counter!(crate::observability::MAINTENANCE_PASSES_TOTAL, "job" => job, "status" => "error")
                    .increment(1);
                error!("{job}: pass failed: {e}");
            }
            Err(join_err) if join_err.is_panic() => {
                metrics::counter!(crate::observability::MAINTENANCE_PASSES_TOTAL, "job" => job, "status" => "panic")
                    .increment(1);
                error!("{job}: pass panicked");
            }
            Err(_) => {
                debug!("{job}: pass cancelled, stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::clock::ManualClock;
    use crate::engine::BookingSettings;
    use crate::notify::NotifyHub;
    use crate::store::LogStore;

    /// 2024-05-31T00:00:00Z
    const NOW: Ms = 1_717_113_600_000;
    /// 2024-06-01T10:00:00Z
    const TEN_AM: Ms = 1_717_236_000_000;

    struct Setup {
        maintenance: Maintenance,
        coordinator: Arc<BookingCoordinator>,
        clock: Arc<ManualClock>,
        hub: Arc<NotifyHub>,
        property: Ulid,
        landlord: Ulid,
    }

    impl Setup {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let hub = Arc::new(NotifyHub::new());
            let coordinator = Arc::new(BookingCoordinator::new(
                Arc::new(LogStore::in_memory()),
                hub.clone(),
                clock.clone(),
                BookingSettings::default(),
            ));
            Self {
                maintenance: Maintenance::new(coordinator.clone(), MaintenanceConfig::default()),
                coordinator,
                clock,
                hub,
                property: Ulid::new(),
                landlord: Ulid::new(),
            }
        }

        async fn request(&self, start: Ms, minutes: u32) -> Viewing {
            let tenant_id = Ulid::new();
            let draft = ViewingDraft {
                property_id: self.property,
                tenant_id,
                landlord_id: self.landlord,
                agent_id: None,
                scheduled_at: start,
                duration_minutes: minutes,
                tenant_notes: None,
                contact: Contact::default(),
            };
            self.coordinator
                .create_booking(Actor::User(tenant_id), draft)
                .await
                .unwrap()
        }

        async fn confirmed(&self, start: Ms, minutes: u32) -> Viewing {
            let viewing = self.request(start, minutes).await;
            self.coordinator
                .lifecycle()
                .confirm(viewing.id, Actor::User(self.landlord))
                .await
                .unwrap()
        }

        async fn status(&self, id: Ulid) -> ViewingStatus {
            self.coordinator.get_viewing(id).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn requests_expire_after_seven_days() {
        let s = Setup::new();
        let pending = s.request(TEN_AM, 60).await;

        s.clock.set(NOW + 7 * DAY_MS);
        let report = s.maintenance.expire_requests().await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(s.status(pending.id).await, ViewingStatus::Requested);

        s.clock.set(NOW + 7 * DAY_MS + 1);
        let report = s.maintenance.expire_requests().await.unwrap();
        assert_eq!(report.applied, 1);
        let expired = s.coordinator.get_viewing(pending.id).await.unwrap();
        assert_eq!(expired.status, ViewingStatus::Cancelled);
        assert_eq!(expired.cancelled_by, Some(Actor::System));
        assert_eq!(expired.cancellation_reason.as_deref(), Some(EXPIRY_REASON));

        // Idempotent.
        assert_eq!(s.maintenance.expire_requests().await.unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn confirmed_viewings_never_expire() {
        let s = Setup::new();
        let viewing = s.confirmed(TEN_AM, 60).await;
        s.clock.set(NOW + 30 * DAY_MS);
        s.maintenance.expire_requests().await.unwrap();
        assert_ne!(s.status(viewing.id).await, ViewingStatus::Cancelled);
    }

    #[tokio::test]
    async fn overdue_viewings_complete_or_become_no_shows() {
        let s = Setup::new();
        let recent = s.confirmed(TEN_AM, 60).await;
        let stale = s.confirmed(TEN_AM - 3 * HOUR_MS, 60).await;
        let unconfirmed = s.request(TEN_AM - 5 * HOUR_MS, 60).await;

        // 13:00: `recent` ended exactly two hours ago, `stale` five.
        s.clock.set(TEN_AM + 3 * HOUR_MS);
        let report = s.maintenance.process_overdue().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(s.status(recent.id).await, ViewingStatus::Completed);
        assert_eq!(s.status(stale.id).await, ViewingStatus::NoShow);
        assert_eq!(s.status(unconfirmed.id).await, ViewingStatus::Requested);

        let again = s.maintenance.process_overdue().await.unwrap();
        assert_eq!(again, PassReport::default());
    }

    #[tokio::test]
    async fn viewings_in_progress_are_left_alone() {
        let s = Setup::new();
        let viewing = s.confirmed(TEN_AM, 60).await;
        s.clock.set(TEN_AM + 30 * MINUTE_MS);
        assert_eq!(s.maintenance.process_overdue().await.unwrap().scanned, 0);
        assert_eq!(s.status(viewing.id).await, ViewingStatus::Confirmed);
    }

    #[tokio::test]
    async fn reminders_go_out_once() {
        let s = Setup::new();
        let viewing = s.confirmed(TEN_AM, 60).await;
        let mut inbox = s.hub.subscribe(viewing.tenant_id);
        s.request(TEN_AM + 2 * HOUR_MS, 60).await;

        s.clock.set(TEN_AM - 24 * HOUR_MS);
        let report = s.maintenance.dispatch_reminders().await.unwrap();
        assert_eq!(report.applied, 1);

        let reminder = inbox.try_recv().unwrap();
        assert_eq!(reminder.kind, NotificationKind::ViewingReminder);
        assert_eq!(reminder.payload["viewing_id"], viewing.id.to_string());

        s.clock.advance(HOUR_MS);
        let report = s.maintenance.dispatch_reminders().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.applied, 0);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn rescheduled_viewing_is_reminded_of_its_new_start() {
        let s = Setup::new();
        let viewing = s.confirmed(TEN_AM, 60).await;
        let mut inbox = s.hub.subscribe(viewing.tenant_id);

        s.clock.set(TEN_AM - 24 * HOUR_MS);
        assert_eq!(s.maintenance.dispatch_reminders().await.unwrap().applied, 1);
        assert_eq!(inbox.try_recv().unwrap().kind, NotificationKind::ViewingReminder);

        let evening = TEN_AM + 12 * HOUR_MS;
        s.coordinator
            .reschedule_booking(Actor::User(s.landlord), viewing.id, evening, 60)
            .await
            .unwrap();
        assert_eq!(inbox.try_recv().unwrap().kind, NotificationKind::ViewingRescheduled);

        s.clock.set(evening - 24 * HOUR_MS);
        let report = s.maintenance.dispatch_reminders().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.applied, 1);
        let reminder = inbox.try_recv().unwrap();
        assert_eq!(reminder.kind, NotificationKind::ViewingReminder);
        assert_eq!(reminder.payload["scheduled_at"], evening);

        // And only once for the new start as well.
        s.clock.advance(HOUR_MS);
        assert_eq!(s.maintenance.dispatch_reminders().await.unwrap().applied, 0);
    }

    #[tokio::test]
    async fn nothing_to_remind_outside_the_window() {
        let s = Setup::new();
        s.confirmed(TEN_AM, 60).await;
        s.clock.set(TEN_AM - 26 * HOUR_MS);
        assert_eq!(s.maintenance.dispatch_reminders().await.unwrap().scanned, 0);
        s.clock.set(TEN_AM - 22 * HOUR_MS);
        assert_eq!(s.maintenance.dispatch_reminders().await.unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn idle_locks_are_swept() {
        let s = Setup::new();
        s.request(TEN_AM, 60).await;
        assert_eq!(s.coordinator.locks().len(), 1);
        let report = s.maintenance.sweep_locks();
        assert_eq!(report.applied, 1);
        assert!(s.coordinator.locks().is_empty());
    }

    #[tokio::test]
    async fn in_memory_store_has_nothing_to_compact() {
        let s = Setup::new();
        s.request(TEN_AM, 60).await;
        assert_eq!(s.maintenance.compact_log().await.unwrap().applied, 0);
    }

    #[tokio::test]
    async fn periodic_job_survives_errors_and_panics() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let task = tokio::spawn(run_periodic("flaky", Duration::from_millis(5), move || {
            let r = r.clone();
            async move {
                match r.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(BookingError::Storage("disk on fire".into())),
                    1 => panic!("bad row"),
                    _ => Ok(PassReport::default()),
                }
            }
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }
}
