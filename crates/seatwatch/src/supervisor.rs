//! The scrape loop: harvest, normalize, reconcile, notify, sleep, repeat.
//!
//! A failed cycle is logged and discarded, the harvester session is recycled
//! and the loop goes back to sleep. Nothing short of the shutdown token stops
//! it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::OfferingStore;
use crate::error::Error;
use crate::harvest::Harvester;
use crate::normalize::{normalize_batch, NormalizedBatch};
use crate::notify::{DispatchReport, Dispatcher, Notifier};
use crate::reconcile::{reconcile, ReconcileReport, Transition};
use crate::types::{RawRecord, SubscriberId};

/// Observable state of the scrape loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Harvesting,
    Normalizing,
    Reconciling,
    Notifying,
    Sleeping,
    ShuttingDown,
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub harvested: usize,
    pub malformed: usize,
    pub created: usize,
    pub updated: usize,
    pub transitions: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: LoopState,
    pub cycle: u64,
    pub consecutive_failures: u32,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            cycle: 0,
            consecutive_failures: 0,
            last_report: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    /// Consecutive failed cycles before alerting the operator; 0 disables.
    pub failure_alert_threshold: u32,
    pub operator_chat_id: Option<SubscriberId>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            failure_alert_threshold: 5,
            operator_chat_id: None,
        }
    }
}

/// A state together with the data the cycle has produced so far.
enum Step {
    Harvest,
    Normalize(Vec<RawRecord>),
    Reconcile(NormalizedBatch),
    Notify(ReconcileReport),
    Sleep,
}

impl Step {
    fn state(&self) -> LoopState {
        match self {
            Step::Harvest => LoopState::Harvesting,
            Step::Normalize(_) => LoopState::Normalizing,
            Step::Reconcile(_) => LoopState::Reconciling,
            Step::Notify(_) => LoopState::Notifying,
            Step::Sleep => LoopState::Sleeping,
        }
    }
}

pub struct Supervisor<H> {
    harvester: H,
    offerings: Arc<OfferingStore>,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    config: SupervisorConfig,
    cancel: CancellationToken,
    status_tx: watch::Sender<SupervisorStatus>,
    current: CycleReport,
    cycle: u64,
    consecutive_failures: u32,
    alerted: bool,
    /// Committed transitions whose dispatch failed; sent with the next cycle.
    pending: Vec<Transition>,
}

impl<H: Harvester> Supervisor<H> {
    pub fn new(
        harvester: H,
        offerings: Arc<OfferingStore>,
        dispatcher: Dispatcher,
        notifier: Arc<dyn Notifier>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        Self {
            harvester,
            offerings,
            dispatcher,
            notifier,
            config,
            cancel,
            status_tx,
            current: CycleReport::default(),
            cycle: 0,
            consecutive_failures: 0,
            alerted: false,
            pending: Vec::new(),
        }
    }

    /// Receiver for the loop's live status.
    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Runs until the cancellation token fires, then releases the harvester.
    pub async fn run(mut self) {
        info!(interval_secs = self.config.interval.as_secs(), "Scrape loop started");
        let mut step = Step::Harvest;

        loop {
            // Once reconcile has committed, its transitions must be sent:
            // the store no longer remembers the zero they came from.
            if self.cancel.is_cancelled() && !matches!(step, Step::Notify(_)) {
                break;
            }
            self.set_state(step.state());

            step = match step {
                Step::Harvest => {
                    self.begin_cycle();
                    let harvested = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        result = self.harvester.produce_snapshot() => result,
                    };
                    match harvested {
                        Ok(records) => Step::Normalize(records),
                        Err(e) => self.fail_cycle(e).await,
                    }
                }
                Step::Normalize(records) => {
                    let batch = normalize_batch(&records);
                    self.current.harvested = records.len();
                    self.current.malformed = batch.rejected.len();
                    Step::Reconcile(batch)
                }
                Step::Reconcile(batch) => match reconcile(&self.offerings, &batch.offerings) {
                    Ok(report) => {
                        self.current.created = report.created;
                        self.current.updated = report.updated;
                        self.current.transitions = report.transitions.len();
                        Step::Notify(report)
                    }
                    Err(e) => self.fail_cycle(e).await,
                },
                Step::Notify(report) => {
                    let mut transitions = std::mem::take(&mut self.pending);
                    transitions.extend(report.transitions);
                    match self.dispatcher.dispatch(&transitions).await {
                        Ok(dispatched) => {
                            self.finish_cycle(dispatched);
                            Step::Sleep
                        }
                        Err(e) => {
                            self.pending = transitions;
                            self.fail_cycle(e).await
                        }
                    }
                }
                Step::Sleep => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.interval) => Step::Harvest,
                    }
                }
            };
        }

        self.set_state(LoopState::ShuttingDown);
        if !self.pending.is_empty() {
            warn!(
                transitions = self.pending.len(),
                "Shutting down with undelivered seat openings"
            );
        }
        self.harvester.release().await;
        info!(cycles = self.cycle, "Scrape loop stopped");
    }

    fn set_state(&self, state: LoopState) {
        self.status_tx.send_modify(|status| status.state = state);
    }

    fn begin_cycle(&mut self) {
        self.cycle += 1;
        self.current = CycleReport {
            cycle: self.cycle,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        self.status_tx.send_modify(|status| status.cycle = self.cycle);
        info!(cycle = self.cycle, "Scrape cycle started");
    }

    fn finish_cycle(&mut self, dispatched: DispatchReport) {
        self.current.delivered = dispatched.delivered;
        self.current.failed_deliveries = dispatched.failed;
        self.current.finished_at = Some(Utc::now());

        if self.consecutive_failures > 0 {
            info!(
                cycle = self.cycle,
                failures = self.consecutive_failures,
                "Scrape loop recovered"
            );
        }
        self.consecutive_failures = 0;
        self.alerted = false;

        let report = self.current.clone();
        info!(
            cycle = report.cycle,
            harvested = report.harvested,
            malformed = report.malformed,
            transitions = report.transitions,
            delivered = report.delivered,
            "Scrape cycle finished"
        );
        self.status_tx.send_modify(|status| {
            status.consecutive_failures = 0;
            status.last_report = Some(report);
            status.last_error = None;
        });
    }

    /// Discards the in-flight cycle, recycles the harvester and goes to sleep.
    async fn fail_cycle(&mut self, e: Error) -> Step {
        self.consecutive_failures += 1;
        error!(
            cycle = self.cycle,
            consecutive_failures = self.consecutive_failures,
            fatal = e.is_cycle_fatal(),
            storage = e.is_storage(),
            error = %e,
            "Scrape cycle failed"
        );

        let failures = self.consecutive_failures;
        let message = e.to_string();
        self.status_tx.send_modify(|status| {
            status.consecutive_failures = failures;
            status.last_error = Some(message);
        });

        self.maybe_alert_operator(&e).await;

        if let Err(recycle_err) = self.harvester.recycle().await {
            warn!(error = %recycle_err, "Harvester recycle failed, will retry next cycle");
        }

        Step::Sleep
    }

    async fn maybe_alert_operator(&mut self, e: &Error) {
        let threshold = self.config.failure_alert_threshold;
        if threshold == 0 || self.alerted || self.consecutive_failures < threshold {
            return;
        }
        self.alerted = true;

        error!(
            failures = self.consecutive_failures,
            "Scrape loop keeps failing; operator attention needed"
        );

        let Some(operator) = self.config.operator_chat_id else {
            return;
        };
        let text = format!(
            "seatwatch: {} consecutive scrape cycles failed.\nLast error: {e}",
            self.consecutive_failures
        );
        if let Err(send_err) = self.notifier.send(operator, &text).await {
            warn!(error = %send_err, "Operator alert not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::db::SubscriptionStore;
    use crate::error::Result;
    use crate::notify::testing::RecordingNotifier;
    use crate::notify::DispatchConfig;
    use crate::types::fields;

    #[derive(Clone, Default)]
    struct Probe {
        recycles: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    enum Scripted {
        Rows(Vec<RawRecord>),
        Fail,
        Hang,
    }

    struct FakeHarvester {
        script: Mutex<VecDeque<Scripted>>,
        probe: Probe,
    }

    impl FakeHarvester {
        fn new(script: Vec<Scripted>, probe: Probe) -> Self {
            Self {
                script: Mutex::new(script.into()),
                probe,
            }
        }
    }

    #[async_trait]
    impl Harvester for FakeHarvester {
        async fn produce_snapshot(&mut self) -> Result<Vec<RawRecord>> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Rows(rows)) => Ok(rows),
                Some(Scripted::Fail) => Err(Error::harvest("portal unreachable")),
                Some(Scripted::Hang) => futures::future::pending().await,
                None => Ok(Vec::new()),
            }
        }

        async fn recycle(&mut self) -> Result<()> {
            self.probe.recycles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&mut self) {
            self.probe.released.store(true, Ordering::SeqCst);
        }
    }

    fn row(code: &str, offered: &str, occupied: &str) -> RawRecord {
        [
            (fields::SUBJECT_CODE, code),
            (fields::SUBJECT_NAME, "Cálculo 1"),
            (fields::SECTION, "01"),
            (fields::TERM, "2025.2"),
            (fields::INSTRUCTOR, "ANA"),
            (fields::SCHEDULE, "35T23"),
            (fields::OFFERED, offered),
            (fields::OCCUPIED, occupied),
            (fields::LOCATION, "S1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    struct Harness {
        notifier: Arc<RecordingNotifier>,
        subscriptions: Arc<SubscriptionStore>,
        offerings: Arc<OfferingStore>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                notifier: Arc::new(RecordingNotifier::new()),
                subscriptions: Arc::new(SubscriptionStore::open_in_memory().unwrap()),
                offerings: Arc::new(OfferingStore::open_in_memory().unwrap()),
                cancel: CancellationToken::new(),
            }
        }

        fn supervisor(&self, harvester: FakeHarvester, config: SupervisorConfig) -> Supervisor<FakeHarvester> {
            let dispatcher = Dispatcher::new(
                self.notifier.clone(),
                self.subscriptions.clone(),
                DispatchConfig::default(),
            );
            Supervisor::new(
                harvester,
                self.offerings.clone(),
                dispatcher,
                self.notifier.clone(),
                config,
                self.cancel.clone(),
            )
        }
    }

    fn fast(threshold: u32, operator: Option<SubscriberId>) -> SupervisorConfig {
        SupervisorConfig {
            interval: Duration::from_millis(10),
            failure_alert_threshold: threshold,
            operator_chat_id: operator,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_failed_cycle_recycles_and_loop_continues() {
        let harness = Harness::new();
        harness.subscriptions.add_subscription(1, "FGA0001").unwrap();
        let probe = Probe::default();
        let harvester = FakeHarvester::new(
            vec![
                Scripted::Rows(vec![row("FGA0001", "30", "30")]),
                Scripted::Fail,
                Scripted::Rows(vec![row("FGA0001", "30", "28"), row("FGA0002", "x", "0")]),
            ],
            probe.clone(),
        );
        let supervisor = harness.supervisor(harvester, fast(0, None));
        let status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_until(|| harness.notifier.sent().len() == 1).await;
        harness.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert_eq!(probe.recycles.load(Ordering::SeqCst), 1);
        assert!(probe.released.load(Ordering::SeqCst));
        assert_eq!(harness.offerings.count().unwrap(), 1);
        assert!(harness.notifier.sent()[0].1.contains("2 seats"));
        assert_eq!(status.borrow().state, LoopState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let harness = Harness::new();
        let probe = Probe::default();
        let config = SupervisorConfig {
            interval: Duration::from_secs(3600),
            ..fast(0, None)
        };
        let supervisor = harness.supervisor(FakeHarvester::new(vec![], probe.clone()), config);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| s.state == LoopState::Sleeping)
            .await
            .unwrap();
        harness.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(probe.released.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_after_reconcile_still_notifies() {
        let harness = Harness::new();
        harness.subscriptions.add_subscription(1, "FGA0001").unwrap();
        let rows: Vec<RawRecord> = (0..500)
            .map(|i| {
                let mut record = row("FGA0001", "30", "28");
                record.insert(fields::SECTION.to_string(), format!("{i:03}"));
                record
            })
            .collect();
        let probe = Probe::default();
        let config = SupervisorConfig {
            interval: Duration::from_secs(3600),
            ..fast(0, None)
        };
        let supervisor = harness.supervisor(
            FakeHarvester::new(vec![Scripted::Rows(rows)], probe.clone()),
            config,
        );
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| {
                matches!(
                    s.state,
                    LoopState::Reconciling | LoopState::Notifying | LoopState::Sleeping
                )
            })
            .await
            .unwrap();
        harness.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        // Every committed opening reached the subscriber.
        assert_eq!(harness.offerings.count().unwrap(), 500);
        assert_eq!(harness.notifier.sent().len(), 500);
        assert!(probe.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_hanging_harvest() {
        let harness = Harness::new();
        let probe = Probe::default();
        let supervisor = harness.supervisor(
            FakeHarvester::new(vec![Scripted::Hang], probe.clone()),
            fast(0, None),
        );
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| s.state == LoopState::Harvesting)
            .await
            .unwrap();
        harness.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(probe.released.load(Ordering::SeqCst));
        assert_eq!(probe.recycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operator_alerted_once_per_failure_streak() {
        let harness = Harness::new();
        let probe = Probe::default();
        let script = (0..4).map(|_| Scripted::Fail).collect();
        let supervisor = harness.supervisor(FakeHarvester::new(script, probe.clone()), fast(2, Some(999)));
        let task = tokio::spawn(supervisor.run());

        // Four failures, then the script runs dry and cycles succeed.
        wait_until(|| probe.recycles.load(Ordering::SeqCst) >= 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let sent = harness.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 999);
        assert!(sent[0].1.contains("2 consecutive scrape cycles failed"));
    }
}
