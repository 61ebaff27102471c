use crate::collectors::mdstat::collect_report;
use crate::config::Config;
use crate::health::{advance, Classification, HealthState, TransitionEvent};
use crate::indicator::{Indicator, IndicatorLook};
use crate::metrics::Metrics;
use crate::notify::{Notification, NotificationKind, Notifiers};
use crate::parser::{parse_report, Report};
use crate::state::State;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTimers {
    Start,
    Stop,
    Keep,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub report: Report,
    pub classification: Classification,
    pub event: TransitionEvent,
    pub timers: AlarmTimers,
    pub delivered: usize,
}

pub struct Monitor {
    health: HealthState,
    indicator: Indicator,
    notifiers: Notifiers,
    title: String,
}

impl Monitor {
    pub fn new(notifiers: Notifiers, title: impl Into<String>) -> Self {
        Self {
            health: HealthState::init(),
            indicator: Indicator::new(),
            notifiers,
            title: title.into(),
        }
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn look(&self) -> IndicatorLook {
        self.indicator.look()
    }

    pub fn poll(&mut self, raw: &str) -> PollOutcome {
        let report = parse_report(raw);
        let classification = report.classification();
        let previous = std::mem::take(&mut self.health);
        let (health, event) = advance(previous, classification.clone());
        self.health = health;
        self.indicator.apply(&event);

        let (timers, delivered) = match &event {
            TransitionEvent::EnteredBad { devices } => {
                warn!(devices = %devices.join(", "), "RAID в состоянии BAD");
                (AlarmTimers::Start, self.send(NotificationKind::Entered))
            }
            TransitionEvent::ExitedBad { to } => {
                info!(state = to.as_str(), "RAID вышел из состояния BAD");
                (AlarmTimers::Stop, 0)
            }
            TransitionEvent::StateChanged { from, to } => {
                info!(
                    from = from.map(|k| k.as_str()).unwrap_or("init"),
                    to = to.as_str(),
                    "состояние RAID изменилось"
                );
                (AlarmTimers::Keep, 0)
            }
            TransitionEvent::Unchanged => (AlarmTimers::Keep, 0),
        };

        PollOutcome {
            report,
            classification,
            event,
            timers,
            delivered,
        }
    }

    pub fn renotify(&mut self) -> usize {
        if !self.health.is_bad() {
            return 0;
        }
        self.send(NotificationKind::Repeat)
    }

    pub fn blink(&mut self) -> IndicatorLook {
        self.indicator.blink()
    }

    fn send(&self, kind: NotificationKind) -> usize {
        let devices = self
            .health
            .classification()
            .map(Classification::failed_devices)
            .unwrap_or(&[]);
        let notification = Notification::new(kind, &self.title, devices);
        self.notifiers.deliver(&notification)
    }
}

pub async fn run(
    mut monitor: Monitor,
    cfg: Config,
    metrics: Arc<Metrics>,
    shared_state: Arc<RwLock<State>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let renotify_period = Duration::from_secs(cfg.renotify_interval_secs);
    let blink_period = Duration::from_millis(cfg.blink_interval_ms);
    let mut poll_ticker = time::interval(Duration::from_secs(cfg.interval_secs));
    poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut renotify_ticker: Option<Interval> = None;
    let mut blink_ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки цикла опроса");
                break;
            }
            _ = poll_ticker.tick() => {
                let snapshot = collect_report(&cfg.mdstat_path);
                if !snapshot.source_available {
                    metrics.inc_source_read_error();
                }

                let outcome = monitor.poll(&snapshot.text);
                debug!(
                    arrays = outcome.report.devices.len(),
                    failed = outcome.report.failed_count(),
                    event = outcome.event.as_str(),
                    "опрос завершён"
                );
                match outcome.timers {
                    AlarmTimers::Start => {
                        renotify_ticker = Some(delayed_interval(renotify_period));
                        blink_ticker = Some(delayed_interval(blink_period));
                    }
                    AlarmTimers::Stop => {
                        renotify_ticker = None;
                        blink_ticker = None;
                    }
                    AlarmTimers::Keep => {}
                }

                metrics.inc_poll();
                metrics.inc_transition(&outcome.event);
                if outcome.delivered > 0 {
                    metrics.inc_notification_sent(NotificationKind::Entered);
                }

                let now = now_unix();
                let state_snapshot = {
                    let mut guard = shared_state.write().await;
                    guard.update_poll(
                        now,
                        snapshot.source_available,
                        outcome.classification,
                        outcome.report.devices,
                        &outcome.event,
                        monitor.look(),
                    );
                    guard.record_notifications(now, outcome.delivered);
                    guard.clone()
                };
                metrics.update_from_state(&state_snapshot);
            }
            _ = tick_opt(&mut renotify_ticker) => {
                let delivered = monitor.renotify();
                debug!(delivered, "повторное уведомление");
                if delivered > 0 {
                    metrics.inc_notification_sent(NotificationKind::Repeat);
                    shared_state.write().await.record_notifications(now_unix(), delivered);
                }
            }
            _ = tick_opt(&mut blink_ticker) => {
                let look = monitor.blink();
                shared_state.write().await.indicator = look;
                metrics.set_indicator(look);
            }
        }
    }
}

// Matches a freshly started repeating timer: first tick one full period later.
fn delayed_interval(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick_opt(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ClassificationKind;
    use crate::notify::testing::RecordingNotifier;
    use crate::notify::{NotifyToggle, BODY_SUFFIX};

    const GOOD: &str = "Personalities : [raid1]\nmd0 : active raid1 sdb1[1] sda1[0]\n      1048512 blocks [2/2] [UU]\n\nunused devices: <none>\n";
    const BAD_ONE: &str = "Personalities : [raid1]\nmd0 : active raid1 sdb1[1] sda1[0](F)\n      1048512 blocks [2/1] [U_]\n\nunused devices: <none>\n";
    const BAD_TWO: &str = "Personalities : [raid1]\nmd0 : active raid1 sdb1[1] sda1[0](F)\n      1048512 blocks [2/1] [U_]\n\nmd1 : active raid1 sdb2[1]\n      2048 blocks [2/1] [_U]\n\nunused devices: <none>\n";
    const EMPTY: &str = "Personalities :\nunused devices: <none>\n";

    fn monitor() -> (Monitor, RecordingNotifier, NotifyToggle) {
        let recorder = RecordingNotifier::default();
        let toggle = NotifyToggle::new(true);
        let notifiers = Notifiers::new(toggle.clone()).with(recorder.clone());
        (Monitor::new(notifiers, "RAID failed or degraded"), recorder, toggle)
    }

    #[test]
    fn entering_bad_notifies_once_and_starts_timers() {
        let (mut monitor, recorder, _) = monitor();

        let first = monitor.poll(GOOD);
        assert_eq!(first.timers, AlarmTimers::Keep);
        assert_eq!(monitor.look(), IndicatorLook::Good);

        let entered = monitor.poll(BAD_ONE);
        assert_eq!(entered.timers, AlarmTimers::Start);
        assert_eq!(entered.delivered, 1);
        assert_eq!(monitor.look(), IndicatorLook::BadLit);

        let again = monitor.poll(BAD_ONE);
        assert_eq!(again.event, TransitionEvent::Unchanged);
        assert_eq!(again.timers, AlarmTimers::Keep);

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Entered);
        assert_eq!(sent[0].title, "RAID failed or degraded");
        assert_eq!(sent[0].body, format!("Device: md0{BODY_SUFFIX}"));
    }

    #[test]
    fn renotify_uses_latest_device_list() {
        let (mut monitor, recorder, _) = monitor();
        monitor.poll(BAD_ONE);
        monitor.poll(BAD_TWO);

        assert_eq!(monitor.renotify(), 1);
        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].kind, NotificationKind::Repeat);
        assert_eq!(sent[1].body, format!("Devices: md0, md1{BODY_SUFFIX}"));
    }

    #[test]
    fn leaving_bad_stops_timers_and_renotify() {
        let (mut monitor, recorder, _) = monitor();
        monitor.poll(BAD_ONE);
        let exited = monitor.poll(EMPTY);
        assert_eq!(
            exited.event,
            TransitionEvent::ExitedBad {
                to: ClassificationKind::Missing
            }
        );
        assert_eq!(exited.timers, AlarmTimers::Stop);
        assert_eq!(monitor.look(), IndicatorLook::Missing);
        assert_eq!(monitor.renotify(), 0);
        assert_eq!(recorder.sent().len(), 1);
    }

    #[test]
    fn blink_alternates_while_bad() {
        let (mut monitor, _, _) = monitor();
        monitor.poll(BAD_ONE);
        assert_eq!(monitor.blink(), IndicatorLook::BadDim);
        assert_eq!(monitor.blink(), IndicatorLook::BadLit);
        monitor.poll(GOOD);
        assert_eq!(monitor.blink(), IndicatorLook::Good);
    }

    #[test]
    fn suppressed_notifications_still_track_state() {
        let (mut monitor, recorder, toggle) = monitor();
        toggle.set(false);
        let outcome = monitor.poll(BAD_ONE);
        assert_eq!(outcome.timers, AlarmTimers::Start);
        assert_eq!(outcome.delivered, 0);
        assert!(monitor.health().is_bad());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn run_polls_source_and_publishes_state() {
        let path = std::env::temp_dir().join(format!("raidmond-run-{}", std::process::id()));
        std::fs::write(&path, BAD_ONE).expect("запись файла");

        let cfg: Config = serde_yaml::from_str(&format!(
            "listen: \"127.0.0.1:0\"\nmdstat_path: \"{}\"\n",
            path.display()
        ))
        .expect("yaml");
        let metrics = Metrics::new().expect("инициализация метрик");
        let shared_state = Arc::new(RwLock::new(State::new(0)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, recorder, _) = monitor();

        let task = tokio::spawn(run(
            monitor,
            cfg,
            metrics.clone(),
            shared_state.clone(),
            shutdown_rx,
        ));

        time::sleep(Duration::from_millis(200)).await;
        {
            let guard = shared_state.read().await;
            assert_eq!(guard.kind(), Some(ClassificationKind::Bad));
            assert_eq!(guard.poll_count, 1);
            assert!(guard.source_available);
            assert!(guard.bad_since_unix.is_some());
        }
        assert_eq!(recorder.sent().len(), 1);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_timers_run_only_while_bad() {
        let path = std::env::temp_dir().join(format!("raidmond-timers-{}", std::process::id()));
        std::fs::write(&path, BAD_ONE).expect("запись файла");

        let cfg: Config = serde_yaml::from_str(&format!(
            "listen: \"127.0.0.1:0\"\nmdstat_path: \"{}\"\ninterval_secs: 60\nrenotify_interval_secs: 900\nblink_interval_ms: 500\n",
            path.display()
        ))
        .expect("yaml");
        let metrics = Metrics::new().expect("инициализация метрик");
        let shared_state = Arc::new(RwLock::new(State::new(0)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, recorder, _) = monitor();

        let task = tokio::spawn(run(
            monitor,
            cfg,
            metrics,
            shared_state.clone(),
            shutdown_rx,
        ));

        // t = 0.25s: first poll done, no blink yet.
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(recorder.sent().len(), 1);
        assert_eq!(shared_state.read().await.indicator, IndicatorLook::BadLit);

        // t = 0.75s and 1.25s: blink ticks at 0.5s and 1.0s.
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(shared_state.read().await.indicator, IndicatorLook::BadDim);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(shared_state.read().await.indicator, IndicatorLook::BadLit);
        assert_eq!(recorder.sent().len(), 1);

        // t = 901.25s: one repeat after the re-notify period.
        time::sleep(Duration::from_secs(900)).await;
        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].kind, NotificationKind::Repeat);

        // Poll at t = 960s sees GOOD and stops both timers.
        std::fs::write(&path, GOOD).expect("запись файла");
        time::sleep(Duration::from_secs(1800)).await;
        assert_eq!(recorder.sent().len(), 2);
        {
            let guard = shared_state.read().await;
            assert_eq!(guard.kind(), Some(ClassificationKind::Good));
            assert_eq!(guard.indicator, IndicatorLook::Good);
        }

        let _ = shutdown_tx.send(true);
        let _ = task.await;
        let _ = std::fs::remove_file(&path);
    }
}
