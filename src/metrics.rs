use crate::health::{ClassificationKind, TransitionEvent};
use crate::indicator::IndicatorLook;
use crate::notify::NotificationKind;
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub raid_health_state: GaugeVec,
    pub raid_arrays_total: Gauge,
    pub raid_arrays_failed: Gauge,
    pub raid_array_failed: GaugeVec,
    pub raid_array_recovering: GaugeVec,
    pub raid_array_recovery_percent: GaugeVec,
    pub raid_indicator_look: GaugeVec,
    pub raidmond_source_available: Gauge,
    pub raidmond_polls_total: Counter,
    pub raidmond_source_read_errors_total: Counter,
    pub raidmond_transitions_total: CounterVec,
    pub raidmond_notifications_sent_total: CounterVec,
    pub raidmond_scrape_count_total: Counter,
    pub raidmond_uptime_seconds: Gauge,
    pub raidmond_last_poll_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let raid_health_state = GaugeVec::new(
            opts!(
                "raid_health_state",
                "Aggregate RAID health, 1 for the current state (good, bad, missing)"
            ),
            &["state"],
        )?;
        let raid_arrays_total = Gauge::with_opts(opts!(
            "raid_arrays_total",
            "Number of arrays listed in the status report"
        ))?;
        let raid_arrays_failed = Gauge::with_opts(opts!(
            "raid_arrays_failed",
            "Number of arrays classified as failed or degraded"
        ))?;
        let raid_array_failed = GaugeVec::new(
            opts!(
                "raid_array_failed",
                "1 if the array is failed or degraded, 0 otherwise"
            ),
            &["device"],
        )?;
        let raid_array_recovering = GaugeVec::new(
            opts!("raid_array_recovering", "1 if the array is rebuilding a member"),
            &["device"],
        )?;
        let raid_array_recovery_percent = GaugeVec::new(
            opts!(
                "raid_array_recovery_percent",
                "Recovery progress in percent (only while recovering)"
            ),
            &["device"],
        )?;
        let raid_indicator_look = GaugeVec::new(
            opts!(
                "raid_indicator_look",
                "Current indicator look, 1 for the active one"
            ),
            &["look"],
        )?;
        let raidmond_source_available = Gauge::with_opts(opts!(
            "raidmond_source_available",
            "1 if the status report could be read on the last poll"
        ))?;
        let raidmond_polls_total =
            Counter::with_opts(opts!("raidmond_polls_total", "Number of poll cycles"))?;
        let raidmond_source_read_errors_total = Counter::with_opts(opts!(
            "raidmond_source_read_errors_total",
            "Number of polls where the status report was absent or unreadable"
        ))?;
        let raidmond_transitions_total = CounterVec::new(
            opts!(
                "raidmond_transitions_total",
                "Health transitions by event (entered_bad, exited_bad, state_changed)"
            ),
            &["event"],
        )?;
        let raidmond_notifications_sent_total = CounterVec::new(
            opts!(
                "raidmond_notifications_sent_total",
                "Delivered notifications by kind (entered, repeat)"
            ),
            &["kind"],
        )?;
        let raidmond_scrape_count_total = Counter::with_opts(opts!(
            "raidmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let raidmond_uptime_seconds =
            Gauge::with_opts(opts!("raidmond_uptime_seconds", "Daemon uptime in seconds"))?;
        let raidmond_last_poll_timestamp_seconds = Gauge::with_opts(opts!(
            "raidmond_last_poll_timestamp_seconds",
            "Unix timestamp of the last poll"
        ))?;

        register(&registry, &raid_health_state)?;
        register(&registry, &raid_arrays_total)?;
        register(&registry, &raid_arrays_failed)?;
        register(&registry, &raid_array_failed)?;
        register(&registry, &raid_array_recovering)?;
        register(&registry, &raid_array_recovery_percent)?;
        register(&registry, &raid_indicator_look)?;
        register(&registry, &raidmond_source_available)?;
        register(&registry, &raidmond_polls_total)?;
        register(&registry, &raidmond_source_read_errors_total)?;
        register(&registry, &raidmond_transitions_total)?;
        register(&registry, &raidmond_notifications_sent_total)?;
        register(&registry, &raidmond_scrape_count_total)?;
        register(&registry, &raidmond_uptime_seconds)?;
        register(&registry, &raidmond_last_poll_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            raid_health_state,
            raid_arrays_total,
            raid_arrays_failed,
            raid_array_failed,
            raid_array_recovering,
            raid_array_recovery_percent,
            raid_indicator_look,
            raidmond_source_available,
            raidmond_polls_total,
            raidmond_source_read_errors_total,
            raidmond_transitions_total,
            raidmond_notifications_sent_total,
            raidmond_scrape_count_total,
            raidmond_uptime_seconds,
            raidmond_last_poll_timestamp_seconds,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        let current = state.kind();
        for kind in ClassificationKind::ALL {
            self.raid_health_state
                .with_label_values(&[kind.as_str()])
                .set(if current == Some(kind) { 1.0 } else { 0.0 });
        }

        self.raid_arrays_total.set(state.devices.len() as f64);
        self.raid_arrays_failed
            .set(state.devices.iter().filter(|d| d.failed).count() as f64);

        // Arrays can disappear between polls; drop stale label sets.
        self.raid_array_failed.reset();
        self.raid_array_recovering.reset();
        self.raid_array_recovery_percent.reset();
        for d in &state.devices {
            self.raid_array_failed
                .with_label_values(&[&d.name])
                .set(if d.failed { 1.0 } else { 0.0 });
            self.raid_array_recovering
                .with_label_values(&[&d.name])
                .set(if d.recovering { 1.0 } else { 0.0 });
            if let Some(pct) = d.recovery_percent {
                self.raid_array_recovery_percent
                    .with_label_values(&[&d.name])
                    .set(pct);
            }
        }

        self.set_indicator(state.indicator);
        self.raidmond_source_available
            .set(if state.source_available { 1.0 } else { 0.0 });
        self.raidmond_last_poll_timestamp_seconds
            .set(state.last_poll_timestamp_seconds as f64);

        let now = now_unix();
        let uptime = now.saturating_sub(state.started_at_unix) as f64;
        self.raidmond_uptime_seconds.set(uptime);
    }

    pub fn set_indicator(&self, look: IndicatorLook) {
        for l in IndicatorLook::ALL {
            self.raid_indicator_look
                .with_label_values(&[l.as_str()])
                .set(if l == look { 1.0 } else { 0.0 });
        }
    }

    pub fn inc_poll(&self) {
        self.raidmond_polls_total.inc();
    }

    pub fn inc_source_read_error(&self) {
        self.raidmond_source_read_errors_total.inc();
    }

    pub fn inc_transition(&self, event: &TransitionEvent) {
        if matches!(event, TransitionEvent::Unchanged) {
            return;
        }
        self.raidmond_transitions_total
            .with_label_values(&[event.as_str()])
            .inc();
    }

    pub fn inc_notification_sent(&self, kind: NotificationKind) {
        self.raidmond_notifications_sent_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.raidmond_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
