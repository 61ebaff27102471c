use crate::health::{Classification, ClassificationKind, TransitionEvent};
use crate::indicator::IndicatorLook;
use crate::parser::DeviceStatus;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_poll_timestamp_seconds: i64,
    pub poll_count: u64,
    pub source_available: bool,
    pub classification: Option<Classification>,
    pub devices: Vec<DeviceStatus>,
    pub indicator: IndicatorLook,
    pub last_event: Option<&'static str>,
    pub last_change_at: Option<i64>,
    pub bad_since_unix: Option<i64>,
    pub last_notification_at: Option<i64>,
    pub notifications_sent: u64,
    pub chat_notify_prefs: HashMap<i64, bool>,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> Option<ClassificationKind> {
        self.classification.as_ref().map(Classification::kind)
    }

    pub fn failed_devices(&self) -> &[String] {
        self.classification
            .as_ref()
            .map(Classification::failed_devices)
            .unwrap_or(&[])
    }

    pub fn update_poll(
        &mut self,
        now_unix: i64,
        source_available: bool,
        classification: Classification,
        devices: Vec<DeviceStatus>,
        event: &TransitionEvent,
        indicator: IndicatorLook,
    ) {
        self.last_poll_timestamp_seconds = now_unix;
        self.poll_count = self.poll_count.saturating_add(1);
        self.source_available = source_available;
        self.classification = Some(classification);
        self.devices = devices;
        self.indicator = indicator;

        match event {
            TransitionEvent::Unchanged => return,
            TransitionEvent::EnteredBad { .. } => self.bad_since_unix = Some(now_unix),
            TransitionEvent::ExitedBad { .. } => self.bad_since_unix = None,
            TransitionEvent::StateChanged { .. } => {}
        }
        self.last_event = Some(event.as_str());
        self.last_change_at = Some(now_unix);
    }

    pub fn record_notifications(&mut self, now_unix: i64, delivered: usize) {
        if delivered == 0 {
            return;
        }
        self.notifications_sent = self.notifications_sent.saturating_add(1);
        self.last_notification_at = Some(now_unix);
    }

    pub fn notify_enabled_for_chat(&self, chat_id: i64, default_enabled: bool) -> bool {
        self.chat_notify_prefs
            .get(&chat_id)
            .copied()
            .unwrap_or(default_enabled)
    }

    pub fn set_notify_enabled_for_chat(&mut self, chat_id: i64, enabled: bool) {
        self.chat_notify_prefs.insert(chat_id, enabled);
    }
}
