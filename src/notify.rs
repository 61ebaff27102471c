use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const BODY_SUFFIX: &str = "\n(Turn off notifications to stop these alerts.)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Entered,
    Repeat,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entered => "entered",
            Self::Repeat => "repeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub devices: Vec<String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: &str, devices: &[String]) -> Self {
        Self {
            kind,
            title: title.to_string(),
            body: compose_body(devices),
            devices: devices.to_vec(),
        }
    }
}

pub fn compose_body(devices: &[String]) -> String {
    let mut body = match devices {
        [] => String::new(),
        [one] => format!("Device: {one}"),
        many => format!("Devices: {}", many.join(", ")),
    };
    body.push_str(BODY_SUFFIX);
    body
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify(&self, notification: &Notification) -> bool;
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, notification: &Notification) -> bool {
        warn!(
            kind = notification.kind.as_str(),
            title = %notification.title,
            body = %notification.body,
            "уведомление о сбое RAID"
        );
        true
    }
}

pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn notify(&self, notification: &Notification) -> bool {
        if let Err(err) = self.tx.send(notification.clone()) {
            warn!(error = %err, "получатель уведомлений закрыт");
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct NotifyToggle(Arc<AtomicBool>);

impl NotifyToggle {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        let was = self.0.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            info!(enabled, "переключены уведомления");
        }
    }
}

pub struct Notifiers {
    toggle: NotifyToggle,
    sinks: Vec<Box<dyn Notifier>>,
}

impl Notifiers {
    pub fn new(toggle: NotifyToggle) -> Self {
        Self {
            toggle,
            sinks: Vec::new(),
        }
    }

    pub fn with(mut self, sink: impl Notifier + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Returns how many sinks accepted the notification; 0 when suppressed.
    pub fn deliver(&self, notification: &Notification) -> usize {
        if !self.toggle.is_enabled() {
            debug!(kind = notification.kind.as_str(), "уведомления отключены, пропуск");
            return 0;
        }
        self.sinks
            .iter()
            .filter(|sink| {
                let ok = sink.notify(notification);
                if !ok {
                    debug!(sink = sink.name(), "уведомление не доставлено");
                }
                ok
            })
            .count()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn body_for_one_and_many_devices() {
        assert_eq!(
            compose_body(&["md0".to_string()]),
            format!("Device: md0{BODY_SUFFIX}")
        );
        assert_eq!(
            compose_body(&["md0".to_string(), "md1".to_string(), "md127".to_string()]),
            format!("Devices: md0, md1, md127{BODY_SUFFIX}")
        );
    }

    #[test]
    fn toggle_suppresses_delivery() {
        let recorder = RecordingNotifier::default();
        let toggle = NotifyToggle::new(true);
        let notifiers = Notifiers::new(toggle.clone()).with(recorder.clone());
        let n = Notification::new(NotificationKind::Entered, "t", &["md0".to_string()]);

        assert_eq!(notifiers.deliver(&n), 1);
        toggle.set(false);
        assert_eq!(notifiers.deliver(&n), 0);
        assert_eq!(recorder.sent().len(), 1);
    }

    #[test]
    fn channel_notifier_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = ChannelNotifier::new(tx);
        let n = Notification::new(NotificationKind::Repeat, "t", &["md0".to_string()]);
        assert!(notifier.notify(&n));
        drop(rx);
        assert!(!notifier.notify(&n));
    }
}
