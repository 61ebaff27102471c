use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationKind {
    Good,
    Bad,
    Missing,
}

impl ClassificationKind {
    pub const ALL: [ClassificationKind; 3] = [Self::Good, Self::Bad, Self::Missing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Missing => "missing",
        }
    }
}

// Bad is never empty; build it through from_failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "devices", rename_all = "lowercase")]
pub enum Classification {
    Good,
    Bad(Vec<String>),
    Missing,
}

impl Classification {
    pub fn from_failed(devices: Vec<String>) -> Self {
        if devices.is_empty() {
            Self::Good
        } else {
            Self::Bad(devices)
        }
    }

    pub fn kind(&self) -> ClassificationKind {
        match self {
            Self::Good => ClassificationKind::Good,
            Self::Bad(_) => ClassificationKind::Bad,
            Self::Missing => ClassificationKind::Missing,
        }
    }

    pub fn failed_devices(&self) -> &[String] {
        match self {
            Self::Bad(devices) => devices,
            Self::Good | Self::Missing => &[],
        }
    }
}

/// Last observed classification. `None` is the INIT state before the first poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthState {
    last: Option<Classification>,
}

impl HealthState {
    pub fn init() -> Self {
        Self::default()
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.last.as_ref()
    }

    pub fn kind(&self) -> Option<ClassificationKind> {
        self.last.as_ref().map(Classification::kind)
    }

    pub fn is_bad(&self) -> bool {
        self.kind() == Some(ClassificationKind::Bad)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEvent {
    Unchanged,
    EnteredBad {
        devices: Vec<String>,
    },
    ExitedBad {
        to: ClassificationKind,
    },
    StateChanged {
        from: Option<ClassificationKind>,
        to: ClassificationKind,
    },
}

impl TransitionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "none",
            Self::EnteredBad { .. } => "entered_bad",
            Self::ExitedBad { .. } => "exited_bad",
            Self::StateChanged { .. } => "state_changed",
        }
    }
}

pub fn advance(previous: HealthState, next: Classification) -> (HealthState, TransitionEvent) {
    let before = previous.kind();
    let after = next.kind();

    let event = if before == Some(after) {
        TransitionEvent::Unchanged
    } else if after == ClassificationKind::Bad {
        TransitionEvent::EnteredBad {
            devices: next.failed_devices().to_vec(),
        }
    } else if before == Some(ClassificationKind::Bad) {
        TransitionEvent::ExitedBad { to: after }
    } else {
        TransitionEvent::StateChanged {
            from: before,
            to: after,
        }
    };

    (HealthState { last: Some(next) }, event)
}
