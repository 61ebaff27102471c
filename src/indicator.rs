use crate::health::{ClassificationKind, TransitionEvent};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorLook {
    #[default]
    Missing,
    Good,
    BadLit,
    BadDim,
}

impl IndicatorLook {
    pub const ALL: [IndicatorLook; 4] = [Self::Missing, Self::Good, Self::BadLit, Self::BadDim];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Good => "good",
            Self::BadLit => "bad_lit",
            Self::BadDim => "bad_dim",
        }
    }

    fn for_kind(kind: ClassificationKind) -> Self {
        match kind {
            ClassificationKind::Good => Self::Good,
            ClassificationKind::Missing => Self::Missing,
            ClassificationKind::Bad => Self::BadLit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Indicator {
    look: IndicatorLook,
}

impl Indicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn look(&self) -> IndicatorLook {
        self.look
    }

    pub fn apply(&mut self, event: &TransitionEvent) {
        match event {
            TransitionEvent::Unchanged => {}
            TransitionEvent::EnteredBad { .. } => self.look = IndicatorLook::BadLit,
            TransitionEvent::ExitedBad { to } | TransitionEvent::StateChanged { to, .. } => {
                self.look = IndicatorLook::for_kind(*to);
            }
        }
    }

    pub fn blink(&mut self) -> IndicatorLook {
        self.look = match self.look {
            IndicatorLook::BadLit => IndicatorLook::BadDim,
            IndicatorLook::BadDim => IndicatorLook::BadLit,
            other => other,
        };
        self.look
    }
}
