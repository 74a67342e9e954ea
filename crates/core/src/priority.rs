//! Scheduling priority classes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered scheduling tiers, most urgent first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Maximum,
    Interactive,
    ImmediateSplitfile,
    Update,
    #[default]
    Bulk,
    Prefetch,
    Paused,
}

impl PriorityClass {
    /// Number of classes.
    pub const COUNT: usize = 7;

    /// All classes in scheduling order.
    pub const ALL: [PriorityClass; Self::COUNT] = [
        PriorityClass::Maximum,
        PriorityClass::Interactive,
        PriorityClass::ImmediateSplitfile,
        PriorityClass::Update,
        PriorityClass::Bulk,
        PriorityClass::Prefetch,
        PriorityClass::Paused,
    ];

    /// Position in [`PriorityClass::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Maximum => "maximum",
            PriorityClass::Interactive => "interactive",
            PriorityClass::ImmediateSplitfile => "immediate_splitfile",
            PriorityClass::Update => "update",
            PriorityClass::Bulk => "bulk",
            PriorityClass::Prefetch => "prefetch",
            PriorityClass::Paused => "paused",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
