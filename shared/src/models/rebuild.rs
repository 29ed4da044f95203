//! Rebuild Job Model

use serde::{Deserialize, Serialize};

/// Polled state of a background projection rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RebuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
}

impl RebuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RebuildStatus::Succeeded | RebuildStatus::Failed { .. })
    }
}
