//! Disaster-recovery events
//!
//! A [`DrEvent`] identifies one backup or restore run. Its full name embeds
//! the start time so repeated runs of the same recipe never collide.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped execution of a backup or restore recipe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrEvent {
    /// Recipe name (e.g. "backup-billing")
    pub name: String,
    /// When the run started
    pub start_time: DateTime<Utc>,
    /// When the run finished, once stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl DrEvent {
    /// Start a new event now
    pub fn start(name: impl Into<String>) -> Self {
        Self::start_at(name, Utc::now())
    }

    /// Start a new event at a given time
    pub fn start_at(name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start_time,
            end_time: None,
        }
    }

    /// `name-<RFC3339 start time>` with colons replaced, safe for paths and labels
    pub fn full_name(&self) -> String {
        let ts = self
            .start_time
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .replace(':', "-");
        format!("{}-{}", self.name, ts)
    }

    /// Mark the event finished. Only the first call has any effect.
    pub fn stop(&mut self) {
        self.stop_at(Utc::now());
    }

    /// Mark the event finished at a given time. Only the first call has any effect.
    pub fn stop_at(&mut self, end_time: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(end_time);
        }
    }

    /// Whether the event has been stopped
    pub fn is_stopped(&self) -> bool {
        self.end_time.is_some()
    }

    /// Run duration, once stopped
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
