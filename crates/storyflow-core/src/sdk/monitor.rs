use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use super::result::SdkErrorKind;

/// Aggregate counters over every SDK call an executor has run.
#[derive(Debug, Default)]
pub struct SdkMonitor {
    inner: Mutex<MonitorSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub total_calls: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_agent: BTreeMap<String, AgentStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub calls: u64,
    pub successes: u64,
    pub total_secs: f64,
}

impl MonitorSnapshot {
    pub fn count(&self, kind: SdkErrorKind) -> u64 {
        self.by_kind.get(kind.as_str()).copied().unwrap_or(0)
    }
}

impl SdkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent: &str, kind: SdkErrorKind, success: bool, duration: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.total_calls += 1;
        *inner.by_kind.entry(kind.as_str().to_string()).or_default() += 1;
        let stats = inner.by_agent.entry(agent.to_string()).or_default();
        stats.calls += 1;
        stats.total_secs += duration.as_secs_f64();
        if success {
            stats.successes += 1;
        }
        tracing::debug!(
            agent,
            kind = kind.as_str(),
            success,
            secs = duration.as_secs_f64(),
            "sdk call finished"
        );
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
