//! Recent-poller bookkeeping for Describe.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::settings::PollerHistorySettings;
use crate::task::now_epoch_ms;

#[derive(Debug, Clone, PartialEq)]
pub struct PollerInfo {
    pub identity: String,
    pub last_access_time_ms: i64,
    pub rate_per_second: Option<f64>,
}

/// Bounded map of pollers seen in the last few minutes. Entries expire
/// on TTL; when full, the stalest entry makes room.
pub struct PollerHistory {
    settings: PollerHistorySettings,
    entries: Mutex<HashMap<String, PollerInfo>>,
}

impl PollerHistory {
    pub fn new(settings: PollerHistorySettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, identity: &str, rate_per_second: Option<f64>) {
        let mut entries = self.entries.lock().unwrap();
        let now_ms = now_epoch_ms();
        if !entries.contains_key(identity) && entries.len() >= self.settings.capacity {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, info)| info.last_access_time_ms)
                .map(|(id, _)| id.clone())
            {
                entries.remove(&stalest);
            }
        }
        entries.insert(
            identity.to_string(),
            PollerInfo {
                identity: identity.to_string(),
                last_access_time_ms: now_ms,
                rate_per_second,
            },
        );
    }

    /// All unexpired pollers, most recent first.
    pub fn pollers(&self) -> Vec<PollerInfo> {
        let mut entries = self.entries.lock().unwrap();
        let cutoff_ms = now_epoch_ms() - self.settings.ttl().as_millis() as i64;
        entries.retain(|_, info| info.last_access_time_ms >= cutoff_ms);
        let mut pollers: Vec<PollerInfo> = entries.values().cloned().collect();
        pollers.sort_by_key(|info| std::cmp::Reverse(info.last_access_time_ms));
        pollers
    }
}
