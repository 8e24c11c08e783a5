//! Normalised telemetry records and the channel that carries them.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::value::Value;

/// A normalised telemetry record.
///
/// Two forms travel through the system. The *raw* form carries all metrics
/// of one provider frame with reserved keys `__service__`, `__prefix__`,
/// and `__update_timestamp__`. The *split* form carries exactly one metric
/// under the keys `prefix`, `labels`, `timestamp`, `system_id`, `key`, and
/// `value`.
pub type DataStore = HashMap<String, Value>;

/// A record paired with its output routing string (`"<sink>::<stream>"`,
/// optionally suffixed `::raw`).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtDataStore {
    pub ds: DataStore,
    pub output: String,
}

/// Sending half of the inter-component record channel.
pub type ExtDsSender = mpsc::Sender<ExtDataStore>;

/// Receiving half of the inter-component record channel.
pub type ExtDsReceiver = mpsc::Receiver<ExtDataStore>;

impl ExtDataStore {
    /// Splits the output routing string into sink name and stream.
    pub fn route(&self) -> Option<(&str, &str)> {
        self.output.split_once("::")
    }

    /// True when the record was routed with the `::raw` suffix.
    pub fn is_raw(&self) -> bool {
        self.output.ends_with("::raw")
    }
}
