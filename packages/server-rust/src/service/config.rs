use std::time::Duration;

use chrono::TimeDelta;
use plugin_core::{default_retention, PitFormatType};

/// Service-level configuration for the operation registry and dispatcher.
///
/// Controls operation retention, background purge cadence and data-transfer tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier of this plugin node, reported by `/health` and on every
    /// operation span.
    pub node_id: String,
    /// How long a terminal operation stays queryable (`purgeTime - endTime`).
    pub operation_retention: TimeDelta,
    /// Interval between purge sweeps of expired operations.
    pub purge_interval: Duration,
    /// Artificial delay before an async worker starts moving data. Models
    /// long-running work; zero disables it.
    pub simulated_work_delay: Duration,
    /// Chunk size for copying stream bytes. Cancellation is checked per chunk.
    pub copy_buffer_size: usize,
    /// Pit format for new recovery points.
    pub default_format: PitFormatType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            operation_retention: default_retention(),
            purge_interval: Duration::from_secs(300),
            simulated_work_delay: Duration::ZERO,
            copy_buffer_size: 64 * 1024,
            default_format: PitFormatType::default(),
        }
    }
}
