//! Engine-wide tuning knobs with conversative defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_BUFFER_BYTES};
use crate::reconcile::SimilarityConfig;

/// Configuration shared by every pipeline the orchestrator builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Quiet period after the last output chunk before an idle trigger fires.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    /// Cap on each detector's cumulative raw buffer.
    pub max_buffer_bytes: usize,
    pub similarity: SimilarityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            similarity: SimilarityConfig::default(),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_millis(1000));
        assert_eq!(config.max_buffer_bytes, 512 * 1024);
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(250),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.idle_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: EngineConfig = serde_json::from_str(r#"{"idleTimeout": 500}"#).unwrap();
        assert_eq!(parsed.idle_timeout, Duration::from_millis(500));
        assert_eq!(parsed.max_buffer_bytes, 512 * 1024);
    }
}
