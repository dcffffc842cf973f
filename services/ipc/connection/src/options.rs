//! Connection options.

use ipc_wire::DEFAULT_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum reconnect backoff
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default minimum reconnect interval
pub const DEFAULT_RECONNECT: Duration = Duration::from_millis(100);

/// Tuning applied to every dialer a connection creates, mesh peers included.
///
/// Changes take effect at the next `start` or `add_mesh_peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Upper bound of the reconnect backoff
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Delay before the first reconnect attempt
    #[serde(rename = "reconnect_ms", with = "millis")]
    pub reconnect: Duration,
    /// Largest payload accepted for sending and receiving
    pub max_message_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            reconnect: DEFAULT_RECONNECT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
