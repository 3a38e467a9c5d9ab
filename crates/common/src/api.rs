//! Shared API DTOs used across the control-plane and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest addressable relay channel on the device bus.
pub const RELAY_MIN: u8 = 5;
/// Highest addressable relay channel on the device bus.
pub const RELAY_MAX: u8 = 8;
/// Number of dimmable light channels on the device bus.
pub const LIGHT_CHANNELS: usize = 4;

/// Latest known state of every telemetry channel, replaced wholesale on each
/// inbound device message.
///
/// Sensor readings keep the device's raw scaling (temperature and humidity are
/// multiplied by ten on the wire); relays report 0/1 and light channels 0-255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Air temperature (deci-degrees Celsius).
    pub temperature: i64,
    /// Relative humidity (per mille).
    pub humidity: i64,
    /// Light intensity (lux).
    pub light: i64,
    /// CO2 concentration (ppm).
    pub co2: i64,
    /// Soil temperature (deci-degrees Celsius).
    pub earth_temp: i64,
    /// Soil moisture (percent).
    pub earth_water: i64,
    /// Soil conductivity (uS/cm).
    pub earth_ec: i64,
    /// Soil nitrogen (mg/kg).
    pub earth_n: i64,
    /// Soil phosphorus (mg/kg).
    pub earth_p: i64,
    /// Soil potassium (mg/kg).
    pub earth_k: i64,
    /// Relay 5 state (0/1).
    pub relay5: i64,
    /// Relay 6 state (0/1).
    pub relay6: i64,
    /// Relay 7 state (0/1).
    pub relay7: i64,
    /// Relay 8 state (0/1).
    pub relay8: i64,
    /// Light channel 1 intensity (0-255).
    pub led1: i64,
    /// Light channel 2 intensity (0-255).
    pub led2: i64,
    /// Light channel 3 intensity (0-255).
    pub led3: i64,
    /// Light channel 4 intensity (0-255).
    pub led4: i64,
    /// When the control-plane received this snapshot.
    pub captured_at: DateTime<Utc>,
}

/// Validation failure for a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommand(pub String);

impl std::fmt::Display for InvalidCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvalidCommand {}

/// Outbound device command (wire format uses a lowercase `type` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommandRequest {
    /// Switch a single relay on or off.
    Relay {
        /// Relay channel, `RELAY_MIN..=RELAY_MAX`.
        relay_num: u8,
        /// Target state, 0 or 1.
        state: u8,
    },
    /// Set the four light channel intensities. Omitted channels are driven
    /// to zero; at least one channel must be present.
    Light {
        /// Light channel 1 intensity (0-255).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        led1: Option<u8>,
        /// Light channel 2 intensity (0-255).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        led2: Option<u8>,
        /// Light channel 3 intensity (0-255).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        led3: Option<u8>,
        /// Light channel 4 intensity (0-255).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        led4: Option<u8>,
    },
}

impl CommandRequest {
    /// Checks channel ids and values before the command reaches the broker.
    pub fn validate(&self) -> Result<(), InvalidCommand> {
        match self {
            CommandRequest::Relay { relay_num, state } => {
                if !(RELAY_MIN..=RELAY_MAX).contains(relay_num) {
                    return Err(InvalidCommand(format!(
                        "relay_num must be between {RELAY_MIN} and {RELAY_MAX}"
                    )));
                }
                if *state > 1 {
                    return Err(InvalidCommand("state must be 0 or 1".to_string()));
                }
                Ok(())
            }
            CommandRequest::Light {
                led1,
                led2,
                led3,
                led4,
            } => {
                if led1.is_none() && led2.is_none() && led3.is_none() && led4.is_none() {
                    return Err(InvalidCommand(
                        "at least one light channel must be provided".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Returns the canonical lowercase tag for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandRequest::Relay { .. } => "relay",
            CommandRequest::Light { .. } => "light",
        }
    }
}

/// Result of a command submission; delivery is fire-and-forget, so `success`
/// only means "accepted for publish".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the command was accepted for publish.
    pub success: bool,
    /// Human-readable outcome description.
    pub message: String,
    /// When the control-plane processed the request.
    pub timestamp: DateTime<Utc>,
}

/// Action kind stored on a scheduled task (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    /// Switch a relay at fire time.
    Relay,
    /// Drive the light channels at fire time.
    Light,
}

impl TaskAction {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Relay => "relay",
            TaskAction::Light => "light",
        }
    }
}

/// Payload for creating a scheduled task. Exactly one of `cron_expression`
/// and `execute_at` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateRequest {
    /// Display title for the task.
    pub title: String,
    /// Recurrence expression for recurring tasks.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Absolute fire time for one-shot tasks.
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    /// What the task does when it fires.
    pub action_type: TaskAction,
    /// Target relay channel; required for relay actions.
    #[serde(default)]
    pub device_id: Option<u8>,
    /// Action parameters: `{"value": 0|1}` for relays,
    /// `{"r": .., "g": .., "b": .., "w": ..}` for lights.
    pub params: serde_json::Value,
}

/// A scheduled task as reported by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Task identifier.
    pub id: i64,
    /// Display title.
    pub title: String,
    /// Recurrence expression, if recurring.
    pub cron_expression: Option<String>,
    /// Absolute fire time, if one-shot.
    pub execute_at: Option<DateTime<Utc>>,
    /// What the task does when it fires.
    pub action_type: TaskAction,
    /// Target relay channel for relay actions.
    pub device_id: Option<u8>,
    /// Action parameters.
    pub params: serde_json::Value,
    /// Whether the task is eligible for arming.
    pub is_active: bool,
    /// Computed next fire time; absent when the task is not armed
    /// (for example an invalid cron expression).
    pub next_run: Option<DateTime<Utc>>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

/// Response wrapper for the task list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    /// Active and inactive tasks, newest first.
    pub tasks: Vec<TaskResponse>,
}

/// Tunable admission-control values, stored as a single durable row and
/// hot-reloaded best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Maximum requests per window per client.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Window violations before an automatic ban.
    pub violation_limit: u32,
    /// Automatic ban duration in seconds.
    pub ban_duration_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 60,
            window_secs: 60,
            violation_limit: 5,
            ban_duration_secs: 24 * 60 * 60,
        }
    }
}

/// How a ban entry came to exist (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BanSource {
    /// Created by the admission controller after repeated violations.
    Auto,
    /// Created by an operator through the management API.
    Manual,
}

impl BanSource {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BanSource::Auto => "auto",
            BanSource::Manual => "manual",
        }
    }
}

/// Payload for creating a manual ban.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanCreateRequest {
    /// Client address to ban.
    pub ip: String,
    /// Free-form reason shown to operators.
    #[serde(default)]
    pub reason: Option<String>,
    /// Optional expiry; permanent when absent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A ban entry as reported by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanResponse {
    /// Banned client address.
    pub ip: String,
    /// Free-form reason, if any.
    pub reason: Option<String>,
    /// Whether the ban was automatic or operator-issued.
    pub source: BanSource,
    /// Operator or subsystem that issued the ban.
    pub banned_by: Option<String>,
    /// Expiry timestamp; permanent when absent.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the ban was created.
    pub created_at: DateTime<Utc>,
}

/// Response wrapper for the ban list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanListResponse {
    /// Current ban entries, newest first.
    pub bans: Vec<BanResponse>,
}

/// Service health as reported by `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the service can answer.
    pub status: String,
    /// Control-plane crate version.
    pub version: String,
    /// Latest applied database schema version.
    pub schema_version: Option<i64>,
    /// Whether the broker link is currently up.
    pub broker_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_command_round_trips_through_json() {
        let cmd = CommandRequest::Relay {
            relay_num: 6,
            state: 1,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "relay");
        assert_eq!(json["relay_num"], 6);
        let back: CommandRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn relay_command_validates_channel_range() {
        let low = CommandRequest::Relay {
            relay_num: 4,
            state: 0,
        };
        assert!(low.validate().is_err());

        let high = CommandRequest::Relay {
            relay_num: 9,
            state: 0,
        };
        assert!(high.validate().is_err());

        let state = CommandRequest::Relay {
            relay_num: 5,
            state: 2,
        };
        assert!(state.validate().is_err());

        let ok = CommandRequest::Relay {
            relay_num: 8,
            state: 1,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn light_command_requires_a_channel() {
        let empty = CommandRequest::Light {
            led1: None,
            led2: None,
            led3: None,
            led4: None,
        };
        assert!(empty.validate().is_err());

        let one = CommandRequest::Light {
            led1: Some(128),
            led2: None,
            led3: None,
            led4: None,
        };
        assert!(one.validate().is_ok());
    }

    #[test]
    fn light_command_rejects_out_of_range_values_at_parse_time() {
        let err = serde_json::from_value::<CommandRequest>(serde_json::json!({
            "type": "light",
            "led1": 300
        }));
        assert!(err.is_err(), "u8 bound should reject 300");
    }

    #[test]
    fn rate_limit_settings_default_matches_documented_values() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.limit, 60);
        assert_eq!(settings.window_secs, 60);
        assert_eq!(settings.violation_limit, 5);
        assert_eq!(settings.ban_duration_secs, 86_400);
    }
}
