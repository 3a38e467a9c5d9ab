use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "CANOPY_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    pub admission: AdmissionConfig,
    pub operator: OperatorAuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Max time to wait for the broker session to come up during `connect()`.
    #[serde(default = "default_mqtt_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Topic the devices publish complete telemetry snapshots to.
    pub telemetry_topic: String,
    /// Topic the control-plane publishes device commands to.
    pub command_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Requests allowed per window per client; 0 disables rate limiting.
    pub limit: u32,
    pub window_secs: u64,
    /// Window violations before an automatic ban.
    pub violation_limit: u32,
    pub ban_duration_secs: u64,
    /// How often the durable rate-limit settings row is re-read.
    pub settings_refresh_secs: u64,
    /// Minimum interval between lazy sweeps of stale per-client state.
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorAuthConfig {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    pub header_name: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

fn default_mqtt_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_connect_timeout_secs() -> u64 {
    10
}

impl MqttConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("mqtt.host cannot be empty");
        }
        if self.port == 0 {
            anyhow::bail!("mqtt.port must be > 0");
        }
        if self.telemetry_topic.trim().is_empty() {
            anyhow::bail!("mqtt.telemetry_topic cannot be empty");
        }
        if self.command_topic.trim().is_empty() {
            anyhow::bail!("mqtt.command_topic cannot be empty");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("mqtt.connect_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_secs == 0 {
            anyhow::bail!("admission.window_secs must be > 0");
        }
        if self.violation_limit == 0 {
            anyhow::bail!("admission.violation_limit must be > 0");
        }
        if self.settings_refresh_secs == 0 {
            anyhow::bail!("admission.settings_refresh_secs must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("mqtt.host", "127.0.0.1")?
        .set_default("mqtt.port", 1883)?
        .set_default("mqtt.username", "")?
        .set_default("mqtt.password", "")?
        .set_default("mqtt.use_tls", false)?
        .set_default("mqtt.keep_alive_secs", default_mqtt_keep_alive_secs())?
        .set_default(
            "mqtt.connect_timeout_secs",
            default_mqtt_connect_timeout_secs(),
        )?
        .set_default("mqtt.telemetry_topic", "canopy/env_data")?
        .set_default("mqtt.command_topic", "canopy/cmd/set")?
        .set_default("admission.limit", 60u32)?
        .set_default("admission.window_secs", 60u64)?
        .set_default("admission.violation_limit", 5u32)?
        .set_default("admission.ban_duration_secs", 24 * 60 * 60u64)?
        .set_default("admission.settings_refresh_secs", 60u64)?
        .set_default("admission.cleanup_interval_secs", 5 * 60u64)?
        .set_default("operator.tokens", vec!["dev-operator-token"])?
        .set_default("operator.header_name", "authorization")?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    app.mqtt.validate()?;
    app.admission.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_control_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        for (key, _) in &existing {
            unsafe { env::remove_var(key) };
        }

        for (key, value) in vars {
            unsafe { env::set_var(key, value) };
        }

        let result = panic::catch_unwind(test);

        for (key, _) in vars {
            unsafe { env::remove_var(key) };
        }

        for (key, value) in existing {
            unsafe { env::set_var(key, value) };
        }

        result.unwrap();
    }

    #[test]
    fn defaults_load_without_environment() {
        with_control_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.admission.limit, 60);
            assert_eq!(cfg.admission.violation_limit, 5);
            assert_eq!(cfg.mqtt.port, 1883);
            assert_eq!(cfg.mqtt.telemetry_topic, "canopy/env_data");
        });
    }

    #[test]
    fn numeric_and_bool_env_values_parse() {
        with_control_plane_env(
            &[
                ("CANOPY_CP__SERVER__PORT", "9191"),
                ("CANOPY_CP__ADMISSION__LIMIT", "5"),
                ("CANOPY_CP__MQTT__USE_TLS", "true"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.server.port, 9191);
                assert_eq!(cfg.admission.limit, 5);
                assert!(cfg.mqtt.use_tls);
            },
        );
    }

    #[test]
    fn operator_tokens_accept_comma_separated_string() {
        with_control_plane_env(&[("CANOPY_CP__OPERATOR__TOKENS", "1111,2222")], || {
            let cfg = load().expect("config loads");
            assert_eq!(
                cfg.operator.tokens,
                vec!["1111".to_string(), "2222".to_string()]
            );
        });
    }

    #[test]
    fn empty_mqtt_host_is_rejected() {
        with_control_plane_env(&[("CANOPY_CP__MQTT__HOST", " ")], || {
            assert!(load().is_err());
        });
    }
}
