use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::api::{CommandRequest, DeviceSnapshot, InvalidCommand};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("broker link is not connected")]
    NotConnected,
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] InvalidCommand),
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("timed out waiting for broker session")]
    ConnectTimeout,
    #[error("broker request failed: {0}")]
    Broker(#[from] rumqttc::ClientError),
}

type SnapshotCallback = Box<dyn Fn(Arc<DeviceSnapshot>) + Send + Sync>;

/// Owns the single physical broker connection and decouples it from any
/// number of logical readers and writers.
///
/// Exactly one instance exists per process, constructed in `run()` and
/// injected through `AppState`. The gateway is deliberately passive: a lost
/// connection flips `is_connected()` to false and stops the event loop, and
/// reconnection happens when the next caller that needs the link invokes
/// `connect()` again. No retry loop runs in the background.
#[derive(Clone)]
pub struct BrokerGateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: MqttConfig,
    connected: AtomicBool,
    client: Mutex<Option<AsyncClient>>,
    snapshot: RwLock<Option<Arc<DeviceSnapshot>>>,
    // BTreeMap keyed by a monotonic id keeps dispatch in registration order.
    subscribers: Mutex<BTreeMap<u64, SnapshotCallback>>,
    next_subscriber_id: AtomicU64,
    // Serializes connect() so two concurrent calls cannot open two sessions.
    connect_lock: tokio::sync::Mutex<()>,
    // Bumped on every connect(); an event-loop task exits once superseded.
    generation: AtomicU64,
}

/// Registration handle returned by [`BrokerGateway::subscribe`]. Dropping it
/// (or calling `unsubscribe`) deregisters the callback; the subscriber
/// receives no further snapshots afterwards.
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .remove(&self.id);
        }
    }
}

impl BrokerGateway {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                client: Mutex::new(None),
                snapshot: RwLock::new(None),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Establishes the broker session and the telemetry subscription.
    /// Idempotent: a no-op while the link is already up. Returns once the
    /// broker acknowledged the session or the attempt failed; callers retry
    /// when they next need the connection.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let cfg = &self.inner.config;
        let client_id = format!("canopy-cp-{}", short_id());
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }
        if cfg.use_tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: Vec::new(),
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        client
            .subscribe(cfg.telemetry_topic.clone(), QoS::AtLeastOnce)
            .await?;

        *self.inner.client.lock().expect("client lock poisoned") = Some(client);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_event_loop(
            Arc::clone(&self.inner),
            eventloop,
            generation,
            ready_tx,
        ));

        let timeout = Duration::from_secs(cfg.connect_timeout_secs);
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    host = %cfg.host,
                    port = cfg.port,
                    topic = %cfg.telemetry_topic,
                    "broker session established"
                );
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                self.abandon_attempt();
                Err(GatewayError::Connect(reason))
            }
            Ok(Err(_)) => {
                self.abandon_attempt();
                Err(GatewayError::Connect("event loop terminated".to_string()))
            }
            Err(_) => {
                self.abandon_attempt();
                Err(GatewayError::ConnectTimeout)
            }
        }
    }

    fn abandon_attempt(&self) {
        // Invalidate the just-spawned event loop so a late ConnAck cannot
        // flip the gateway to connected behind the caller's back.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.client.lock().expect("client lock poisoned") = None;
    }

    /// Most recent telemetry snapshot, if any has arrived. Non-blocking.
    pub fn latest_snapshot(&self) -> Option<Arc<DeviceSnapshot>> {
        self.inner
            .snapshot
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// Registers a callback invoked synchronously for every new snapshot.
    ///
    /// Callbacks run inside the broker read loop and must not block: hand the
    /// snapshot off to your own channel and return.
    pub fn subscribe(
        &self,
        callback: impl Fn(Arc<DeviceSnapshot>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, Box::new(callback));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Validates and publishes a device command. Fire-and-forget: success
    /// means "accepted for publish", not "device executed". The gateway never
    /// reconnects implicitly here so repeated link failures stay visible to
    /// the caller.
    pub async fn send_command(&self, command: &CommandRequest) -> Result<(), GatewayError> {
        command.validate()?;

        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let client = self
            .inner
            .client
            .lock()
            .expect("client lock poisoned")
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        let payload = build_command_payload(command);
        let body = payload.to_string();
        match client
            .publish(
                self.inner.config.command_topic.clone(),
                QoS::AtLeastOnce,
                false,
                body,
            )
            .await
        {
            Ok(()) => {
                crate::metrics::record_command_published(command.kind());
                Ok(())
            }
            Err(err) => {
                crate::metrics::record_command_failed(command.kind());
                Err(err.into())
            }
        }
    }

    #[cfg(test)]
    fn inject_telemetry(&self, payload: &[u8]) {
        self.inner.handle_telemetry(payload);
    }
}

/// Seam between the scheduler and the gateway, so firing logic is testable
/// without a live broker.
#[async_trait]
pub trait CommandSink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn ensure_connected(&self) -> Result<(), GatewayError>;
    async fn send_command(&self, command: &CommandRequest) -> Result<(), GatewayError>;
}

#[async_trait]
impl CommandSink for BrokerGateway {
    fn is_connected(&self) -> bool {
        BrokerGateway::is_connected(self)
    }

    async fn ensure_connected(&self) -> Result<(), GatewayError> {
        if BrokerGateway::is_connected(self) {
            Ok(())
        } else {
            self.connect().await
        }
    }

    async fn send_command(&self, command: &CommandRequest) -> Result<(), GatewayError> {
        BrokerGateway::send_command(self, command).await
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut eventloop: EventLoop,
    generation: u64,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        if inner.generation.load(Ordering::SeqCst) != generation {
            // A newer connect() owns the link now.
            return;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.connected.store(true, Ordering::SeqCst);
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == inner.config.telemetry_topic {
                    inner.handle_telemetry(&publish.payload);
                }
            }
            Ok(_) => {}
            Err(err) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err.to_string()));
                    }
                    None => warn!(%err, "broker connection lost"),
                }
                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.connected.store(false, Ordering::SeqCst);
                }
                return;
            }
        }
    }
}

impl Inner {
    fn handle_telemetry(&self, payload: &[u8]) {
        let raw: RawTelemetry = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "discarding unparseable telemetry payload");
                return;
            }
        };

        let snapshot = Arc::new(raw.into_snapshot(Utc::now()));
        *self.snapshot.write().expect("snapshot lock poisoned") = Some(Arc::clone(&snapshot));
        crate::metrics::record_snapshot_received();

        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for (id, callback) in subscribers.iter() {
            // One misbehaving subscriber must not take the others down.
            let snapshot = Arc::clone(&snapshot);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(snapshot)))
                .is_err()
            {
                warn!(subscriber = *id, "snapshot subscriber panicked");
            }
        }
    }
}

/// Telemetry payload as the devices publish it. Firmware occasionally sends
/// numbers as strings, so every field decodes leniently and defaults to zero.
#[derive(Debug, Default, Deserialize)]
struct RawTelemetry {
    #[serde(default, deserialize_with = "lenient_i64")]
    temperature: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    humidity: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    light: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    co2: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_temp: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_water: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_ec: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_n: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_p: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    earth_k: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    relay5: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    relay6: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    relay7: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    relay8: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    led1: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    led2: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    led3: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    led4: i64,
}

impl RawTelemetry {
    fn into_snapshot(self, captured_at: DateTime<Utc>) -> DeviceSnapshot {
        DeviceSnapshot {
            temperature: self.temperature,
            humidity: self.humidity,
            light: self.light,
            co2: self.co2,
            earth_temp: self.earth_temp,
            earth_water: self.earth_water,
            earth_ec: self.earth_ec,
            earth_n: self.earth_n,
            earth_p: self.earth_p,
            earth_k: self.earth_k,
            relay5: self.relay5,
            relay6: self.relay6,
            relay7: self.relay7,
            relay8: self.relay8,
            led1: self.led1,
            led2: self.led2,
            led3: self.led3,
            led4: self.led4,
            captured_at,
        }
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Bool(b) => i64::from(b),
        _ => 0,
    })
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Builds the device write envelope. Relay N addresses `node060{N-4}`, light
/// channel i addresses `node050{i}`; values travel as strings per the device
/// protocol (`rw_prot` version 1.0.1).
fn build_command_payload(command: &CommandRequest) -> Value {
    let w_data: Vec<Value> = match command {
        CommandRequest::Relay { relay_num, state } => {
            let node = format!("node060{}", relay_num - 4);
            vec![json!({ "name": node, "value": state.to_string() })]
        }
        CommandRequest::Light {
            led1,
            led2,
            led3,
            led4,
        } => [led1, led2, led3, led4]
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                json!({
                    "name": format!("node050{}", i + 1),
                    "value": channel.unwrap_or(0).to_string(),
                })
            })
            .collect(),
    };

    json!({
        "rw_prot": {
            "Ver": "1.0.1",
            "dir": "down",
            "id": short_id(),
            "w_data": w_data,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_config() -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            use_tls: false,
            keep_alive_secs: 60,
            connect_timeout_secs: 1,
            telemetry_topic: "canopy/env_data".into(),
            command_topic: "canopy/cmd/set".into(),
        }
    }

    #[test]
    fn latest_snapshot_tracks_most_recent_message() {
        let gateway = BrokerGateway::new(test_config());
        assert!(gateway.latest_snapshot().is_none());

        gateway.inject_telemetry(br#"{"temperature": 215, "humidity": 640}"#);
        let first = gateway.latest_snapshot().expect("snapshot after message");
        assert_eq!(first.temperature, 215);
        assert_eq!(first.humidity, 640);
        assert_eq!(first.co2, 0, "missing fields default to zero");

        gateway.inject_telemetry(br#"{"temperature": 230}"#);
        let second = gateway.latest_snapshot().expect("snapshot replaced");
        assert_eq!(second.temperature, 230);
        assert_eq!(second.humidity, 0, "whole-message replace, not merge");
    }

    #[test]
    fn unparseable_telemetry_keeps_previous_snapshot() {
        let gateway = BrokerGateway::new(test_config());
        gateway.inject_telemetry(br#"{"temperature": 215}"#);
        gateway.inject_telemetry(b"not json at all");

        let snapshot = gateway.latest_snapshot().expect("snapshot survives");
        assert_eq!(snapshot.temperature, 215);
    }

    #[test]
    fn lenient_decoding_accepts_numeric_strings() {
        let gateway = BrokerGateway::new(test_config());
        gateway.inject_telemetry(br#"{"temperature": "217", "light": "12.9", "co2": [1]}"#);

        let snapshot = gateway.latest_snapshot().expect("snapshot");
        assert_eq!(snapshot.temperature, 217);
        assert_eq!(snapshot.light, 12);
        assert_eq!(snapshot.co2, 0, "non-numeric shapes default to zero");
    }

    #[test]
    fn subscribers_receive_snapshots_until_unsubscribed() {
        let gateway = BrokerGateway::new(test_config());
        let first_seen: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));
        let second_seen: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));

        let first_sink = Arc::clone(&first_seen);
        let first = gateway.subscribe(move |snap| {
            first_sink.lock().unwrap().push(snap.temperature);
        });
        let second_sink = Arc::clone(&second_seen);
        let _second = gateway.subscribe(move |snap| {
            second_sink.lock().unwrap().push(snap.temperature);
        });

        gateway.inject_telemetry(br#"{"temperature": 1}"#);
        first.unsubscribe();
        gateway.inject_telemetry(br#"{"temperature": 2}"#);

        assert_eq!(*first_seen.lock().unwrap(), vec![1]);
        assert_eq!(
            *second_seen.lock().unwrap(),
            vec![1, 2],
            "remaining subscriber is unaffected by the removal"
        );
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_rest() {
        let gateway = BrokerGateway::new(test_config());
        let seen: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));

        let _bad = gateway.subscribe(|_snap| panic!("subscriber bug"));
        let sink = Arc::clone(&seen);
        let _good = gateway.subscribe(move |snap| {
            sink.lock().unwrap().push(snap.temperature);
        });

        gateway.inject_telemetry(br#"{"temperature": 7}"#);

        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn dropping_the_subscription_deregisters() {
        let gateway = BrokerGateway::new(test_config());
        let seen: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let sink = Arc::clone(&seen);
            let _sub = gateway.subscribe(move |snap| {
                sink.lock().unwrap().push(snap.temperature);
            });
            gateway.inject_telemetry(br#"{"temperature": 1}"#);
        }
        gateway.inject_telemetry(br#"{"temperature": 2}"#);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn send_command_requires_a_connection() {
        let gateway = BrokerGateway::new(test_config());
        let command = CommandRequest::Relay {
            relay_num: 5,
            state: 1,
        };
        let err = gateway.send_command(&command).await.expect_err("offline");
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test]
    async fn send_command_validates_before_touching_the_link() {
        let gateway = BrokerGateway::new(test_config());
        let command = CommandRequest::Relay {
            relay_num: 3,
            state: 1,
        };
        let err = gateway.send_command(&command).await.expect_err("invalid");
        assert!(matches!(err, GatewayError::InvalidCommand(_)));
    }

    #[test]
    fn relay_payload_addresses_the_mapped_node() {
        let payload = build_command_payload(&CommandRequest::Relay {
            relay_num: 6,
            state: 1,
        });
        let prot = &payload["rw_prot"];
        assert_eq!(prot["Ver"], "1.0.1");
        assert_eq!(prot["dir"], "down");
        let w_data = prot["w_data"].as_array().unwrap();
        assert_eq!(w_data.len(), 1);
        assert_eq!(w_data[0]["name"], "node0602");
        assert_eq!(w_data[0]["value"], "1");
    }

    #[test]
    fn light_payload_drives_all_four_channels() {
        let payload = build_command_payload(&CommandRequest::Light {
            led1: Some(255),
            led2: None,
            led3: Some(10),
            led4: None,
        });
        let w_data = payload["rw_prot"]["w_data"].as_array().unwrap();
        assert_eq!(w_data.len(), 4);
        assert_eq!(w_data[0]["name"], "node0501");
        assert_eq!(w_data[0]["value"], "255");
        assert_eq!(w_data[1]["value"], "0", "omitted channels drive to zero");
        assert_eq!(w_data[2]["value"], "10");
        assert_eq!(w_data[3]["name"], "node0504");
    }
}
