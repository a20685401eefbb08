use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::{ConfigError, DeviceConfig};
use crate::connection::{self, ConnectionError, DeviceEvent, TuyaSession};
use crate::discovery::{self, DiscoveredDevice, DiscoveryError};
use crate::protocol::{CommandType, Payload, Version};

/// Poked by `refresh` until discovery tunes the set from a broadcast.
const DEFAULT_REFRESH_DP_IDS: [u32; 6] = [4, 5, 6, 18, 19, 20];

// Diagnostic strings quirky firmwares answer queries with
const JSON_UNVALID: &str = "json obj data unvalid";
const DATA_FORMAT_ERROR: &str = "data format error";

#[derive(Debug)]
pub enum DeviceError {
    Config(ConfigError),
    Connection(ConnectionError),
    Discovery(DiscoveryError),
    UnexpectedAnswer(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Config(e) => write!(f, "Config error: {e}"),
            DeviceError::Connection(e) => write!(f, "Connection error: {e}"),
            DeviceError::Discovery(e) => write!(f, "Discovery error: {e}"),
            DeviceError::UnexpectedAnswer(msg) => write!(f, "Unexpected device answer: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<ConfigError> for DeviceError {
    fn from(e: ConfigError) -> Self {
        DeviceError::Config(e)
    }
}

impl From<ConnectionError> for DeviceError {
    fn from(e: ConnectionError) -> Self {
        DeviceError::Connection(e)
    }
}

impl From<DiscoveryError> for DeviceError {
    fn from(e: DiscoveryError) -> Self {
        DeviceError::Discovery(e)
    }
}

/// Options for `get` and `refresh`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Return the whole payload instead of a single DP value.
    pub schema: bool,
    /// Return this DP index; defaults to DP 1.
    pub dps: Option<u32>,
    /// Sub-device id, for devices behind a gateway.
    pub cid: Option<String>,
}

/// Options for `set`. Either a `dps`/`set` pair or `multiple` + `data`.
#[derive(Debug, Clone)]
pub struct SetOptions {
    pub dps: Option<u32>,
    pub set: Option<Value>,
    pub multiple: bool,
    pub data: Option<Value>,
    pub cid: Option<String>,
    pub wait_for_response: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        SetOptions {
            dps: None,
            set: None,
            multiple: false,
            data: None,
            cid: None,
            wait_for_response: true,
        }
    }
}

/// A handle to one device on the LAN. Cheap to clone; all clones drive the
/// same connection.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    config: Mutex<DeviceConfig>,
    session: Arc<TuyaSession>,
    refresh_dp_ids: Mutex<Vec<u32>>,
    // One set on the wire at a time; later calls queue here
    set_gate: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Build a device handle from a validated config.
    pub fn new(config: DeviceConfig) -> Result<Device, DeviceError> {
        config.validate()?;
        let session = connection::new_session(&config);
        Ok(Device {
            inner: Arc::new(DeviceInner {
                config: Mutex::new(config),
                session,
                refresh_dp_ids: Mutex::new(DEFAULT_REFRESH_DP_IDS.to_vec()),
                set_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Resolve the missing half of `(id, ip)` from a presence broadcast and
    /// absorb what the broadcast reports.
    pub async fn find(&self) -> Result<DiscoveredDevice, DeviceError> {
        let snapshot = self.inner.config.lock().unwrap().clone();
        let found = discovery::find(&snapshot).await?;

        let mut config = self.inner.config.lock().unwrap();
        if config.id.is_none() {
            config.id = Some(found.id.clone());
        }
        config.ip = Some(found.ip.clone());
        connection::set_target(&self.inner.session, found.ip.clone());
        if found.product_key.is_some() {
            config.product_key = found.product_key.clone();
        }
        if let Some(version) = found.version {
            if version != config.version {
                tracing::info!(%version, "Broadcast reports a different protocol version");
                config.version = version;
                connection::set_version(&self.inner.session, version);
            }
        }
        if let Some(ref dps) = found.dps {
            *self.inner.refresh_dp_ids.lock().unwrap() = discovery::refresh_dp_ids(dps);
        }
        Ok(found)
    }

    /// Connect (including the v3.4/v3.5 handshake) and run the on-connect
    /// hooks configured on the device.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        connection::connect(&self.inner.session).await?;

        let (get_on_connect, refresh_on_connect, refresh_on_ping) = {
            let config = self.inner.config.lock().unwrap();
            (
                config.issue_get_on_connect,
                config.issue_refresh_on_connect,
                config.issue_refresh_on_ping,
            )
        };
        if get_on_connect {
            let device = self.clone();
            tokio::spawn(async move {
                if let Err(e) = device.get(GetOptions::default()).await {
                    tracing::debug!("Initial get failed: {e}");
                }
            });
        }
        if refresh_on_connect {
            let device = self.clone();
            tokio::spawn(async move {
                if let Err(e) = device.refresh(GetOptions::default()).await {
                    tracing::debug!("Initial refresh failed: {e}");
                }
            });
        }
        if refresh_on_ping {
            let device = self.clone();
            tokio::spawn(async move {
                device.follow_heartbeats().await;
            });
        }
        Ok(())
    }

    /// While connected, answer every heartbeat pong with a refresh + get.
    async fn follow_heartbeats(&self) {
        let mut events = self.subscribe();
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Heartbeat) => {
                    let _ = self.refresh(GetOptions::default()).await;
                    let _ = self.get(GetOptions::default()).await;
                }
                Ok(DeviceEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
    }

    pub async fn disconnect(&self) {
        connection::disconnect(&self.inner.session).await;
    }

    pub fn is_connected(&self) -> bool {
        connection::is_connected(&self.inner.session)
    }

    /// Watch `data`, `dp-refresh`, connection transitions, and errors.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        connection::subscribe(&self.inner.session)
    }

    /// Query the device's DPs. Returns the whole payload with
    /// `schema: true`, the requested DP with `dps`, or DP 1.
    pub async fn get(&self, options: GetOptions) -> Result<Value, DeviceError> {
        let (payload, command, version) = {
            let config = self.inner.config.lock().unwrap();
            let mut payload = base_payload(&config);
            payload["dps"] = json!({});
            if let Some(ref cid) = options.cid {
                payload["cid"] = json!(cid);
            }
            let command = if config.version.requires_handshake() {
                CommandType::DpQueryNew
            } else {
                CommandType::DpQuery
            };
            (payload, command, config.version)
        };

        let message = connection::request(
            &self.inner.session,
            command,
            &to_bytes(&payload),
            true,
        )
        .await?;
        let answer = self
            .resolve_query_answer(version, message.payload, options.cid.clone())
            .await?;
        Ok(extract(&options, answer))
    }

    /// Ask the device to report DPs that otherwise stay silent
    /// (`DP_REFRESH`), using the auto-tuned index set.
    pub async fn refresh(&self, options: GetOptions) -> Result<Value, DeviceError> {
        let (payload, version) = {
            let config = self.inner.config.lock().unwrap();
            let mut payload = base_payload(&config);
            payload["dpId"] = json!(self.inner.refresh_dp_ids.lock().unwrap().clone());
            if let Some(ref cid) = options.cid {
                payload["cid"] = json!(cid);
            }
            (payload, config.version)
        };

        let message = connection::request(
            &self.inner.session,
            CommandType::DpRefresh,
            &to_bytes(&payload),
            true,
        )
        .await?;
        let answer = self
            .resolve_query_answer(version, message.payload, options.cid.clone())
            .await?;
        Ok(extract(&options, answer))
    }

    /// Quirky firmwares cannot answer a plain query; a null set elicits the
    /// same status report through a different code path.
    async fn resolve_query_answer(
        &self,
        version: Version,
        payload: Payload,
        cid: Option<String>,
    ) -> Result<Value, DeviceError> {
        let quirky = matches!(
            payload.as_text(),
            Some(JSON_UNVALID) | Some(DATA_FORMAT_ERROR)
        ) || version == Version::V32;

        if !quirky {
            return Ok(payload.as_json().cloned().unwrap_or(Value::Null));
        }
        tracing::debug!("Query answered with a diagnostic string; retrying as a null set");
        self.send_dps(Value::Null, cid, true).await
    }

    /// Change DPs. A single `dps`/`set` pair, or `multiple` with a `data`
    /// map. Waits for the STATUS reply unless told not to.
    pub async fn set(&self, options: SetOptions) -> Result<Value, DeviceError> {
        let dps = if options.multiple {
            options.data.clone().ok_or(ConfigError::MissingSetArguments)?
        } else {
            let index = options.dps.ok_or(ConfigError::MissingSetArguments)?;
            let value = options.set.clone().ok_or(ConfigError::MissingSetArguments)?;
            json!({ index.to_string(): value })
        };
        self.send_dps(dps, options.cid.clone(), options.wait_for_response)
            .await
    }

    async fn send_dps(
        &self,
        dps: Value,
        cid: Option<String>,
        wait: bool,
    ) -> Result<Value, DeviceError> {
        let _one_at_a_time = self.inner.set_gate.lock().await;

        let (payload, command, version) = {
            let config = self.inner.config.lock().unwrap();
            let t = timestamp_str();
            let payload = if config.version.requires_handshake() {
                let data = match cid {
                    Some(ref cid) => json!({"cid": cid, "ctype": 0, "dps": dps}),
                    None => json!({
                        "ctype": 0,
                        "gwId": config.gateway_id(),
                        "devId": config.device_id(),
                        "uid": config.device_id(),
                        "dps": dps,
                    }),
                };
                json!({"data": data, "protocol": 5, "t": t})
            } else {
                let mut payload = base_payload(&config);
                payload["dps"] = dps;
                if let Some(ref cid) = cid {
                    payload["cid"] = json!(cid);
                }
                payload
            };
            let command = if config.version.requires_handshake() {
                CommandType::ControlNew
            } else {
                CommandType::Control
            };
            (payload, command, config.version)
        };

        if version == Version::V35 {
            connection::bump_seqno(&self.inner.session);
        }
        let status = connection::send_set(
            &self.inner.session,
            command,
            &to_bytes(&payload),
            wait,
        )
        .await?;
        Ok(status
            .and_then(|payload| payload.as_json().cloned())
            .unwrap_or(Value::Null))
    }

    /// Flip a boolean DP and report its new value. Defaults to DP 1.
    pub async fn toggle(&self, dp: Option<u32>) -> Result<bool, DeviceError> {
        let dp = dp.unwrap_or(1);
        let options = GetOptions {
            dps: Some(dp),
            ..Default::default()
        };

        let current = self.get(options.clone()).await?;
        let current = current.as_bool().ok_or_else(|| {
            DeviceError::UnexpectedAnswer(format!("DP {dp} is not a boolean: {current}"))
        })?;

        self.set(SetOptions {
            dps: Some(dp),
            set: Some(json!(!current)),
            ..Default::default()
        })
        .await?;

        let after = self.get(options).await?;
        after.as_bool().ok_or_else(|| {
            DeviceError::UnexpectedAnswer(format!("DP {dp} is not a boolean: {after}"))
        })
    }
}

/// `{gwId, devId, t, uid}`: the skeleton every request payload shares.
fn base_payload(config: &DeviceConfig) -> Value {
    json!({
        "gwId": config.gateway_id(),
        "devId": config.device_id(),
        "t": timestamp_str(),
        "uid": config.device_id(),
    })
}

fn extract(options: &GetOptions, answer: Value) -> Value {
    if options.schema {
        return answer;
    }
    let index = options.dps.unwrap_or(1);
    answer
        .get("dps")
        .and_then(|dps| dps.get(index.to_string()))
        .cloned()
        .unwrap_or(Value::Null)
}

fn to_bytes(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).expect("JSON serialization cannot fail for known-good data")
}

fn timestamp_str() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::TuyaCipher;
    use crate::protocol::{self, build_frame};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const KEY: &str = "4226aa407d5c1e2b";
    const KEY_BYTES: [u8; 16] = *b"4226aa407d5c1e2b";
    const DEVICE_ID: &str = "22325186db4a2217dc8e";

    fn test_device(port: u16, get_on_connect: bool) -> Device {
        let mut config = DeviceConfig::new(KEY)
            .unwrap()
            .with_id(DEVICE_ID)
            .with_ip("127.0.0.1")
            .with_port(port)
            .with_version(Version::V33);
        config.issue_get_on_connect = get_on_connect;
        Device::new(config).unwrap()
    }

    struct StubHandles {
        port: u16,
        control_log: Arc<Mutex<Vec<Value>>>,
        query_count: Arc<std::sync::atomic::AtomicUsize>,
    }

    /// A minimal v3.3 device: answers queries from a DP table, applies
    /// controls and reports them back as STATUS, answers heartbeats.
    async fn spawn_stub(initial_dps: Value, quirky_queries: bool) -> StubHandles {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let control_log = Arc::new(Mutex::new(Vec::new()));
        let query_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let log = control_log.clone();
        let queries = query_count.clone();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let cipher = TuyaCipher::new(KEY_BYTES, Version::V33);
            let mut dps = initial_dps;

            loop {
                let Ok(bytes) =
                    crate::connection::read_frame_bytes(&mut stream, Version::V33).await
                else {
                    break;
                };
                let Ok(messages) = protocol::parse_frames(&cipher, &bytes) else {
                    continue;
                };
                for message in messages {
                    match message.command {
                        CommandType::DpQuery => {
                            queries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            let reply = if quirky_queries {
                                build_frame(
                                    &cipher,
                                    message.seqno,
                                    CommandType::DpQuery,
                                    JSON_UNVALID.as_bytes(),
                                    true,
                                )
                            } else {
                                build_frame(
                                    &cipher,
                                    message.seqno,
                                    CommandType::DpQuery,
                                    &to_bytes(&json!({"dps": dps})),
                                    true,
                                )
                            }
                            .unwrap();
                            stream.write_all(&reply).await.unwrap();
                        }
                        CommandType::Control => {
                            let requested = message
                                .payload
                                .as_json()
                                .and_then(|p| p.get("dps"))
                                .cloned()
                                .unwrap_or(Value::Null);
                            log.lock().unwrap().push(requested.clone());
                            if let Some(changes) = requested.as_object() {
                                for (k, v) in changes {
                                    dps[k] = v.clone();
                                }
                            }
                            let reply = build_frame(
                                &cipher,
                                0,
                                CommandType::Status,
                                &to_bytes(&json!({"dps": dps})),
                                true,
                            )
                            .unwrap();
                            stream.write_all(&reply).await.unwrap();
                        }
                        CommandType::DpRefresh => {
                            let reply = build_frame(
                                &cipher,
                                message.seqno,
                                CommandType::DpRefresh,
                                &to_bytes(&json!({"dps": dps})),
                                true,
                            )
                            .unwrap();
                            stream.write_all(&reply).await.unwrap();
                        }
                        CommandType::HeartBeat => {
                            let reply = build_frame(
                                &cipher,
                                message.seqno,
                                CommandType::HeartBeat,
                                b"",
                                true,
                            )
                            .unwrap();
                            stream.write_all(&reply).await.unwrap();
                        }
                        _ => {}
                    }
                }
            }
        });
        StubHandles {
            port,
            control_log,
            query_count,
        }
    }

    #[tokio::test]
    async fn get_returns_default_single_and_schema_views() {
        let stub = spawn_stub(json!({"1": true, "2": 17}), false).await;
        let device = test_device(stub.port, false);

        // Default view: DP 1
        assert_eq!(device.get(GetOptions::default()).await.unwrap(), json!(true));
        // Single DP
        let single = device
            .get(GetOptions {
                dps: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(single, json!(17));
        // Whole payload
        let schema = device
            .get(GetOptions {
                schema: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(schema["dps"], json!({"1": true, "2": 17}));

        device.disconnect().await;
    }

    #[tokio::test]
    async fn set_without_arguments_is_rejected() {
        let stub = spawn_stub(json!({"1": true}), false).await;
        let device = test_device(stub.port, false);
        let result = device.set(SetOptions::default()).await;
        assert!(matches!(
            result,
            Err(DeviceError::Config(ConfigError::MissingSetArguments))
        ));
    }

    #[tokio::test]
    async fn toggle_twice_is_identity() {
        let stub = spawn_stub(json!({"1": true}), false).await;
        let device = test_device(stub.port, false);

        let flipped = device.toggle(None).await.unwrap();
        assert!(!flipped);
        let restored = device.toggle(None).await.unwrap();
        assert!(restored);

        device.disconnect().await;
    }

    #[tokio::test]
    async fn sequential_sets_arrive_in_order() {
        let stub = spawn_stub(json!({"1": false, "2": 0}), false).await;
        let device = test_device(stub.port, false);

        device
            .set(SetOptions {
                dps: Some(2),
                set: Some(json!(25)),
                ..Default::default()
            })
            .await
            .unwrap();
        device
            .set(SetOptions {
                multiple: true,
                data: Some(json!({"1": true, "2": 50})),
                ..Default::default()
            })
            .await
            .unwrap();

        let log = stub.control_log.lock().unwrap();
        assert_eq!(log.as_slice(), [json!({"2": 25}), json!({"1": true, "2": 50})]);
        device.disconnect().await;
    }

    #[tokio::test]
    async fn quirky_firmware_falls_back_to_null_set() {
        let stub = spawn_stub(json!({"1": false, "6": 55}), true).await;
        let device = test_device(stub.port, false);

        let schema = device
            .get(GetOptions {
                schema: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(schema["dps"], json!({"1": false, "6": 55}));
        // The answer came through the null-set path
        assert_eq!(stub.control_log.lock().unwrap().as_slice(), [Value::Null]);
        device.disconnect().await;
    }

    #[tokio::test]
    async fn refresh_reports_requested_dps() {
        let stub = spawn_stub(json!({"1": true, "18": 225}), false).await;
        let device = test_device(stub.port, false);

        let report = device
            .refresh(GetOptions {
                schema: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report["dps"]["18"], json!(225));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn connect_auto_issues_get() {
        let stub = spawn_stub(json!({"1": true}), false).await;
        let device = test_device(stub.port, true);
        device.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if stub.query_count.load(std::sync::atomic::Ordering::Relaxed) > 0 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no query reached the device after connect"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        device.disconnect().await;
    }
}
