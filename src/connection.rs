use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cipher::{self, TuyaCipher};
use crate::config::DeviceConfig;
use crate::protocol::{
    self, CommandType, Payload, ProtocolError, TuyaMessage, Version, HEADER_SIZE, HEADER_SIZE_V35,
    PREFIX, PREFIX_V35, SUFFIX_SIZE,
};

/// TCP connect plus (for v3.4/v3.5) the session handshake must finish
/// within this window.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an outstanding heartbeat may stay unanswered once the next
/// tick notices it.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(2);

const SEND_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const EVENT_CHANNEL_CAPACITY: usize = 64;
// Nothing a device sends legitimately comes close to this
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Notifications surfaced to the application.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Heartbeat,
    Data {
        payload: Payload,
        command: CommandType,
        seqno: u32,
    },
    DpRefresh {
        payload: Payload,
        command: CommandType,
        seqno: u32,
    },
    Error(String),
}

#[derive(Debug)]
pub enum ConnectionError {
    Tcp(std::io::Error),
    Protocol(ProtocolError),
    ConnectTimeout,
    HandshakeIntegrity,
    NoAddress,
    NotConnected,
    Disconnected,
    GetTimeout,
    SetTimeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Tcp(e) => write!(f, "TCP error: {e}"),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ConnectionError::ConnectTimeout => write!(f, "Connection timed out"),
            ConnectionError::HandshakeIntegrity => {
                write!(f, "Session key negotiation failed the HMAC check")
            }
            ConnectionError::NoAddress => write!(f, "Device ip is not known yet; run find first"),
            ConnectionError::NotConnected => write!(f, "Not connected"),
            ConnectionError::Disconnected => write!(f, "Connection closed while waiting"),
            ConnectionError::GetTimeout => write!(f, "No response to query before the timeout"),
            ConnectionError::SetTimeout => write!(f, "No status reply to set before the timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Tcp(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

#[derive(Default)]
struct SessionState {
    writer: Option<tokio::net::tcp::OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

/// Shared session data. Not an object — just data that the connect,
/// dispatch, heartbeat, and send paths operate on.
pub struct TuyaSession {
    device_id: String,
    target: Mutex<(Option<String>, u16)>,
    cipher: Mutex<TuyaCipher>,
    seqno: AtomicU32,
    connected: AtomicBool,
    pending: Mutex<HashMap<u32, oneshot::Sender<TuyaMessage>>>,
    set_waiter: Mutex<Option<oneshot::Sender<Payload>>>,
    events: broadcast::Sender<DeviceEvent>,
    last_pong: Mutex<Option<Instant>>,
    state: tokio::sync::Mutex<SessionState>,
    heartbeat_interval: Duration,
    response_timeout_secs: u64,
    null_payload_on_json_error: bool,
}

impl fmt::Debug for TuyaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuyaSession")
            .field("device_id", &self.device_id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub fn new_session(config: &DeviceConfig) -> Arc<TuyaSession> {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Arc::new(TuyaSession {
        device_id: config.device_id().to_owned(),
        target: Mutex::new((config.ip.clone(), config.port)),
        cipher: Mutex::new(TuyaCipher::new(config.local_key, config.version)),
        seqno: AtomicU32::new(1),
        connected: AtomicBool::new(false),
        pending: Mutex::new(HashMap::new()),
        set_waiter: Mutex::new(None),
        events,
        last_pong: Mutex::new(None),
        state: tokio::sync::Mutex::new(SessionState::default()),
        heartbeat_interval: config.heartbeat_interval,
        response_timeout_secs: config.response_timeout_secs,
        null_payload_on_json_error: config.null_payload_on_json_error,
    })
}

pub fn subscribe(session: &TuyaSession) -> broadcast::Receiver<DeviceEvent> {
    session.events.subscribe()
}

pub fn is_connected(session: &TuyaSession) -> bool {
    session.connected.load(Ordering::Relaxed)
}

/// Discovery learned the address after construction.
pub(crate) fn set_target(session: &TuyaSession, ip: String) {
    session.target.lock().unwrap().0 = Some(ip);
}

/// Discovery observed a different protocol version; re-seat the cipher.
pub(crate) fn set_version(session: &TuyaSession, version: Version) {
    session.cipher.lock().unwrap().set_version(version);
}

pub(crate) fn version(session: &TuyaSession) -> Version {
    session.cipher.lock().unwrap().version()
}

fn next_seqno(session: &TuyaSession) -> u32 {
    session.seqno.fetch_add(1, Ordering::Relaxed)
}

/// The v3.5 firmware expects the counter to advance once more before every
/// set; the extra tick is deliberate.
pub(crate) fn bump_seqno(session: &TuyaSession) {
    session.seqno.fetch_add(1, Ordering::Relaxed);
}

fn emit(session: &TuyaSession, event: DeviceEvent) {
    // A send only fails when nobody is subscribed, which is fine
    let _ = session.events.send(event);
}

// -- Connect / handshake --

/// Open the TCP connection and, for v3.4/v3.5, negotiate the session key.
/// Resolves immediately when already connected; concurrent callers
/// serialize on the session lock and observe the first caller's result.
pub async fn connect(session: &Arc<TuyaSession>) -> Result<(), ConnectionError> {
    if is_connected(session) {
        return Ok(());
    }
    let mut state = session.state.lock().await;
    if is_connected(session) {
        return Ok(());
    }

    let (ip, port) = session.target.lock().unwrap().clone();
    let ip = ip.ok_or(ConnectionError::NoAddress)?;
    let addr = format!("{ip}:{port}");

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, establish(session, &addr)).await {
        Err(_) => {
            emit(session, DeviceEvent::Error("connect timed out".to_owned()));
            return Err(ConnectionError::ConnectTimeout);
        }
        Ok(Err(e)) => {
            emit(session, DeviceEvent::Error(e.to_string()));
            return Err(e);
        }
        Ok(Ok(stream)) => stream,
    };

    let (read_half, write_half) = stream.into_split();
    state.writer = Some(write_half);
    state.reader_task = Some(spawn_reader(session.clone(), read_half));
    state.heartbeat_task = Some(spawn_heartbeat(session.clone()));
    session.connected.store(true, Ordering::Relaxed);
    drop(state);

    tracing::info!(addr = %addr, device_id = %session.device_id, "Connected to device");
    emit(session, DeviceEvent::Connected);
    Ok(())
}

async fn establish(
    session: &Arc<TuyaSession>,
    addr: &str,
) -> Result<TcpStream, ConnectionError> {
    let mut stream = TcpStream::connect(addr).await?;
    let version = version(session);
    if version.requires_handshake() {
        negotiate_session_key(session, &mut stream).await?;
    }
    Ok(stream)
}

/// The v3.4/v3.5 three-step nonce exchange. Both sides prove knowledge of
/// the local key via HMAC, then the session key is the XOR of the nonces,
/// re-encrypted under the local key.
async fn negotiate_session_key(
    session: &Arc<TuyaSession>,
    stream: &mut TcpStream,
) -> Result<(), ConnectionError> {
    session.cipher.lock().unwrap().clear_session_key();
    let version = version(session);
    let local_nonce = TuyaCipher::random_nonce();

    let start_seq = next_seqno(session);
    let start = {
        let cipher = session.cipher.lock().unwrap();
        protocol::build_frame(
            &cipher,
            start_seq,
            CommandType::SessKeyNegStart,
            &local_nonce,
            true,
        )?
    };
    stream.write_all(&start).await?;
    stream.flush().await?;

    // Skip anything the device still had queued; the response we want is
    // SESS_KEY_NEG_RES
    let mut response = None;
    for _ in 0..4 {
        let bytes = read_frame_bytes(stream, version).await?;
        let (raw, _) = {
            let cipher = session.cipher.lock().unwrap();
            protocol::split_frame(&cipher, &bytes)?
        };
        if raw.command == CommandType::SessKeyNegRes.as_u32() {
            response = Some(raw);
            break;
        }
    }
    let response = response.ok_or(ConnectionError::HandshakeIntegrity)?;

    let plaintext = {
        let guard = session.cipher.lock().unwrap();
        let decrypted = match version {
            Version::V34 => guard
                .ecb_decrypt_nopad(&response.payload)
                .map_err(ProtocolError::from)?,
            // v3.5 frames are decrypted during the split
            _ => response.payload.clone(),
        };
        cipher::strip_version_preamble(version, &decrypted).to_vec()
    };
    if plaintext.len() < 48 {
        return Err(ConnectionError::HandshakeIntegrity);
    }
    let mut remote_nonce = [0u8; 16];
    remote_nonce.copy_from_slice(&plaintext[..16]);

    let expected = session.cipher.lock().unwrap().hmac(&local_nonce);
    if plaintext[16..48] != expected {
        return Err(ConnectionError::HandshakeIntegrity);
    }

    // Re-sync the counter so the finish frame answers in step with the
    // device's numbering
    session.seqno.store(response.seqno, Ordering::Relaxed);
    let finish_seq = next_seqno(session);
    let finish = {
        let cipher = session.cipher.lock().unwrap();
        let proof = cipher.hmac(&remote_nonce);
        protocol::build_frame(
            &cipher,
            finish_seq,
            CommandType::SessKeyNegFinish,
            &proof,
            true,
        )?
    };
    stream.write_all(&finish).await?;
    stream.flush().await?;

    let mut xored = [0u8; 16];
    for (i, byte) in xored.iter_mut().enumerate() {
        *byte = local_nonce[i] ^ remote_nonce[i];
    }
    let session_key = {
        let cipher = session.cipher.lock().unwrap();
        let sealed = match version {
            Version::V34 => cipher.ecb_encrypt_nopad(&xored).map_err(ProtocolError::from)?,
            _ => cipher
                .gcm_encrypt(&xored, &local_nonce[..12], &[])
                .map_err(ProtocolError::from)?,
        };
        let mut key = [0u8; 16];
        key.copy_from_slice(&sealed[..16]);
        key
    };
    session.cipher.lock().unwrap().set_session_key(session_key);
    tracing::debug!(device_id = %session.device_id, "Session key negotiated");
    Ok(())
}

// -- Frame I/O --

/// Read one whole frame off the stream: fixed-size header first for the
/// length, then the remainder.
pub(crate) async fn read_frame_bytes<R: AsyncRead + Unpin>(
    stream: &mut R,
    version: Version,
) -> Result<Vec<u8>, ConnectionError> {
    let (header, remainder_len) = if version == Version::V35 {
        let mut header = [0u8; HEADER_SIZE_V35];
        stream.read_exact(&mut header).await?;
        let prefix = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if prefix != PREFIX_V35 {
            return Err(ProtocolError::PrefixMismatch(prefix).into());
        }
        let length =
            u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
        (header.to_vec(), length + SUFFIX_SIZE)
    } else {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let prefix = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if prefix != PREFIX {
            return Err(ProtocolError::PrefixMismatch(prefix).into());
        }
        let length =
            u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
        (header.to_vec(), length)
    };

    if remainder_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::TruncatedPayload.into());
    }
    let mut frame = header;
    let offset = frame.len();
    frame.resize(offset + remainder_len, 0);
    stream.read_exact(&mut frame[offset..]).await?;
    Ok(frame)
}

async fn write_frame(session: &TuyaSession, frame: &[u8]) -> Result<(), ConnectionError> {
    let mut state = session.state.lock().await;
    let writer = state.writer.as_mut().ok_or(ConnectionError::NotConnected)?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

// -- Inbound dispatch --

fn spawn_reader(session: Arc<TuyaSession>, mut read_half: OwnedReadHalf) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let version = version(&session);
            match read_frame_bytes(&mut read_half, version).await {
                Ok(bytes) => {
                    let parsed = {
                        let cipher = session.cipher.lock().unwrap();
                        protocol::parse_frames(&cipher, &bytes)
                    };
                    match parsed {
                        Ok(messages) => {
                            for message in messages {
                                dispatch(&session, message);
                            }
                        }
                        Err(e) => {
                            // Drop the chunk; the stream may resync on the
                            // next whole frame
                            tracing::warn!(device_id = %session.device_id, "Bad frame: {e}");
                            emit(&session, DeviceEvent::Error(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(device_id = %session.device_id, "Read loop ended: {e}");
                    let session = session.clone();
                    tokio::spawn(async move {
                        disconnect(&session).await;
                    });
                    break;
                }
            }
        }
    })
}

/// Route one inbound message: a STATUS resolves an in-flight set, a
/// sequence match resolves its pending request, anything else becomes an
/// event or is dropped.
fn dispatch(session: &TuyaSession, message: TuyaMessage) {
    let message = substitute_null_payload(session, message);
    match message.command {
        CommandType::HeartBeat => {
            *session.last_pong.lock().unwrap() = Some(Instant::now());
            emit(session, DeviceEvent::Heartbeat);
        }
        CommandType::Control | CommandType::ControlNew if message.payload.is_empty() => {
            // Bare acknowledgement of a set; the STATUS that follows
            // carries the real answer
        }
        CommandType::Status => {
            let lacks_dp1 = message
                .payload
                .as_json()
                .and_then(|v| v.get("dps"))
                .map(|dps| dps.get("1").is_none())
                .unwrap_or(false);
            if lacks_dp1 {
                emit(
                    session,
                    DeviceEvent::DpRefresh {
                        payload: message.payload,
                        command: message.command,
                        seqno: message.seqno,
                    },
                );
            } else {
                emit(
                    session,
                    DeviceEvent::Data {
                        payload: message.payload.clone(),
                        command: message.command,
                        seqno: message.seqno,
                    },
                );
                if let Some(waiter) = session.set_waiter.lock().unwrap().take() {
                    let _ = waiter.send(message.payload);
                }
            }
        }
        CommandType::DpQuery | CommandType::DpQueryNew | CommandType::DpRefresh => {
            resolve_pending(session, message);
        }
        _ => {
            resolve_pending(session, message);
        }
    }
}

fn resolve_pending(session: &TuyaSession, message: TuyaMessage) {
    let waiter = session.pending.lock().unwrap().remove(&message.seqno);
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => {
            tracing::trace!(seqno = message.seqno, command = ?message.command, "Unmatched reply dropped");
        }
    }
}

/// Quirky firmwares answer queries with "json obj data unvalid"; callers
/// can opt into an all-null DP map instead.
fn substitute_null_payload(session: &TuyaSession, mut message: TuyaMessage) -> TuyaMessage {
    if session.null_payload_on_json_error
        && message.payload.as_text() == Some("json obj data unvalid")
    {
        message.payload = Payload::Json(serde_json::json!({
            "dps": {"1": null, "2": null, "3": null, "101": null, "102": null, "103": null}
        }));
    }
    message
}

// -- Heartbeat --

fn spawn_heartbeat(session: Arc<TuyaSession>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = session.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_ping: Option<Instant> = None;
        loop {
            ticker.tick().await;

            let pong_outstanding = match (last_ping, *session.last_pong.lock().unwrap()) {
                (Some(ping), Some(pong)) => pong < ping,
                (Some(_), None) => true,
                (None, _) => false,
            };

            let dispatched_at = Instant::now();
            let frame = {
                let cipher = session.cipher.lock().unwrap();
                protocol::build_frame(&cipher, next_seqno(&session), CommandType::HeartBeat, b"", true)
            };
            match frame {
                Ok(frame) => {
                    if let Err(e) = write_frame(&session, &frame).await {
                        tracing::warn!(device_id = %session.device_id, "Heartbeat failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("Heartbeat encode failed: {e}"),
            }
            last_ping = Some(dispatched_at);

            if pong_outstanding {
                tokio::time::sleep(PONG_TIMEOUT).await;
                let answered = session
                    .last_pong
                    .lock()
                    .unwrap()
                    .is_some_and(|pong| pong >= dispatched_at);
                if !answered {
                    tracing::warn!(device_id = %session.device_id, "Device stopped answering heartbeats");
                    let session = session.clone();
                    tokio::spawn(async move {
                        disconnect(&session).await;
                    });
                    break;
                }
            }
        }
    })
}

// -- Sending --

fn is_transient(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::Tcp(_) | ConnectionError::NotConnected | ConnectionError::ConnectTimeout
    )
}

/// Send a frame and hand back the completion for its reply. Transient
/// socket failures tear the connection down and retry the whole
/// connect-handshake-write pipeline with exponential backoff.
async fn send_with_retry(
    session: &Arc<TuyaSession>,
    command: CommandType,
    payload: &[u8],
    encrypt: bool,
    want_reply: bool,
) -> Result<Option<(u32, oneshot::Receiver<TuyaMessage>)>, ConnectionError> {
    let mut attempt = 0;
    loop {
        match try_send(session, command, payload, encrypt, want_reply).await {
            Ok(reply) => return Ok(reply),
            Err(e) if attempt < SEND_RETRIES && is_transient(&e) => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(attempt, "Send failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                emit(session, DeviceEvent::Error(e.to_string()));
                return Err(e);
            }
        }
    }
}

async fn try_send(
    session: &Arc<TuyaSession>,
    command: CommandType,
    payload: &[u8],
    encrypt: bool,
    want_reply: bool,
) -> Result<Option<(u32, oneshot::Receiver<TuyaMessage>)>, ConnectionError> {
    connect(session).await?;

    let seqno = next_seqno(session);
    let frame = {
        let cipher = session.cipher.lock().unwrap();
        protocol::build_frame(&cipher, seqno, command, payload, encrypt)?
    };

    let reply = if want_reply {
        let (tx, rx) = oneshot::channel();
        session.pending.lock().unwrap().insert(seqno, tx);
        Some((seqno, rx))
    } else {
        None
    };

    if let Err(e) = write_frame(session, &frame).await {
        if let Some((seqno, _)) = &reply {
            session.pending.lock().unwrap().remove(seqno);
        }
        // A dead socket: tear down so the retry reconnects from scratch
        disconnect(session).await;
        return Err(e);
    }
    tracing::trace!(seqno, command = ?command, bytes = frame.len(), "Frame sent");
    Ok(reply)
}

/// Fire-and-forget send (heartbeats, handshake finish, unacknowledged set).
pub async fn send(
    session: &Arc<TuyaSession>,
    command: CommandType,
    payload: &[u8],
    encrypt: bool,
) -> Result<(), ConnectionError> {
    send_with_retry(session, command, payload, encrypt, false).await?;
    Ok(())
}

/// Send a request and wait for the reply matched by sequence number.
pub async fn request(
    session: &Arc<TuyaSession>,
    command: CommandType,
    payload: &[u8],
    encrypt: bool,
) -> Result<TuyaMessage, ConnectionError> {
    let (seqno, receiver) = send_with_retry(session, command, payload, encrypt, true)
        .await?
        .expect("send_with_retry returns a receiver when a reply is requested");

    let timeout = Duration::from_secs(session.response_timeout_secs);
    match tokio::time::timeout(timeout, receiver).await {
        Err(_) => {
            session.pending.lock().unwrap().remove(&seqno);
            Err(ConnectionError::GetTimeout)
        }
        Ok(Err(_)) => Err(ConnectionError::Disconnected),
        Ok(Ok(message)) => Ok(message),
    }
}

/// Send a set and wait for the STATUS that answers it. The wait window is
/// `response_timeout x 2500` ms, a quirk inherited from the original
/// tooling.
pub async fn send_set(
    session: &Arc<TuyaSession>,
    command: CommandType,
    payload: &[u8],
    wait_for_response: bool,
) -> Result<Option<Payload>, ConnectionError> {
    let receiver = if wait_for_response {
        let (tx, rx) = oneshot::channel();
        *session.set_waiter.lock().unwrap() = Some(tx);
        Some(rx)
    } else {
        None
    };

    if let Err(e) = send_with_retry(session, command, payload, true, false).await {
        *session.set_waiter.lock().unwrap() = None;
        return Err(e);
    }
    let Some(receiver) = receiver else {
        return Ok(None);
    };

    let timeout = Duration::from_millis(session.response_timeout_secs * 2500);
    match tokio::time::timeout(timeout, receiver).await {
        Err(_) => {
            *session.set_waiter.lock().unwrap() = None;
            emit(session, DeviceEvent::Error("set timed out".to_owned()));
            Err(ConnectionError::SetTimeout)
        }
        Ok(Err(_)) => Err(ConnectionError::Disconnected),
        Ok(Ok(payload)) => Ok(Some(payload)),
    }
}

// -- Disconnect --

/// Idempotent teardown: stop the tasks, close the socket, forget the
/// session key, and fail everything still waiting.
pub async fn disconnect(session: &Arc<TuyaSession>) {
    let mut state = session.state.lock().await;
    let was_connected = session.connected.swap(false, Ordering::Relaxed);
    if let Some(task) = state.reader_task.take() {
        task.abort();
    }
    if let Some(task) = state.heartbeat_task.take() {
        task.abort();
    }
    let writer = state.writer.take();
    drop(state);

    if let Some(mut writer) = writer {
        let _ = writer.shutdown().await;
    }
    session.cipher.lock().unwrap().clear_session_key();
    session.pending.lock().unwrap().clear();
    *session.set_waiter.lock().unwrap() = None;
    *session.last_pong.lock().unwrap() = None;

    if was_connected {
        tracing::info!(device_id = %session.device_id, "Disconnected");
        emit(session, DeviceEvent::Disconnected);
    }
}
