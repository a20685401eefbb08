use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::cipher::{TuyaCipher, UDP_KEY};
use crate::config::DeviceConfig;
use crate::protocol::{self, Version, PREFIX_V35};

/// Devices announce themselves in the clear on this port.
pub const PORT_PLAIN: u16 = 6666;
/// Newer firmwares announce on this port, encrypted with the broadcast key.
pub const PORT_ENCRYPTED: u16 = 6667;

const RECV_BUF_SIZE: usize = 2048;

/// One device record harvested from a presence broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub ip: String,
    pub product_key: Option<String>,
    pub version: Option<Version>,
    pub dps: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum DiscoveryError {
    Io(std::io::Error),
    FindTimeout,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Io(e) => write!(f, "Broadcast socket error: {e}"),
            DiscoveryError::FindTimeout => write!(f, "No matching broadcast before the timeout"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        DiscoveryError::Io(e)
    }
}

/// Wait for a broadcast matching the config's `id` or `ip` and return the
/// harvested record. Fails with `FindTimeout` after `config.find_timeout`.
pub async fn find(config: &DeviceConfig) -> Result<DiscoveredDevice, DiscoveryError> {
    find_with_timeout(config, config.find_timeout).await
}

pub async fn find_with_timeout(
    config: &DeviceConfig,
    timeout: Duration,
) -> Result<DiscoveredDevice, DiscoveryError> {
    let plain = bind_broadcast_listener(PORT_PLAIN).await?;
    let encrypted = bind_broadcast_listener(PORT_ENCRYPTED).await?;
    let deadline = Instant::now() + timeout;

    let mut plain_buf = [0u8; RECV_BUF_SIZE];
    let mut enc_buf = [0u8; RECV_BUF_SIZE];
    loop {
        let datagram = tokio::select! {
            received = plain.recv_from(&mut plain_buf) => {
                let (len, _) = received?;
                plain_buf[..len].to_vec()
            }
            received = encrypted.recv_from(&mut enc_buf) => {
                let (len, _) = received?;
                enc_buf[..len].to_vec()
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(DiscoveryError::FindTimeout);
            }
        };

        let Some(device) = decode_broadcast(&datagram, Some(&config.local_key)) else {
            continue;
        };
        tracing::debug!(id = %device.id, ip = %device.ip, "Broadcast received");
        if matches_config(config, &device) {
            return Ok(device);
        }
    }
}

/// Accumulate every `(id, ip)` pair seen until the timeout expires. Never
/// returns early; an empty LAN yields an empty list.
pub async fn find_all(timeout: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let plain = bind_broadcast_listener(PORT_PLAIN).await?;
    let encrypted = bind_broadcast_listener(PORT_ENCRYPTED).await?;
    let deadline = Instant::now() + timeout;

    let mut seen = HashSet::new();
    let mut devices = Vec::new();
    let mut plain_buf = [0u8; RECV_BUF_SIZE];
    let mut enc_buf = [0u8; RECV_BUF_SIZE];
    loop {
        let datagram = tokio::select! {
            received = plain.recv_from(&mut plain_buf) => {
                let (len, _) = received?;
                plain_buf[..len].to_vec()
            }
            received = encrypted.recv_from(&mut enc_buf) => {
                let (len, _) = received?;
                enc_buf[..len].to_vec()
            }
            _ = tokio::time::sleep_until(deadline) => break,
        };

        if let Some(device) = decode_broadcast(&datagram, None) {
            if seen.insert((device.id.clone(), device.ip.clone())) {
                tracing::info!(id = %device.id, ip = %device.ip, "Device discovered");
                devices.push(device);
            }
        }
    }
    Ok(devices)
}

fn matches_config(config: &DeviceConfig, device: &DiscoveredDevice) -> bool {
    config.id.as_deref() == Some(device.id.as_str())
        || config.ip.as_deref() == Some(device.ip.as_str())
}

/// Decode one datagram. Tries the well-known broadcast key first, then the
/// device's own key; some firmwares broadcast under the latter.
fn decode_broadcast(datagram: &[u8], local_key: Option<&[u8; 16]>) -> Option<DiscoveredDevice> {
    let version = if datagram.len() >= 4
        && u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) == PREFIX_V35
    {
        Version::V35
    } else {
        Version::V33
    };

    let udp_cipher = TuyaCipher::new(UDP_KEY, version);
    extract_record(&udp_cipher, datagram).or_else(|| {
        let key = local_key?;
        let device_cipher = TuyaCipher::new(*key, version);
        extract_record(&device_cipher, datagram)
    })
}

fn extract_record(cipher: &TuyaCipher, datagram: &[u8]) -> Option<DiscoveredDevice> {
    let messages = protocol::parse_frames(cipher, datagram).ok()?;
    for message in messages {
        let Some(payload) = message.payload.as_json() else {
            continue;
        };
        let id = payload.get("gwId").and_then(|v| v.as_str())?;
        let ip = payload.get("ip").and_then(|v| v.as_str())?;
        return Some(DiscoveredDevice {
            id: id.to_owned(),
            ip: ip.to_owned(),
            product_key: payload
                .get("productKey")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            version: payload
                .get("version")
                .and_then(|v| v.as_str())
                .and_then(Version::parse),
            dps: payload.get("dps").cloned(),
        });
    }
    None
}

/// The DP indices a refresh should poke, tuned from the broadcast's `dps`
/// map. Firmwares without DP 19 use the low index block.
pub(crate) fn refresh_dp_ids(dps: &serde_json::Value) -> Vec<u32> {
    if dps.get("19").is_some() {
        vec![18, 19, 20]
    } else {
        vec![4, 5, 6]
    }
}

/// Both listeners bind with address reuse so they can coexist with other
/// local controllers watching the same broadcast ports.
async fn bind_broadcast_listener(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
