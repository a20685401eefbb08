//! Local-network client for devices speaking the Tuya LAN protocol,
//! versions 3.1 through 3.5: binary framing, per-version encryption,
//! UDP discovery, and the TCP session state machine behind a small
//! async device API.
//!
//! ```no_run
//! use tuya_lan::{Device, DeviceConfig, GetOptions, Version};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::new("4226aa407d5c1e2b")?
//!     .with_id("22325186db4a2217dc8e")
//!     .with_version(Version::V33);
//! let device = Device::new(config)?;
//! device.find().await?;
//! device.connect().await?;
//! let power = device.get(GetOptions::default()).await?;
//! println!("DP 1 = {power}");
//! device.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod protocol;

pub use cipher::TuyaCipher;
pub use config::{ConfigError, DeviceConfig};
pub use connection::{ConnectionError, DeviceEvent};
pub use device::{Device, DeviceError, GetOptions, SetOptions};
pub use discovery::{find_all, DiscoveredDevice, DiscoveryError};
pub use protocol::{CommandType, Payload, TuyaMessage, Version};
