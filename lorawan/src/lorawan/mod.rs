//! LoRaWAN protocol implementation
//!
//! This module contains the core protocol, including:
//! - regional parameters and the channel plan
//! - PHY airtime and radio configuration
//! - frame composition and validation
//! - MAC command handling
//! - session persistence

/// Channel plan
pub mod channels;

/// Little-endian field helpers and header codecs
pub mod codec;

/// MAC command handling
pub mod commands;

/// Frame processor
pub mod mac;

/// PHY layer operations
pub mod phy;

/// Regional parameters
pub mod region;

/// Session and persistence buffers
pub mod session;

pub use channels::ChannelPlan;
pub use commands::{DeviceTime, LinkCheck};
pub use mac::{Downlink, MacLayer, MulticastSession};
pub use phy::PhyLayer;
pub use region::{Band, Channel, DataRate};
pub use session::{Credentials, Session, SessionStatus, NONCES_BUF_LEN, SESSION_BUF_LEN};
