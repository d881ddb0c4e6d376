//! LoRaWAN end-device MAC in Rust
//!
//! This crate implements the device side of the LoRaWAN protocol on top of a
//! radio driver supplied by the application. It covers session management,
//! the regional channel model, frame encryption and integrity, the MAC command
//! sub-protocol and the receive-window timing.
//!
//! # Features
//! - LoRaWAN 1.0.x and 1.1 sessions
//! - OTAA join and ABP activation
//! - Dynamic (EU868-style) and fixed (US915-style) channel plans
//! - Adaptive data rate with backoff
//! - Duty-cycle and CSMA transmission gating
//! - Class A and Class C receive windows, Class C multicast
//! - Signed persistence buffers for nonces and session state
//! - `no_std`, no heap allocation
//!
//! # Example
//! ```no_run
//! # fn demo<R, C>(radio: R, clock: C) -> Result<(), lorawan::Error<R::Error>>
//! # where R: lorawan::radio::Radio, C: lorawan::radio::Clock {
//! use lorawan::{
//!     config::{
//!         device::{AESKey, EUI64, OtaaCredentials},
//!         NodeSettings,
//!     },
//!     device::LoRaWANNode,
//!     lorawan::region::EU868,
//! };
//!
//! let mut node = LoRaWANNode::new(radio, clock, &EU868, 0, NodeSettings::default());
//!
//! node.begin_otaa(OtaaCredentials::new(
//!     EUI64::new(0x0000_0000_0000_0000),
//!     EUI64::new(0x70B3_D57E_D005_E5A1),
//!     Some(AESKey::new([0x2B; 16])),
//!     AESKey::new([0x7E; 16]),
//! ))?;
//!
//! // Join network
//! node.join()?;
//!
//! // Send data, listening in Rx1 and Rx2 afterwards
//! let outcome = node.send(b"Hello, LoRaWAN!", 1, false)?;
//! if let Some(downlink) = outcome.downlink {
//!     let _ = downlink.payload;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

/// Receive-window scheduling (Class A windows, Class C continuous reception)
pub mod class;

/// Device identity, credentials and node settings
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// High-level node interface
pub mod device;

/// Error types
pub mod error;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Radio hardware abstraction layer
pub mod radio;

pub use device::LoRaWANNode;
pub use error::Error;
