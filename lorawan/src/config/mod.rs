//! Device and node configuration
//!
//! This module contains the types used to provision and tune a node:
//! - Identity and key material (EUIs, DevAddr, AES keys)
//! - OTAA and ABP credentials
//! - Host-tunable node settings

/// Device identity and credentials
pub mod device;

pub use device::{AbpCredentials, DeviceClass, OtaaCredentials, Revision};

/// CSMA parameters (LoRa Alliance TR-013)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsmaConfig {
    /// Probe the channel before every transmission
    pub enabled: bool,
    /// Upper bound of the random backoff slot count; 0 disables backoff
    pub backoff_max: u8,
    /// Clear-channel slots that must pass before the backoff phase
    pub difs_slots: u8,
    /// Channel changes allowed before giving up with `ChannelBusy`
    pub max_channel_changes: u8,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backoff_max: 6,
            difs_slots: 2,
            max_channel_changes: 16,
        }
    }
}

/// Node settings that are not negotiated with the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeSettings {
    /// Adaptive data rate requested in every uplink
    pub adr_enabled: bool,
    /// Enforce the duty-cycle budget before transmitting
    pub duty_cycle_enabled: bool,
    /// Duty-cycle budget override in ms of airtime per hour; `None` uses the band default
    pub duty_cycle_ms_per_hour: Option<u32>,
    /// Carrier sensing before transmission
    pub csma: CsmaConfig,
    /// Margin added to every receive window
    pub rx_guard_ms: u32,
    /// Lower bound of the random delay before repeating an unacknowledged confirmed uplink
    pub retransmit_delay_min_ms: u32,
    /// Upper bound of that delay
    pub retransmit_delay_max_ms: u32,
    /// Accept port 224 (compliance testing) from the application
    pub allow_test_port: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            adr_enabled: true,
            duty_cycle_enabled: true,
            duty_cycle_ms_per_hour: None,
            csma: CsmaConfig::default(),
            rx_guard_ms: 10,
            retransmit_delay_min_ms: 1000,
            retransmit_delay_max_ms: 3000,
            allow_test_port: false,
        }
    }
}
