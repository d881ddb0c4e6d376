//! Error taxonomy
//!
//! Every fallible operation of the crate returns [`Error`], generic over the
//! radio driver's own error type. Variants are grouped by how a caller is
//! expected to react:
//! - configuration errors are detected before any radio or wire action
//! - integrity errors are fatal to the single frame or buffer involved
//! - capacity errors are rejected before a frame is composed
//! - transient errors may succeed on a later attempt

use thiserror::Error;

/// LoRaWAN node error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Radio driver error
    #[error("radio driver error")]
    Radio(E),

    /// Port is reserved or out of range
    #[error("invalid application port {0}")]
    InvalidPort(u8),
    /// Data rate is not defined by the band or not usable on any enabled channel
    #[error("invalid data rate {0}")]
    InvalidDataRate(u8),
    /// Frequency is outside the band
    #[error("invalid frequency")]
    InvalidFrequency,
    /// Output power cannot be represented by the band's power steps
    #[error("invalid output power {0} dBm")]
    InvalidTxPower(i8),
    /// Device class not supported
    #[error("unsupported device class")]
    InvalidClass,
    /// MAC command may not be requested by the application
    #[error("MAC command 0x{0:02x} cannot be requested")]
    InvalidMacCommand(u8),
    /// No credentials were configured
    #[error("no credentials configured")]
    NoSession,
    /// Operation requires an active session
    #[error("session is not active")]
    NotActivated,
    /// Feature not available in this configuration
    #[error("operation not supported")]
    Unsupported,

    /// Message integrity code mismatch
    #[error("MIC mismatch")]
    InvalidMic,
    /// Frame is malformed or not addressed to this device
    #[error("malformed frame")]
    MalformedFrame,
    /// Downlink frame counter was already seen
    #[error("frame counter replay")]
    FCntReplay,
    /// Multicast frame counter outside the configured range
    #[error("multicast frame counter out of range")]
    FCntOutOfRange,
    /// Join accept reused an old JoinNonce
    #[error("join nonce replay")]
    JoinNonceReplay,
    /// Network negotiated a LoRaWAN revision the device cannot run
    #[error("LoRaWAN version mismatch")]
    VersionMismatch,
    /// Persistence buffer signature does not match its content
    #[error("buffer checksum mismatch")]
    ChecksumMismatch,
    /// Persistence buffer was written for different keys, mode or band
    #[error("buffer does not match the configured device")]
    ConfigurationMismatch,
    /// Session buffer does not belong to the restored nonces
    #[error("session buffer does not match nonces")]
    SessionMismatch,
    /// DevNonce space exhausted; the device must be re-provisioned
    #[error("DevNonce exhausted")]
    NonceExhausted,

    /// MAC command queue has no room left
    #[error("MAC command queue full")]
    QueueFull,
    /// Payload exceeds the maximum for the current data rate
    #[error("payload too long, maximum is {0} bytes")]
    PayloadTooLong(usize),
    /// Frame exceeds the uplink dwell time
    #[error("uplink dwell time exceeded")]
    DwellTimeExceeded,

    /// Duty-cycle budget not yet replenished
    #[error("duty cycle limited, retry in {wait_ms} ms")]
    DutyCycleLimited {
        /// Time until the next uplink is allowed
        wait_ms: u32,
    },
    /// No enabled channel supports the current data rate
    #[error("no channel available")]
    NoChannelAvailable,
    /// CSMA found every candidate channel busy
    #[error("channel busy")]
    ChannelBusy,
    /// Radio did not report transmission completion in time
    #[error("transmit timeout")]
    TxTimeout,
    /// Join exchange finished without a join accept
    #[error("no join accept received")]
    NoJoinAccept,
}

impl<E> Error<E> {
    /// Integrity errors are fatal to a single frame or buffer and never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::InvalidMic
                | Error::MalformedFrame
                | Error::FCntReplay
                | Error::FCntOutOfRange
                | Error::JoinNonceReplay
                | Error::VersionMismatch
                | Error::ChecksumMismatch
                | Error::ConfigurationMismatch
                | Error::SessionMismatch
        )
    }

    /// Transient errors may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DutyCycleLimited { .. }
                | Error::NoChannelAvailable
                | Error::ChannelBusy
                | Error::TxTimeout
                | Error::NoJoinAccept
        )
    }
}
