use embedded_hal::blocking::delay::DelayMs;

use crate::lorawan::region::DataRate;

/// LoRa sync word for public LoRaWAN networks
pub const LORAWAN_SYNC_WORD: u8 = 0x34;

/// Preamble length of LoRa frames in symbols
pub const LORAWAN_PREAMBLE_LEN: u16 = 8;

/// Framing parameters applied on top of the modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketParams {
    /// Preamble length in symbols
    pub preamble_len: u16,
    /// Sync word
    pub sync_word: u8,
    /// Inverted IQ (downlinks)
    pub invert_iq: bool,
    /// Payload CRC present
    pub crc: bool,
}

impl PacketParams {
    /// Framing of uplink frames
    pub const UPLINK: PacketParams = PacketParams {
        preamble_len: LORAWAN_PREAMBLE_LEN,
        sync_word: LORAWAN_SYNC_WORD,
        invert_iq: false,
        crc: true,
    };

    /// Framing of downlink frames
    pub const DOWNLINK: PacketParams = PacketParams {
        preamble_len: LORAWAN_PREAMBLE_LEN,
        sync_word: LORAWAN_SYNC_WORD,
        invert_iq: true,
        crc: false,
    };
}

/// Completion events reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioEvent {
    /// Transmission finished
    TxDone,
    /// A packet was received; read it with [`Radio::read_packet`]
    RxDone,
    /// Reception timed out without a preamble
    RxTimeout,
    /// Channel activity detection finished
    CadDone {
        /// Activity was detected
        busy: bool,
    },
}

/// Hardware limits consulted while validating network requests
pub trait Capabilities {
    /// Output power the hardware actually produces when asked for `dbm`
    fn clip_output_power(&self, dbm: i8) -> i8;

    /// Whether the front end can tune to `hz`
    fn supports_frequency(&self, hz: u32) -> bool;
}

/// Radio driver interface
///
/// Operations start asynchronously on the chip; completion is observed by
/// polling [`Radio::poll_event`], which returns `WouldBlock` while the
/// operation is still running.
pub trait Radio: Capabilities {
    /// Error type for radio operations
    type Error: core::fmt::Debug;

    /// Set the carrier frequency in Hz
    fn set_frequency(&mut self, hz: u32) -> Result<(), Self::Error>;

    /// Configure the modulation of a data rate
    fn set_data_rate(&mut self, data_rate: &DataRate) -> Result<(), Self::Error>;

    /// Set the output power in dBm
    fn set_output_power(&mut self, dbm: i8) -> Result<(), Self::Error>;

    /// Configure preamble, sync word, IQ polarity and CRC
    fn set_packet_params(&mut self, params: &PacketParams) -> Result<(), Self::Error>;

    /// Start transmitting `data`
    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Start receiving; `None` keeps listening until stopped
    fn start_receive(&mut self, timeout_ms: Option<u32>) -> Result<(), Self::Error>;

    /// Start a channel activity detection
    fn start_channel_activity_detection(&mut self) -> Result<(), Self::Error>;

    /// Poll for the completion of the running operation
    fn poll_event(&mut self) -> nb::Result<RadioEvent, Self::Error>;

    /// Copy the last received packet into `buffer`, returning its length
    fn read_packet(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Random byte from the radio's entropy source
    fn random_byte(&mut self) -> Result<u8, Self::Error>;

    /// SNR of the last received packet in dB
    fn last_snr(&mut self) -> i8;

    /// RSSI of the last received packet in dBm
    fn last_rssi(&mut self) -> i16;

    /// Put the radio into standby mode
    fn standby(&mut self) -> Result<(), Self::Error>;

    /// Put the radio into sleep mode
    fn sleep(&mut self) -> Result<(), Self::Error>;
}

/// Monotonic millisecond clock with a blocking delay
pub trait Clock: DelayMs<u32> {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&mut self) -> u64;
}
