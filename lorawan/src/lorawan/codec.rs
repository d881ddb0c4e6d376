//! Frame field codec
//!
//! Explicit little-endian encoders per field width, plus the MHDR and
//! FCtrl bit layouts. Callers are responsible for bounds: every helper indexes
//! the slice directly at a fixed offset.

/// Read a little-endian `u16` at `pos`
pub fn get_u16_le(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

/// Write a little-endian `u16` at `pos`
pub fn put_u16_le(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian 24-bit value at `pos`
pub fn get_u24_le(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], 0])
}

/// Write the low 24 bits of `value` little-endian at `pos`
pub fn put_u24_le(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 3].copy_from_slice(&value.to_le_bytes()[..3]);
}

/// Read a little-endian `u32` at `pos`
pub fn get_u32_le(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Write a little-endian `u32` at `pos`
pub fn put_u32_le(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian `u128` from `len` bytes at `pos`
pub fn get_uint_le(buf: &[u8], pos: usize, len: usize) -> u128 {
    buf[pos..pos + len]
        .iter()
        .rev()
        .fold(0u128, |acc, b| (acc << 8) | *b as u128)
}

/// Write the low `len` bytes of `value` little-endian at `pos`
pub fn put_uint_le(buf: &mut [u8], pos: usize, len: usize, value: u128) {
    for (i, byte) in buf[pos..pos + len].iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
}

/// MAC header message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MType {
    /// Join request
    JoinRequest = 0x00,
    /// Join accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin request
    RejoinRequest = 0xC0,
    /// Proprietary frame
    Proprietary = 0xE0,
}

impl MType {
    /// Decode the message type from an MHDR byte
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// MHDR byte for LoRaWAN R1 major version
    pub fn mhdr(self) -> u8 {
        self as u8 | MAJOR_R1
    }
}

/// Major version bits of MHDR (LoRaWAN R1)
pub const MAJOR_R1: u8 = 0x00;

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FCtrl {
    /// Adaptive data rate enabled
    pub adr: bool,
    /// Uplink only: request a downlink to confirm connectivity
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// Downlink only: the network has more data pending
    pub f_pending: bool,
    /// Length of FOpts
    pub f_opts_len: u8,
}

impl FCtrl {
    /// Pack into the wire byte
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    /// Unpack from the wire byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}
