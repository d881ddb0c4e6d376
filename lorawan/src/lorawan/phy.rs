use super::region::{Band, DataRate};
use crate::error::Error;
use crate::radio::traits::{PacketParams, Radio};

/// Overhead of a data frame without FOpts or port: MHDR, FHDR, FPort and MIC
pub const FRAME_OVERHEAD: usize = 13;

/// LoRa preamble used for airtime estimates
const PREAMBLE_SYMBOLS: u32 = 8;

/// FSK framing: preamble, sync word, length byte and CRC
const FSK_PREAMBLE_BYTES: u32 = 5;
const FSK_SYNC_BYTES: u32 = 3;
const FSK_LEN_BYTES: u32 = 1;
const FSK_CRC_BYTES: u32 = 2;

/// Time on air of a `len` byte frame in ms, rounded up
///
/// LoRa uses the Semtech formula with explicit header and CRC, enabling low
/// data rate optimization when a symbol lasts longer than 16 ms. LR-FHSS
/// airtime is not modelled.
pub fn time_on_air_ms(data_rate: &DataRate, len: usize) -> Option<u32> {
    match *data_rate {
        DataRate::Lora {
            spreading_factor,
            bandwidth_khz,
            coding_rate,
        } => {
            let sf = spreading_factor as i64;
            let t_sym_us = (1u64 << spreading_factor) * 1000 / bandwidth_khz as u64;
            let de: i64 = if t_sym_us > 16_000 { 1 } else { 0 };

            let num = 8 * len as i64 - 4 * sf + 28 + 16;
            let den = 4 * (sf - 2 * de);
            let blocks = if num > 0 { (num + den - 1) / den } else { 0 };
            let payload_symbols = 8 + (blocks * coding_rate as i64) as u64;

            // preamble + 4.25 symbols, in quarter symbols
            let quarters = (PREAMBLE_SYMBOLS as u64 * 4 + 17) + payload_symbols * 4;
            let us = quarters * t_sym_us / 4;
            Some(((us + 999) / 1000) as u32)
        }
        DataRate::Fsk { bit_rate_kbps, .. } => {
            let bytes = FSK_PREAMBLE_BYTES + FSK_SYNC_BYTES + FSK_LEN_BYTES + len as u32 + FSK_CRC_BYTES;
            let bits = bytes * 8;
            let kbps = bit_rate_kbps as u32;
            Some((bits + kbps - 1) / kbps)
        }
        DataRate::LrFhss { .. } | DataRate::None => None,
    }
}

/// Largest application payload at `dr` that fits both the band table and the
/// dwell limit. `fopts_len` bytes of piggybacked MAC commands are deducted.
pub fn max_payload_len(band: &Band, dr: u8, dwell_ms: u32, fopts_len: usize) -> usize {
    let table = band.max_payload(dr).saturating_sub(fopts_len);
    if dwell_ms == 0 {
        return table;
    }
    let rate = match band.data_rate(dr) {
        Some(rate) => rate,
        None => return 0,
    };
    let mut len = table;
    loop {
        match time_on_air_ms(rate, len + fopts_len + FRAME_OVERHEAD) {
            Some(toa) if toa <= dwell_ms => return len,
            Some(_) if len > 0 => len -= 1,
            _ => return 0,
        }
    }
}

/// PHY layer
///
/// Owns the radio and translates band parameters into driver calls.
pub struct PhyLayer<R: Radio> {
    /// Radio driver
    pub radio: R,
}

impl<R: Radio> PhyLayer<R> {
    /// Create new PHY layer
    pub fn new(radio: R) -> Self {
        Self { radio }
    }

    /// Configure radio for an uplink
    pub fn configure_tx(
        &mut self,
        band: &Band,
        frequency: u32,
        dr: u8,
        power_dbm: i8,
    ) -> Result<(), Error<R::Error>> {
        let rate = band.data_rate(dr).ok_or(Error::InvalidDataRate(dr))?;
        if !band.frequency_valid(frequency) {
            return Err(Error::InvalidFrequency);
        }
        self.radio.set_frequency(frequency).map_err(Error::Radio)?;
        self.radio.set_data_rate(rate).map_err(Error::Radio)?;
        let power = self.radio.clip_output_power(power_dbm);
        self.radio.set_output_power(power).map_err(Error::Radio)?;
        self.radio
            .set_packet_params(&PacketParams::UPLINK)
            .map_err(Error::Radio)?;
        Ok(())
    }

    /// Configure radio for a downlink window
    pub fn configure_rx(&mut self, band: &Band, frequency: u32, dr: u8) -> Result<(), Error<R::Error>> {
        let rate = band.data_rate(dr).ok_or(Error::InvalidDataRate(dr))?;
        self.radio.set_frequency(frequency).map_err(Error::Radio)?;
        self.radio.set_data_rate(rate).map_err(Error::Radio)?;
        self.radio
            .set_packet_params(&PacketParams::DOWNLINK)
            .map_err(Error::Radio)?;
        Ok(())
    }

    /// Uniform random number in `0..n` from the radio entropy source
    pub fn random_below(&mut self, n: u32) -> Result<u32, Error<R::Error>> {
        if n <= 1 {
            return Ok(0);
        }
        let mut bytes = [0u8; 4];
        for byte in bytes.iter_mut() {
            *byte = self.radio.random_byte().map_err(Error::Radio)?;
        }
        Ok(u32::from_le_bytes(bytes) % n)
    }

    /// Uniform random number in `min..=max`
    pub fn random_range(&mut self, min: u32, max: u32) -> Result<u32, Error<R::Error>> {
        if max <= min {
            return Ok(min);
        }
        Ok(min + self.random_below(max - min + 1)?)
    }
}
