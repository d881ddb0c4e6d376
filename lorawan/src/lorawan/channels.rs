//! Channel plan engine
//!
//! Tracks which channels are defined, masked and still available in the
//! current selection round, and derives the downlink parameters that belong to
//! an uplink. Channel indices map onto bits of a `u128`:
//! - dynamic bands: bit `i` is entry `i` of the channel table (up to 16)
//! - fixed bands: bit `i` is the `i`-th channel across all uplink spans
//!
//! The mask says whether a channel may be used at all. Availability is the
//! subset of the mask not yet tried since the last time the round was reset,
//! so consecutive uplinks hop without repeating until every channel was used.

use super::codec::{get_u24_le, get_uint_le};
use super::region::{Band, BandType, Channel, DWELL_DOWNLINK_DR_MIN};
use crate::error::Error;

/// Size of the channel table of a dynamic band
pub const NUM_DYNAMIC_CHANNELS: usize = 16;

/// Channels per 125 kHz bank of a fixed band
pub const BANK_SIZE: u8 = 8;

/// Frequency unit used by CFList and MAC commands
pub const FREQ_UNIT_HZ: u32 = 100;

/// Length of the optional CFList in a join accept
pub const CFLIST_LEN: usize = 16;

const CFLIST_TYPE_FREQUENCIES: u8 = 0;
const CFLIST_TYPE_CH_MASK: u8 = 1;

/// First channel index a CFList of frequencies fills
const CFLIST_FIRST_CHANNEL: usize = 3;

/// Iterator over the set bit positions of a mask
fn bits(mask: u128) -> impl Iterator<Item = u8> {
    (0..128u8).filter(move |i| mask & (1u128 << i) != 0)
}

/// Mask with the lowest `n` bits set
fn low_bits(n: u32) -> u128 {
    if n >= 128 {
        u128::MAX
    } else {
        (1u128 << n) - 1
    }
}

/// Channel plan state for one band
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    band: &'static Band,
    sub_band: u8,
    uplink: [Channel; NUM_DYNAMIC_CHANNELS],
    downlink: [Channel; NUM_DYNAMIC_CHANNELS],
    mask: u128,
    available: u128,
    /// Uplink data rate
    pub data_rate_up: u8,
    /// Rx1 data rate offset
    pub rx1_dr_offset: u8,
    /// Rx2 channel and data rate
    pub rx2: Channel,
    /// Uplink dwell time limit in ms, 0 when unlimited
    pub dwell_time_up_ms: u32,
    /// Downlink dwell time limit in ms, 0 when unlimited
    pub dwell_time_dn_ms: u32,
}

impl ChannelPlan {
    /// Create the default plan of `band`
    ///
    /// `sub_band` restricts a fixed band to one 8-channel bank (1-based) plus
    /// its 500 kHz companion; 0 enables all channels. Ignored on dynamic bands.
    pub fn new(band: &'static Band, sub_band: u8) -> Self {
        let sub_band = if band.is_fixed() && sub_band > Self::num_125khz_banks(band) {
            warn!("sub-band {} out of range, using all channels", sub_band);
            0
        } else {
            sub_band
        };

        let mut plan = Self {
            band,
            sub_band,
            uplink: [Channel::NONE; NUM_DYNAMIC_CHANNELS],
            downlink: [Channel::NONE; NUM_DYNAMIC_CHANNELS],
            mask: 0,
            available: 0,
            data_rate_up: band.join_data_rate(),
            rx1_dr_offset: 0,
            rx2: band.rx2,
            dwell_time_up_ms: band.dwell_time_up_ms,
            dwell_time_dn_ms: band.dwell_time_dn_ms,
        };

        if band.band_type == BandType::Dynamic {
            for ch in band.default_channels.iter().filter(|c| c.enabled) {
                plan.uplink[ch.idx as usize] = *ch;
                plan.downlink[ch.idx as usize] = *ch;
            }
        }
        plan.mask = plan.default_mask();
        plan.recalculate_available();
        plan
    }

    fn num_125khz_banks(band: &Band) -> u8 {
        band.tx_spans[0].num_channels / BANK_SIZE
    }

    /// Band descriptor
    pub fn band(&self) -> &'static Band {
        self.band
    }

    /// Selected sub-band, 0 when unrestricted
    pub fn sub_band(&self) -> u8 {
        self.sub_band
    }

    fn default_mask(&self) -> u128 {
        match self.band.band_type {
            BandType::Dynamic => self
                .band
                .default_channels
                .iter()
                .filter(|c| c.enabled)
                .fold(0, |m, c| m | (1u128 << c.idx)),
            BandType::Fixed if self.sub_band == 0 => self.defined_mask(),
            BandType::Fixed => {
                let bank = (self.sub_band - 1) as u32;
                let narrow = 0xFFu128 << (bank * BANK_SIZE as u32);
                let wide_base = self.band.tx_spans[0].num_channels as u32;
                let wide = if self.band.num_tx_spans > 1 {
                    1u128 << (wide_base + bank)
                } else {
                    0
                };
                narrow | wide
            }
        }
    }

    /// Channels that exist in the plan
    pub fn defined_mask(&self) -> u128 {
        match self.band.band_type {
            BandType::Dynamic => self
                .uplink
                .iter()
                .enumerate()
                .filter(|(_, c)| c.frequency != 0)
                .fold(0, |m, (i, _)| m | (1u128 << i)),
            BandType::Fixed => low_bits(self.band.num_channels() as u32),
        }
    }

    /// Channels that may be used
    pub fn mask(&self) -> u128 {
        self.mask
    }

    /// Whether `mask` is a legal channel mask for this plan
    pub fn mask_valid(&self, mask: u128) -> bool {
        mask != 0 && mask & !self.defined_mask() == 0
    }

    /// Replace the channel mask
    pub fn set_mask(&mut self, mask: u128) -> bool {
        if !self.mask_valid(mask) {
            return false;
        }
        self.mask = mask;
        self.recalculate_available();
        true
    }

    /// Whether `idx` is defined and enabled
    pub fn is_enabled(&self, idx: u8) -> bool {
        idx < 128 && self.mask & (1u128 << idx) != 0
    }

    /// Uplink channel `idx` with its current enabled state
    pub fn channel(&self, idx: u8) -> Option<Channel> {
        let mut ch = match self.band.band_type {
            BandType::Dynamic => {
                let ch = *self.uplink.get(idx as usize)?;
                if ch.frequency == 0 {
                    return None;
                }
                ch
            }
            BandType::Fixed => self.band.fixed_channel(idx)?,
        };
        ch.enabled = self.is_enabled(idx);
        ch.dr = self.data_rate_up;
        Some(ch)
    }

    /// Uplink channel table of a dynamic band
    pub fn uplink_channels(&self) -> &[Channel; NUM_DYNAMIC_CHANNELS] {
        &self.uplink
    }

    /// Downlink channel table of a dynamic band
    pub fn downlink_channels(&self) -> &[Channel; NUM_DYNAMIC_CHANNELS] {
        &self.downlink
    }

    /// Whether any channel in `mask` allows data rate `dr`
    pub fn dr_supported(&self, mask: u128, dr: u8) -> bool {
        if self.band.data_rate(dr).is_none() {
            return false;
        }
        bits(mask).any(|i| self.channel(i).map(|c| c.supports(dr)).unwrap_or(false))
    }

    /// Change the uplink data rate
    pub fn set_data_rate(&mut self, dr: u8) -> bool {
        if !self.dr_supported(self.mask, dr) {
            return false;
        }
        self.data_rate_up = dr;
        self.recalculate_available();
        true
    }

    /// Re-enable the band's default channels
    pub fn enable_default_channels(&mut self) {
        match self.band.band_type {
            BandType::Dynamic => self.mask |= self.default_mask(),
            BandType::Fixed => self.mask = self.default_mask(),
        }
        self.recalculate_available();
    }

    /// Start a new selection round over all enabled channels usable at the
    /// current data rate
    pub fn recalculate_available(&mut self) {
        let dr = self.data_rate_up;
        self.available = bits(self.mask)
            .filter(|&i| self.channel(i).map(|c| c.supports(dr)).unwrap_or(false))
            .fold(0, |m, i| m | (1u128 << i));
    }

    /// Channels left in the current selection round
    pub fn available(&self) -> u128 {
        self.available
    }

    /// Pick the next uplink channel
    ///
    /// Uniform reservoir sampling over the availability bitmap; the chosen
    /// channel leaves the round. `random_below(n)` must return a value in `0..n`.
    pub fn select_uplink<F, E>(&mut self, mut random_below: F) -> Result<Channel, Error<E>>
    where
        F: FnMut(u32) -> Result<u32, Error<E>>,
    {
        if self.available == 0 {
            self.recalculate_available();
        }
        if self.available == 0 {
            return Err(Error::NoChannelAvailable);
        }

        let mut seen = 0u32;
        let mut chosen = None;
        for idx in bits(self.available) {
            seen += 1;
            if random_below(seen)? == 0 {
                chosen = Some(idx);
            }
        }
        let idx = chosen.ok_or(Error::NoChannelAvailable)?;
        self.available &= !(1u128 << idx);

        let ch = self.channel(idx).ok_or(Error::NoChannelAvailable)?;
        trace!("uplink channel {} at {} Hz", ch.idx, ch.frequency);
        Ok(ch)
    }

    /// Pick the channel for a join request
    ///
    /// Fixed bands without a sub-band rotate through the 125 kHz banks and the
    /// 500 kHz channels: `bank = (dev_nonce - join_nonce) mod banks`.
    pub fn select_join<F, E>(
        &mut self,
        dev_nonce: u16,
        join_nonce: u32,
        mut random_below: F,
    ) -> Result<Channel, Error<E>>
    where
        F: FnMut(u32) -> Result<u32, Error<E>>,
    {
        if self.band.is_fixed() && self.sub_band == 0 {
            let narrow = self.band.tx_spans[0];
            let narrow_banks = Self::num_125khz_banks(self.band);
            let wide = self.band.num_tx_spans > 1;
            let banks = narrow_banks as u32 + wide as u32;
            let bank = (dev_nonce as u32).wrapping_sub(join_nonce) % banks;

            let (idx, dr) = if bank < narrow_banks as u32 {
                let i = random_below(BANK_SIZE as u32)? as u8;
                (bank as u8 * BANK_SIZE + i, narrow.dr_join_request)
            } else {
                let span = self.band.tx_spans[1];
                let i = random_below(span.num_channels as u32)? as u8;
                (narrow.num_channels + i, span.dr_join_request)
            };
            self.data_rate_up = dr;
            let ch = self.channel(idx).ok_or(Error::NoChannelAvailable)?;
            debug!("join bank {} channel {}", bank, idx);
            return Ok(ch);
        }

        let dr = self.band.join_data_rate();
        if self.data_rate_up != dr {
            self.data_rate_up = dr;
            self.recalculate_available();
        }
        self.select_uplink(random_below)
    }

    /// Rx1 frequency and data rate for an uplink on `up`
    pub fn rx1(&self, up: &Channel) -> Option<(u32, u8)> {
        let mut dr = self.band.rx1_data_rate(up.dr, self.rx1_dr_offset)?;
        if self.dwell_time_dn_ms > 0 && dr < DWELL_DOWNLINK_DR_MIN {
            dr = DWELL_DOWNLINK_DR_MIN;
        }
        let frequency = match self.band.band_type {
            BandType::Dynamic => {
                let dl = self.downlink.get(up.idx as usize)?;
                if dl.frequency != 0 {
                    dl.frequency
                } else {
                    up.frequency
                }
            }
            BandType::Fixed => {
                let span = self.band.rx1_span;
                if span.num_channels == 0 {
                    return None;
                }
                span.frequency(up.idx % span.num_channels)
            }
        };
        Some((frequency, dr))
    }

    /// Define, replace or delete (`frequency == 0`) a dynamic uplink channel
    pub fn set_uplink_channel(&mut self, idx: u8, frequency: u32, dr_min: u8, dr_max: u8) {
        let i = idx as usize;
        if i >= NUM_DYNAMIC_CHANNELS {
            return;
        }
        if frequency == 0 {
            self.uplink[i] = Channel::NONE;
            self.downlink[i] = Channel::NONE;
            self.mask &= !(1u128 << idx);
        } else {
            let ch = Channel {
                enabled: true,
                idx,
                frequency,
                dr_min,
                dr_max,
                dr: dr_min,
            };
            self.uplink[i] = ch;
            self.downlink[i] = ch;
            self.mask |= 1u128 << idx;
        }
        self.recalculate_available();
    }

    /// Move the Rx1 frequency of a defined dynamic channel
    pub fn set_downlink_frequency(&mut self, idx: u8, frequency: u32) -> bool {
        match self.uplink.get(idx as usize) {
            Some(up) if up.frequency != 0 => {
                self.downlink[idx as usize].frequency = frequency;
                true
            }
            _ => false,
        }
    }

    /// Apply one ChMaskCntl/ChMask pair of a LinkADRReq to `working`
    ///
    /// Returns `None` when the control value is not defined for the band.
    pub fn ch_mask_control(&self, working: u128, cntl: u8, ch_mask: u16) -> Option<u128> {
        let bits16 = ch_mask as u128;
        match self.band.band_type {
            BandType::Dynamic => match cntl {
                0 => Some(bits16),
                6 => Some(self.defined_mask()),
                _ => None,
            },
            BandType::Fixed => {
                let narrow = self.band.tx_spans[0].num_channels as u32;
                let wide = if self.band.num_tx_spans > 1 {
                    self.band.tx_spans[1].num_channels as u32
                } else {
                    0
                };
                let narrow_bits = low_bits(narrow);
                let wide_bits = low_bits(wide) << narrow;
                let wide_from_mask = (bits16 << narrow) & wide_bits;
                match cntl {
                    0..=4 => {
                        let shift = 16 * cntl as u32;
                        Some((working & !(0xFFFFu128 << shift)) | (bits16 << shift))
                    }
                    5 => {
                        let mut mask = 0u128;
                        for bank in 0..(narrow / BANK_SIZE as u32).min(8) {
                            if ch_mask & (1 << bank) != 0 {
                                mask |= 0xFFu128 << (bank * BANK_SIZE as u32);
                            }
                        }
                        mask |= ((bits16 >> 8) << narrow) & wide_bits;
                        Some(mask)
                    }
                    6 => Some(narrow_bits | wide_from_mask),
                    7 => Some(wide_from_mask),
                    _ => None,
                }
            }
        }
    }

    /// Apply the CFList of a join accept
    pub fn apply_cflist(&mut self, cflist: &[u8]) -> bool {
        if cflist.len() != CFLIST_LEN {
            return false;
        }
        match (self.band.band_type, cflist[15]) {
            (BandType::Dynamic, CFLIST_TYPE_FREQUENCIES) => {
                let (dr_min, dr_max) = {
                    let d = self.band.default_channels[0];
                    (d.dr_min, d.dr_max)
                };
                for n in 0..5 {
                    let frequency = get_u24_le(cflist, 3 * n) * FREQ_UNIT_HZ;
                    let idx = (CFLIST_FIRST_CHANNEL + n) as u8;
                    if frequency == 0 || self.band.frequency_valid(frequency) {
                        self.set_uplink_channel(idx, frequency, dr_min, dr_max);
                    }
                }
                true
            }
            (BandType::Fixed, CFLIST_TYPE_CH_MASK) => {
                let n = self.band.num_channels() as usize;
                let mask = get_uint_le(cflist, 0, (n + 7) / 8) & self.defined_mask();
                self.set_mask(mask)
            }
            _ => {
                warn!("ignoring CFList type {}", cflist[15]);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::region::{EU868, US915};

    /// Deterministic linear congruential source
    struct Lcg(u64);

    impl Lcg {
        fn below(&mut self, n: u32) -> Result<u32, Error<()>> {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            Ok(((self.0 >> 33) as u32) % n)
        }
    }

    #[test]
    fn test_default_plans() {
        let eu = ChannelPlan::new(&EU868, 0);
        assert_eq!(eu.mask(), 0b111);
        assert_eq!(eu.data_rate_up, 3);

        let us = ChannelPlan::new(&US915, 0);
        assert_eq!(us.mask(), low_bits(72));

        let us2 = ChannelPlan::new(&US915, 2);
        assert_eq!(us2.mask(), (0xFFu128 << 8) | (1u128 << 65));
    }

    #[test]
    fn test_selection_without_replacement() {
        let mut plan = ChannelPlan::new(&EU868, 0);
        let mut rng = Lcg(1);
        let mut seen = 0u8;
        for _ in 0..3 {
            let ch = plan.select_uplink(|n| rng.below(n)).unwrap();
            seen |= 1 << ch.idx;
        }
        assert_eq!(seen, 0b111);
        assert_eq!(plan.available(), 0);
        // round restarts
        assert!(plan.select_uplink(|n| rng.below(n)).is_ok());
    }

    #[test]
    fn test_selection_uniform_and_respects_mask() {
        let mut plan = ChannelPlan::new(&US915, 0);
        assert!(plan.set_mask(0b1011_0110));
        let mut rng = Lcg(7);
        let mut counts = [0u32; 8];
        for _ in 0..4000 {
            // fresh round each time so only the first pick is counted
            plan.recalculate_available();
            let ch = plan.select_uplink(|n| rng.below(n)).unwrap();
            counts[ch.idx as usize] += 1;
        }
        for (i, count) in counts.iter().enumerate() {
            if plan.is_enabled(i as u8) {
                assert!((650..=950).contains(count), "channel {} count {}", i, count);
            } else {
                assert_eq!(*count, 0);
            }
        }
    }

    #[test]
    fn test_no_channel_for_data_rate() {
        let mut plan = ChannelPlan::new(&US915, 0);
        // only the 500 kHz channels remain, which cannot carry DR0
        plan.set_mask(0xFFu128 << 64);
        plan.data_rate_up = 0;
        plan.recalculate_available();
        let mut rng = Lcg(3);
        assert_eq!(
            plan.select_uplink(|n| rng.below(n)),
            Err(Error::NoChannelAvailable)
        );
        assert!(!plan.set_data_rate(0));
        assert!(plan.set_data_rate(4));
    }

    #[test]
    fn test_join_bank_rotation() {
        let mut plan = ChannelPlan::new(&US915, 0);
        let mut rng = Lcg(11);

        let ch = plan.select_join(5, 0, |n| rng.below(n)).unwrap();
        assert!((40..48).contains(&ch.idx));
        assert_eq!(plan.data_rate_up, 0);

        let ch = plan.select_join(8, 0, |n| rng.below(n)).unwrap();
        assert!((64..72).contains(&ch.idx));
        assert_eq!(plan.data_rate_up, 4);

        // wraps with join nonce larger than dev nonce
        let ch = plan.select_join(1, 2, |n| rng.below(n)).unwrap();
        let bank = 1u32.wrapping_sub(2) % 9;
        assert_eq!(ch.idx as u32 / 8, bank.min(8));
    }

    #[test]
    fn test_join_with_sub_band() {
        let mut plan = ChannelPlan::new(&US915, 2);
        let mut rng = Lcg(5);
        for _ in 0..16 {
            let ch = plan.select_join(3, 0, |n| rng.below(n)).unwrap();
            assert!((8..16).contains(&ch.idx));
            assert_eq!(plan.data_rate_up, 0);
        }
    }

    #[test]
    fn test_rx1_parameters() {
        let eu = ChannelPlan::new(&EU868, 0);
        let mut up = eu.channel(1).unwrap();
        up.dr = 5;
        assert_eq!(eu.rx1(&up), Some((868_300_000, 5)));

        let mut us = ChannelPlan::new(&US915, 0);
        us.rx1_dr_offset = 1;
        let mut up = us.channel(10).unwrap();
        up.dr = 2;
        assert_eq!(us.rx1(&up), Some((923_300_000 + 2 * 600_000, 11)));

        let mut eu = eu;
        eu.dwell_time_dn_ms = 400;
        up = eu.channel(0).unwrap();
        up.dr = 0;
        assert_eq!(eu.rx1(&up), Some((868_100_000, 2)));
    }

    #[test]
    fn test_cflist_frequencies() {
        let mut plan = ChannelPlan::new(&EU868, 0);
        let mut cflist = [0u8; 16];
        // 867.1 MHz and 867.3 MHz in 100 Hz units
        cflist[0..3].copy_from_slice(&(8_671_000u32).to_le_bytes()[..3]);
        cflist[3..6].copy_from_slice(&(8_673_000u32).to_le_bytes()[..3]);
        assert!(plan.apply_cflist(&cflist));
        assert_eq!(plan.mask(), 0b11111);
        assert_eq!(plan.channel(3).unwrap().frequency, 867_100_000);
        assert_eq!(plan.channel(4).unwrap().frequency, 867_300_000);
        assert!(plan.channel(5).is_none());
    }

    #[test]
    fn test_cflist_channel_mask() {
        let mut plan = ChannelPlan::new(&US915, 0);
        let mut cflist = [0u8; 16];
        cflist[1] = 0xFF;
        cflist[8] = 0x02;
        cflist[15] = 1;
        assert!(plan.apply_cflist(&cflist));
        assert_eq!(plan.mask(), (0xFFu128 << 8) | (1u128 << 65));
    }

    #[test]
    fn test_ch_mask_control_fixed() {
        let plan = ChannelPlan::new(&US915, 0);
        let all = plan.mask();

        let m = plan.ch_mask_control(all, 7, 0x0001).unwrap();
        assert_eq!(m, 1u128 << 64);

        let m = plan.ch_mask_control(m, 0, 0x00FF).unwrap();
        assert_eq!(m, (1u128 << 64) | 0xFF);

        let m = plan.ch_mask_control(0, 6, 0x0000).unwrap();
        assert_eq!(m, low_bits(64));

        let m = plan.ch_mask_control(0, 5, 0x0102).unwrap();
        assert_eq!(m, (0xFFu128 << 8) | (1u128 << 64));
    }

    #[test]
    fn test_ch_mask_control_dynamic() {
        let mut plan = ChannelPlan::new(&EU868, 0);
        assert_eq!(plan.ch_mask_control(0b111, 0, 0b010), Some(0b010));
        assert_eq!(plan.ch_mask_control(0b111, 1, 0b010), None);
        // undefined channel cannot be enabled
        let m = plan.ch_mask_control(0b111, 0, 0b1000).unwrap();
        assert!(!plan.mask_valid(m));

        plan.set_uplink_channel(5, 867_500_000, 0, 5);
        assert_eq!(plan.ch_mask_control(0, 6, 0), Some(0b100111));
    }

    #[test]
    fn test_enable_default_channels() {
        let mut plan = ChannelPlan::new(&EU868, 0);
        plan.set_uplink_channel(4, 867_300_000, 0, 5);
        assert!(plan.set_mask(1 << 4));
        plan.enable_default_channels();
        assert_eq!(plan.mask(), 0b10111);
    }
}
