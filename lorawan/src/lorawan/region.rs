//! Regional band descriptors
//!
//! A [`Band`] is static configuration: the channel layout, data rates, power
//! steps and regulatory limits of one regional plan. The channel plan engine
//! and MAC command handlers only read it. EU868 (dynamic plan) and US915 (fixed
//! plan) are provided; other regions are expressed as further `Band` values.

/// Number of data rate indices a band can define
pub const NUM_DATA_RATES: usize = 15;

/// Marker for an unusable cell in the Rx1 data rate table
pub const DR_UNUSED: u8 = 0x0F;

/// Uplink dwell time limit where a band enforces one
pub const DWELL_TIME_MS: u32 = 400;

/// Lowest downlink data rate allowed while downlink dwell time is in force
pub const DWELL_DOWNLINK_DR_MIN: u8 = 2;

/// Channel plan type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BandType {
    /// Explicit channel table, extended by NewChannelReq / CFList frequencies
    Dynamic,
    /// Channels derived arithmetically from spans, selected by a channel mask
    Fixed,
}

/// Modulation bundle for one data rate index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRate {
    /// LoRa modulation
    Lora {
        /// Spreading factor (7-12)
        spreading_factor: u8,
        /// Bandwidth in kHz
        bandwidth_khz: u16,
        /// Coding rate denominator (5 = 4/5 .. 8 = 4/8)
        coding_rate: u8,
    },
    /// GFSK modulation
    Fsk {
        /// Bit rate in kbps
        bit_rate_kbps: u16,
        /// Frequency deviation in kHz
        freq_dev_khz: u16,
    },
    /// LR-FHSS modulation
    LrFhss {
        /// Occupied channel width code
        bandwidth: u8,
        /// Coding rate code
        coding_rate: u8,
        /// Narrow hopping grid
        narrow_grid: bool,
    },
    /// Index not defined by the band
    None,
}

/// A single uplink or downlink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    /// Whether the channel may be used
    pub enabled: bool,
    /// Channel index
    pub idx: u8,
    /// Frequency in Hz
    pub frequency: u32,
    /// Lowest data rate allowed on the channel
    pub dr_min: u8,
    /// Highest data rate allowed on the channel
    pub dr_max: u8,
    /// Data rate to use on this channel
    pub dr: u8,
}

impl Channel {
    /// Undefined channel
    pub const NONE: Channel = Channel {
        enabled: false,
        idx: 0,
        frequency: 0,
        dr_min: 0,
        dr_max: 0,
        dr: 0,
    };

    /// Whether the channel allows data rate `dr`
    pub fn supports(&self, dr: u8) -> bool {
        self.dr_min <= dr && dr <= self.dr_max
    }
}

/// Block of equally spaced channels in a fixed band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSpan {
    /// Number of channels
    pub num_channels: u8,
    /// Frequency of the first channel in Hz
    pub freq_start: u32,
    /// Spacing in Hz
    pub freq_step: u32,
    /// Lowest data rate
    pub dr_min: u8,
    /// Highest data rate
    pub dr_max: u8,
    /// Data rate used for join requests on this span
    pub dr_join_request: u8,
}

impl ChannelSpan {
    /// Empty span
    pub const NONE: ChannelSpan = ChannelSpan {
        num_channels: 0,
        freq_start: 0,
        freq_step: 0,
        dr_min: 0,
        dr_max: 0,
        dr_join_request: DR_UNUSED,
    };

    /// Frequency of channel `i` within the span
    pub fn frequency(&self, i: u8) -> u32 {
        self.freq_start + self.freq_step * i as u32
    }
}

/// Regional band descriptor
#[derive(Debug)]
pub struct Band {
    /// Identifier stored in the persistence buffers
    pub id: u8,
    /// Human readable name
    pub name: &'static str,
    /// Channel plan type
    pub band_type: BandType,
    /// Lowest legal frequency in Hz
    pub freq_min: u32,
    /// Highest legal frequency in Hz
    pub freq_max: u32,
    /// Maximum application payload (no FOpts) per data rate
    pub payload_len_max: [u8; NUM_DATA_RATES],
    /// Maximum EIRP in dBm (TXPower 0)
    pub power_max: i8,
    /// Highest TXPower index; each step is -2 dB
    pub power_num_steps: u8,
    /// Default duty-cycle budget in ms of airtime per hour; 0 means unlimited
    pub duty_cycle_ms_per_hour: u32,
    /// Default uplink dwell time in ms; 0 means unlimited
    pub dwell_time_up_ms: u32,
    /// Default downlink dwell time in ms; 0 means unlimited
    pub dwell_time_dn_ms: u32,
    /// Whether TxParamSetupReq is implemented in this region
    pub tx_param_supported: bool,
    /// Default channels of a dynamic band
    pub default_channels: [Channel; 3],
    /// Number of used entries in `tx_spans`
    pub num_tx_spans: u8,
    /// Uplink channel spans of a fixed band
    pub tx_spans: [ChannelSpan; 2],
    /// Downlink Rx1 channels of a fixed band
    pub rx1_span: ChannelSpan,
    /// Rx1 data rate per (uplink data rate, Rx1 offset)
    pub rx1_dr_table: [[u8; 8]; NUM_DATA_RATES],
    /// Default Rx2 channel
    pub rx2: Channel,
    /// Modulation per data rate index
    pub data_rates: [DataRate; NUM_DATA_RATES],
}

impl Band {
    /// Whether channels are derived from spans
    pub fn is_fixed(&self) -> bool {
        self.band_type == BandType::Fixed
    }

    /// Modulation for `dr`, if defined
    pub fn data_rate(&self, dr: u8) -> Option<&DataRate> {
        match self.data_rates.get(dr as usize) {
            Some(DataRate::None) | None => None,
            Some(rate) => Some(rate),
        }
    }

    /// Whether `hz` lies inside the band
    pub fn frequency_valid(&self, hz: u32) -> bool {
        self.freq_min <= hz && hz <= self.freq_max
    }

    /// Maximum application payload at `dr` when no FOpts are sent
    pub fn max_payload(&self, dr: u8) -> usize {
        self.payload_len_max.get(dr as usize).copied().unwrap_or(0) as usize
    }

    /// Rx1 data rate for an uplink at `dr_up` with the given offset
    pub fn rx1_data_rate(&self, dr_up: u8, offset: u8) -> Option<u8> {
        let row = self.rx1_dr_table.get(dr_up as usize)?;
        match row.get(offset as usize) {
            Some(&dr) if dr != DR_UNUSED => Some(dr),
            _ => None,
        }
    }

    /// Output power for a TXPower index
    pub fn tx_power_dbm(&self, steps: u8) -> Option<i8> {
        if steps > self.power_num_steps {
            return None;
        }
        Some(self.power_max - 2 * steps as i8)
    }

    /// TXPower index that yields at most `dbm`
    pub fn tx_power_steps(&self, dbm: i8) -> Option<u8> {
        if dbm > self.power_max {
            return None;
        }
        let steps = ((self.power_max - dbm) as u8 + 1) / 2;
        if steps > self.power_num_steps {
            return None;
        }
        Some(steps)
    }

    /// Uplink spans in use
    pub fn spans(&self) -> &[ChannelSpan] {
        &self.tx_spans[..self.num_tx_spans as usize]
    }

    /// Number of uplink channels addressable by index
    pub fn num_channels(&self) -> u8 {
        match self.band_type {
            BandType::Fixed => self.spans().iter().map(|s| s.num_channels).sum(),
            BandType::Dynamic => crate::lorawan::channels::NUM_DYNAMIC_CHANNELS as u8,
        }
    }

    /// Uplink channel `idx` of a fixed band, enabled flag cleared
    pub fn fixed_channel(&self, idx: u8) -> Option<Channel> {
        let mut base = 0u8;
        for span in self.spans() {
            if idx < base + span.num_channels {
                let i = idx - base;
                return Some(Channel {
                    enabled: false,
                    idx,
                    frequency: span.frequency(i),
                    dr_min: span.dr_min,
                    dr_max: span.dr_max,
                    dr: span.dr_min,
                });
            }
            base += span.num_channels;
        }
        None
    }

    /// Default data rate of a join request
    pub fn join_data_rate(&self) -> u8 {
        match self.band_type {
            BandType::Fixed => self.tx_spans[0].dr_join_request,
            BandType::Dynamic => self.default_channels[0].dr,
        }
    }
}

const fn ch(idx: u8, frequency: u32, dr_min: u8, dr_max: u8, dr: u8) -> Channel {
    Channel {
        enabled: true,
        idx,
        frequency,
        dr_min,
        dr_max,
        dr,
    }
}

const fn lora(spreading_factor: u8, bandwidth_khz: u16) -> DataRate {
    DataRate::Lora {
        spreading_factor,
        bandwidth_khz,
        coding_rate: 5,
    }
}

const F: u8 = DR_UNUSED;

/// Europe 863-870 MHz
pub static EU868: Band = Band {
    id: 0,
    name: "EU868",
    band_type: BandType::Dynamic,
    freq_min: 863_000_000,
    freq_max: 870_000_000,
    payload_len_max: [51, 51, 51, 115, 242, 242, 242, 242, 50, 115, 50, 115, 0, 0, 0],
    power_max: 16,
    power_num_steps: 7,
    duty_cycle_ms_per_hour: 36_000,
    dwell_time_up_ms: 0,
    dwell_time_dn_ms: 0,
    tx_param_supported: false,
    default_channels: [
        ch(0, 868_100_000, 0, 5, 3),
        ch(1, 868_300_000, 0, 5, 3),
        ch(2, 868_500_000, 0, 5, 3),
    ],
    num_tx_spans: 0,
    tx_spans: [ChannelSpan::NONE, ChannelSpan::NONE],
    rx1_span: ChannelSpan::NONE,
    rx1_dr_table: [
        [0, 0, 0, 0, 0, 0, F, F],
        [1, 0, 0, 0, 0, 0, F, F],
        [2, 1, 0, 0, 0, 0, F, F],
        [3, 2, 1, 0, 0, 0, F, F],
        [4, 3, 2, 1, 0, 0, F, F],
        [5, 4, 3, 2, 1, 0, F, F],
        [6, 5, 4, 3, 2, 1, F, F],
        [7, 6, 5, 4, 3, 2, F, F],
        [1, 0, 0, 0, 0, 0, F, F],
        [2, 1, 0, 0, 0, 0, F, F],
        [1, 0, 0, 0, 0, 0, F, F],
        [2, 1, 0, 0, 0, 0, F, F],
        [F; 8],
        [F; 8],
        [F; 8],
    ],
    rx2: ch(0, 869_525_000, 0, 7, 0),
    data_rates: [
        lora(12, 125),
        lora(11, 125),
        lora(10, 125),
        lora(9, 125),
        lora(8, 125),
        lora(7, 125),
        lora(7, 250),
        DataRate::Fsk {
            bit_rate_kbps: 50,
            freq_dev_khz: 25,
        },
        DataRate::LrFhss {
            bandwidth: 2,
            coding_rate: 3,
            narrow_grid: true,
        },
        DataRate::LrFhss {
            bandwidth: 2,
            coding_rate: 1,
            narrow_grid: true,
        },
        DataRate::LrFhss {
            bandwidth: 4,
            coding_rate: 3,
            narrow_grid: true,
        },
        DataRate::LrFhss {
            bandwidth: 4,
            coding_rate: 1,
            narrow_grid: true,
        },
        DataRate::None,
        DataRate::None,
        DataRate::None,
    ],
};

/// United States 902-928 MHz
pub static US915: Band = Band {
    id: 1,
    name: "US915",
    band_type: BandType::Fixed,
    freq_min: 902_000_000,
    freq_max: 928_000_000,
    payload_len_max: [11, 53, 125, 242, 242, 50, 125, 0, 53, 129, 242, 242, 242, 242, 0],
    power_max: 30,
    power_num_steps: 14,
    duty_cycle_ms_per_hour: 0,
    dwell_time_up_ms: DWELL_TIME_MS,
    dwell_time_dn_ms: 0,
    tx_param_supported: false,
    default_channels: [Channel::NONE, Channel::NONE, Channel::NONE],
    num_tx_spans: 2,
    tx_spans: [
        ChannelSpan {
            num_channels: 64,
            freq_start: 902_300_000,
            freq_step: 200_000,
            dr_min: 0,
            dr_max: 3,
            dr_join_request: 0,
        },
        ChannelSpan {
            num_channels: 8,
            freq_start: 903_000_000,
            freq_step: 1_600_000,
            dr_min: 4,
            dr_max: 4,
            dr_join_request: 4,
        },
    ],
    rx1_span: ChannelSpan {
        num_channels: 8,
        freq_start: 923_300_000,
        freq_step: 600_000,
        dr_min: 8,
        dr_max: 13,
        dr_join_request: DR_UNUSED,
    },
    rx1_dr_table: [
        [10, 9, 8, 8, F, F, F, F],
        [11, 10, 9, 8, F, F, F, F],
        [12, 11, 10, 9, F, F, F, F],
        [13, 12, 11, 10, F, F, F, F],
        [13, 13, 12, 11, F, F, F, F],
        [10, 9, 8, 8, F, F, F, F],
        [11, 10, 9, 8, F, F, F, F],
        [F; 8],
        [F; 8],
        [F; 8],
        [F; 8],
        [F; 8],
        [F; 8],
        [F; 8],
        [F; 8],
    ],
    rx2: ch(0, 923_300_000, 8, 13, 8),
    data_rates: [
        lora(10, 125),
        lora(9, 125),
        lora(8, 125),
        lora(7, 125),
        lora(8, 500),
        DataRate::LrFhss {
            bandwidth: 8,
            coding_rate: 3,
            narrow_grid: false,
        },
        DataRate::LrFhss {
            bandwidth: 8,
            coding_rate: 1,
            narrow_grid: false,
        },
        DataRate::None,
        lora(12, 500),
        lora(11, 500),
        lora(10, 500),
        lora(9, 500),
        lora(8, 500),
        lora(7, 500),
        DataRate::None,
    ],
};

/// Bands known to this crate, indexed by [`Band::id`]
pub static BANDS: [&Band; 2] = [&EU868, &US915];
