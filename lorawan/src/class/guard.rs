use crate::config::CsmaConfig;
use crate::error::Error;
use crate::lorawan::commands::DUTY_CYCLE_PERIOD_MS;
use crate::lorawan::phy::PhyLayer;
use crate::radio::traits::{Clock, Radio, RadioEvent};

use super::wait_event;

/// Longest a single CAD may take
const CAD_TIMEOUT_MS: u64 = 100;

/// Transmission bookkeeping for the duty-cycle budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DutyCycle {
    last_tx_end_ms: Option<u64>,
    last_time_on_air_ms: u32,
}

impl DutyCycle {
    /// No transmission recorded
    pub const fn new() -> Self {
        Self {
            last_tx_end_ms: None,
            last_time_on_air_ms: 0,
        }
    }

    /// Effective budget in ms of airtime per hour
    ///
    /// The smaller of the band (or host override) budget and the
    /// network's `1 / 2^exp` limit; `None` when unrestricted.
    pub fn budget_ms(band_ms_per_hour: u32, max_duty_cycle_exp: u8) -> Option<u32> {
        let band = if band_ms_per_hour > 0 {
            Some(band_ms_per_hour)
        } else {
            None
        };
        let network = if max_duty_cycle_exp > 0 {
            Some(DUTY_CYCLE_PERIOD_MS >> max_duty_cycle_exp.min(15))
        } else {
            None
        };
        match (band, network) {
            (Some(b), Some(n)) => Some(b.min(n)),
            (b, n) => b.or(n),
        }
    }

    /// Silence required after a transmission of `time_on_air_ms`
    pub fn interval_ms(time_on_air_ms: u32, budget_ms: u32) -> u32 {
        let budget = budget_ms.max(1) as u64;
        let num = DUTY_CYCLE_PERIOD_MS as u64 * time_on_air_ms as u64;
        ((num + budget - 1) / budget).min(u32::MAX as u64) as u32
    }

    /// Time left before the next transmission is allowed at `now`
    pub fn wait_ms(&self, now: u64, budget_ms: Option<u32>) -> u32 {
        let (end, budget) = match (self.last_tx_end_ms, budget_ms) {
            (Some(end), Some(budget)) => (end, budget),
            _ => return 0,
        };
        let next = end + Self::interval_ms(self.last_time_on_air_ms, budget) as u64;
        next.saturating_sub(now).min(u32::MAX as u64) as u32
    }

    /// Record a finished transmission
    pub fn record(&mut self, end_ms: u64, time_on_air_ms: u32) {
        self.last_tx_end_ms = Some(end_ms);
        self.last_time_on_air_ms = time_on_air_ms;
    }
}

/// Run one channel activity detection on the configured channel
pub(crate) fn channel_busy<R: Radio, C: Clock>(
    phy: &mut PhyLayer<R>,
    clock: &mut C,
) -> Result<bool, Error<R::Error>> {
    phy.radio
        .start_channel_activity_detection()
        .map_err(Error::Radio)?;
    let deadline = clock.now_ms() + CAD_TIMEOUT_MS;
    match wait_event(&mut phy.radio, clock, deadline)? {
        Some(RadioEvent::CadDone { busy }) => Ok(busy),
        // a CAD that never finishes counts as activity
        _ => Ok(true),
    }
}

/// Listen-before-talk state across channel changes
///
/// The backoff counter is drawn once per uplink and keeps counting down
/// after a channel change. Each round first needs `difs_slots` free probes,
/// then one free probe per remaining backoff slot.
#[derive(Debug, Clone, Copy)]
pub struct Csma {
    config: CsmaConfig,
    backoff: u32,
    changes: u8,
}

impl Csma {
    /// Draw the backoff counter
    pub fn new<R: Radio>(config: CsmaConfig, phy: &mut PhyLayer<R>) -> Result<Self, Error<R::Error>> {
        let backoff = if config.backoff_max > 0 {
            phy.random_range(1, config.backoff_max as u32)?
        } else {
            0
        };
        Ok(Self {
            config,
            backoff,
            changes: 0,
        })
    }

    /// Probe the configured channel; `Ok(true)` when it is clear
    ///
    /// A busy channel counts one change against `max_channel_changes`; when
    /// none are left the result is [`Error::ChannelBusy`].
    pub fn probe<R: Radio, C: Clock>(
        &mut self,
        phy: &mut PhyLayer<R>,
        clock: &mut C,
    ) -> Result<bool, Error<R::Error>> {
        if !self.config.enabled {
            return Ok(true);
        }
        let mut busy = false;
        for _ in 0..self.config.difs_slots {
            if channel_busy(phy, clock)? {
                busy = true;
                break;
            }
        }
        while !busy && self.backoff > 0 {
            if channel_busy(phy, clock)? {
                busy = true;
            } else {
                self.backoff -= 1;
            }
        }
        if !busy {
            return Ok(true);
        }

        self.changes += 1;
        if self.changes > self.config.max_channel_changes {
            warn!("channel busy after {} changes", self.changes - 1);
            return Err(Error::ChannelBusy);
        }
        debug!("channel busy, backoff {} left", self.backoff);
        Ok(false)
    }
}
