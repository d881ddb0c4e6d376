use crate::error::Error;
use crate::lorawan::mac::MacLayer;
use crate::lorawan::phy;
use crate::radio::traits::{Clock, Radio, RadioEvent};

use super::{
    listen, max_frame_time_ms, sleep_until, wait_event, window_timeout_ms, Received, RxConfig,
    Scheduler, State, Window,
};

/// Extra time granted to the radio beyond the frame's airtime
pub const TX_TIMEOUT_MARGIN_MS: u32 = 500;

/// Rx2 opens this long after Rx1
pub const RX2_OFFSET_MS: u32 = 1000;

/// Frequencies, data rates and delays of one Class A exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    /// Rx1 frequency and data rate, if the uplink data rate maps to one
    pub rx1: Option<(u32, u8)>,
    /// Rx2 frequency and data rate
    pub rx2: (u32, u8),
    /// Delay from the end of the uplink to Rx1
    pub rx1_delay_ms: u32,
    /// Delay from the end of the uplink to Rx2
    pub rx2_delay_ms: u32,
}

impl Scheduler {
    /// Transmit the frame the radio was configured for, returning the time
    /// the transmission ended
    ///
    /// `started` runs as soon as the radio has accepted the frame, even if
    /// the transmission then never completes.
    pub fn transmit<R, C, F>(
        &mut self,
        mac: &mut MacLayer<R>,
        clock: &mut C,
        frame: &[u8],
        dr: u8,
        started: F,
    ) -> Result<u64, Error<R::Error>>
    where
        R: Radio,
        C: Clock,
        F: FnOnce(&mut MacLayer<R>),
    {
        let band = mac.plan().band();
        let toa = band
            .data_rate(dr)
            .and_then(|rate| phy::time_on_air_ms(rate, frame.len()))
            .unwrap_or(0);

        self.enter(State::Transmitting);
        if let Err(e) = mac.phy.radio.start_transmit(frame) {
            self.enter(State::Idle);
            return Err(Error::Radio(e));
        }
        started(mac);
        let deadline = clock.now_ms() + (toa + TX_TIMEOUT_MARGIN_MS) as u64;
        let event = wait_event(&mut mac.phy.radio, clock, deadline);
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                self.enter(State::Idle);
                return Err(e);
            }
        };
        if event != Some(RadioEvent::TxDone) {
            warn!("no TX completion after {} ms", toa + TX_TIMEOUT_MARGIN_MS);
            // the radio is already in error, keep the timeout
            let _ = mac.phy.radio.standby();
            self.enter(State::Idle);
            return Err(Error::TxTimeout);
        }

        let end = clock.now_ms();
        self.last_time_on_air_ms = toa;
        self.duty_cycle.record(end, toa);
        debug!("uplink of {} bytes done, {} ms on air", frame.len(), toa);
        Ok(end)
    }

    /// Open Rx1 and Rx2 after an uplink that ended at `tx_end`
    ///
    /// Every received frame is handed to `accept`; the first accepted frame
    /// ends the exchange. Rejected frames are reported through `rejected` and
    /// listening continues. With `rxc` set the gaps before the windows are
    /// filled with Class C reception.
    #[allow(clippy::too_many_arguments)]
    pub fn class_a_windows<R, C, T, F>(
        &mut self,
        mac: &mut MacLayer<R>,
        clock: &mut C,
        tx_end: u64,
        plan: &WindowPlan,
        guard_ms: u32,
        rxc: bool,
        rejected: &mut Option<Error<R::Error>>,
        mut accept: F,
    ) -> Result<Option<T>, Error<R::Error>>
    where
        R: Radio,
        C: Clock,
        F: FnMut(&mut MacLayer<R>, &Received) -> Result<T, Error<R::Error>>,
    {
        let windows = [
            (Window::Rx1, plan.rx1, plan.rx1_delay_ms, State::AwaitingRx1, State::Rx1Open),
            (Window::Rx2, Some(plan.rx2), plan.rx2_delay_ms, State::AwaitingRx2, State::Rx2Open),
        ];

        for (window, params, delay, awaiting, open) in windows {
            let (frequency, dr) = match params {
                Some(p) => p,
                None => continue,
            };
            let band = mac.plan().band();
            let cfg = RxConfig {
                frequency,
                data_rate: dr,
                timeout_ms: Some(window_timeout_ms(band, dr, guard_ms)),
            };
            let start = (tx_end + delay as u64).saturating_sub(guard_ms as u64);

            self.enter(awaiting);
            if rxc {
                let found = self.listen_rxc(mac, clock, start, rejected, &mut accept);
                match found {
                    Ok(Some(found)) => {
                        self.enter(State::Idle);
                        return Ok(Some(found));
                    }
                    Ok(None) => mac.phy.radio.standby().map_err(Error::Radio)?,
                    Err(e) => {
                        self.enter(State::Idle);
                        return Err(e);
                    }
                }
            }
            sleep_until(clock, start);

            self.enter(open);
            trace!("window {} at {} Hz DR {}", window as u8, frequency, dr);
            let deadline = clock.now_ms()
                + cfg.timeout_ms.unwrap_or(0) as u64
                + max_frame_time_ms(band, dr) as u64;
            let received = match listen(&mut mac.phy, clock, band, &cfg, window, deadline) {
                Ok(received) => received,
                Err(e) => {
                    self.enter(State::Idle);
                    return Err(e);
                }
            };
            if let Some(rx) = received {
                match accept(mac, &rx) {
                    Ok(found) => {
                        self.enter(State::Idle);
                        return Ok(Some(found));
                    }
                    Err(e) => {
                        warn!("frame in window {} discarded", window as u8);
                        *rejected = Some(e);
                    }
                }
            }
        }

        self.enter(State::Idle);
        Ok(None)
    }
}

