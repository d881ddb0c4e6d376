use heapless::Vec;

use crate::error::Error;
use crate::lorawan::mac::{MacLayer, MAX_FRAME_LEN};
use crate::radio::traits::{Clock, Radio, RadioEvent};

use super::{wait_event, Received, RxConfig, Scheduler, State, Window};

/// Continuous reception parameters: the Rx2 channel without a timeout
pub fn rxc_config<R: Radio>(mac: &MacLayer<R>) -> RxConfig {
    let rx2 = mac.plan().rx2;
    RxConfig {
        frequency: rx2.frequency,
        data_rate: rx2.dr,
        timeout_ms: None,
    }
}

impl Scheduler {
    /// Put the radio into continuous reception on the Rx2 parameters
    pub fn start_rxc<R: Radio>(&mut self, mac: &mut MacLayer<R>) -> Result<(), Error<R::Error>> {
        let cfg = rxc_config(mac);
        let band = mac.plan().band();
        mac.phy.configure_rx(band, cfg.frequency, cfg.data_rate)?;
        mac.phy.radio.start_receive(None).map_err(Error::Radio)?;
        self.enter(State::RxC);
        Ok(())
    }

    /// Stop continuous reception
    pub fn stop_rxc<R: Radio>(&mut self, mac: &mut MacLayer<R>) -> Result<(), Error<R::Error>> {
        if self.state == State::RxC {
            mac.phy.radio.standby().map_err(Error::Radio)?;
            self.enter(State::Idle);
        }
        Ok(())
    }

    /// Receive in RxC until `until`, handing every frame to `accept`
    ///
    /// Reception keeps running when the deadline passes so a later call
    /// continues where this one stopped.
    pub fn listen_rxc<R, C, T, F>(
        &mut self,
        mac: &mut MacLayer<R>,
        clock: &mut C,
        until: u64,
        rejected: &mut Option<Error<R::Error>>,
        accept: &mut F,
    ) -> Result<Option<T>, Error<R::Error>>
    where
        R: Radio,
        C: Clock,
        F: FnMut(&mut MacLayer<R>, &Received) -> Result<T, Error<R::Error>>,
    {
        loop {
            if self.state != State::RxC {
                self.start_rxc(mac)?;
            }
            if clock.now_ms() >= until {
                return Ok(None);
            }

            match wait_event(&mut mac.phy.radio, clock, until)? {
                Some(RadioEvent::RxDone) => {
                    let mut buf = [0u8; MAX_FRAME_LEN];
                    let len = mac.phy.radio.read_packet(&mut buf).map_err(Error::Radio)?;
                    let mut frame = Vec::new();
                    let _ = frame.extend_from_slice(&buf[..len.min(MAX_FRAME_LEN)]);
                    let rx = Received {
                        frame,
                        window: Window::RxC,
                        rssi: mac.phy.radio.last_rssi(),
                        snr: mac.phy.radio.last_snr(),
                    };
                    // some radios leave receive mode after a packet
                    self.enter(State::Idle);
                    match accept(mac, &rx) {
                        Ok(found) => return Ok(Some(found)),
                        Err(e) => {
                            debug!("RxC frame discarded");
                            *rejected = Some(e);
                        }
                    }
                }
                Some(_) => self.enter(State::Idle),
                None => return Ok(None),
            }
        }
    }
}
