//! Receive-window scheduling
//!
//! The scheduler drives one exchange at a time against the radio and the
//! clock:
//! - Transmit guard: duty-cycle budget and CSMA (`guard`)
//! - Class A: transmission followed by the Rx1 and Rx2 windows (`class_a`)
//! - Class C: continuous reception on the Rx2 parameters between and after
//!   the Class A windows (`class_c`)
//!
//! Every wait is a poll of [`Radio::poll_event`] interleaved with
//! `delay_ms(1)` on the clock, so a simulated clock drives the whole exchange.

/// Class A transmission and receive windows
pub mod class_a;

/// Class C continuous reception
pub mod class_c;

/// Duty cycle and CSMA
pub mod guard;

use heapless::Vec;

use crate::error::Error;
use crate::lorawan::mac::{Frame, MAX_FRAME_LEN};
use crate::lorawan::phy::{self, PhyLayer};
use crate::lorawan::region::Band;
use crate::radio::traits::{Clock, Radio, RadioEvent};

pub use guard::DutyCycle;

/// Receive window a downlink arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Window {
    /// First Class A window
    Rx1,
    /// Second Class A window
    Rx2,
    /// Class C continuous window
    RxC,
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No exchange running
    Idle,
    /// Checking duty cycle and channel activity
    TransmitGuard,
    /// Waiting for TX completion
    Transmitting,
    /// Waiting for Rx1 to open
    AwaitingRx1,
    /// Listening in Rx1
    Rx1Open,
    /// Waiting for Rx2 to open
    AwaitingRx2,
    /// Listening in Rx2
    Rx2Open,
    /// Listening continuously (Class C)
    RxC,
}

/// RX window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxConfig {
    /// Frequency in Hz
    pub frequency: u32,
    /// Data rate index
    pub data_rate: u8,
    /// Preamble detection timeout in ms; `None` listens until the deadline
    pub timeout_ms: Option<u32>,
}

/// Frame read from the radio
#[derive(Debug, Clone)]
pub struct Received {
    /// PHY payload
    pub frame: Frame,
    /// Window it arrived in
    pub window: Window,
    /// RSSI in dBm
    pub rssi: i16,
    /// SNR in dB
    pub snr: i8,
}

/// Window scheduler
#[derive(Debug, Clone)]
pub struct Scheduler {
    state: State,
    duty_cycle: DutyCycle,
    last_time_on_air_ms: u32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Idle scheduler
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            duty_cycle: DutyCycle::new(),
            last_time_on_air_ms: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Airtime of the last transmission
    pub fn last_time_on_air_ms(&self) -> u32 {
        self.last_time_on_air_ms
    }

    /// Duty-cycle tracker
    pub fn duty_cycle(&self) -> &DutyCycle {
        &self.duty_cycle
    }

    pub(crate) fn enter(&mut self, state: State) {
        if self.state != state {
            trace!("scheduler state {}", state as u8);
            self.state = state;
        }
    }
}

/// Poll the radio until it reports an event or `deadline` passes
pub(crate) fn wait_event<R: Radio, C: Clock>(
    radio: &mut R,
    clock: &mut C,
    deadline: u64,
) -> Result<Option<RadioEvent>, Error<R::Error>> {
    loop {
        match radio.poll_event() {
            Ok(event) => return Ok(Some(event)),
            Err(nb::Error::WouldBlock) => {
                if clock.now_ms() >= deadline {
                    return Ok(None);
                }
                clock.delay_ms(1);
            }
            Err(nb::Error::Other(e)) => return Err(Error::Radio(e)),
        }
    }
}

/// Block until the clock reaches `at`
pub(crate) fn sleep_until<C: Clock>(clock: &mut C, at: u64) {
    let now = clock.now_ms();
    if at > now {
        clock.delay_ms((at - now).min(u32::MAX as u64) as u32);
    }
}

/// Preamble timeout of a window at `dr`
pub(crate) fn window_timeout_ms(band: &Band, dr: u8, guard_ms: u32) -> u32 {
    let empty = band
        .data_rate(dr)
        .and_then(|rate| phy::time_on_air_ms(rate, 0))
        .unwrap_or(0);
    empty + guard_ms
}

/// Airtime of the largest downlink at `dr`
pub(crate) fn max_frame_time_ms(band: &Band, dr: u8) -> u32 {
    band.data_rate(dr)
        .and_then(|rate| phy::time_on_air_ms(rate, band.max_payload(dr) + phy::FRAME_OVERHEAD))
        .unwrap_or(0)
}

/// Listen with `cfg` until a frame arrives, the radio times out or
/// `deadline` passes
pub(crate) fn listen<R: Radio, C: Clock>(
    phy: &mut PhyLayer<R>,
    clock: &mut C,
    band: &Band,
    cfg: &RxConfig,
    window: Window,
    deadline: u64,
) -> Result<Option<Received>, Error<R::Error>> {
    phy.configure_rx(band, cfg.frequency, cfg.data_rate)?;
    phy.radio
        .start_receive(cfg.timeout_ms)
        .map_err(Error::Radio)?;

    let event = wait_event(&mut phy.radio, clock, deadline)?;
    let received = match event {
        Some(RadioEvent::RxDone) => {
            let mut buf = [0u8; MAX_FRAME_LEN];
            let len = phy.radio.read_packet(&mut buf).map_err(Error::Radio)?;
            let mut frame = Vec::new();
            // longer reads were truncated by the driver already
            let _ = frame.extend_from_slice(&buf[..len.min(MAX_FRAME_LEN)]);
            Some(Received {
                frame,
                window,
                rssi: phy.radio.last_rssi(),
                snr: phy.radio.last_snr(),
            })
        }
        Some(_) | None => None,
    };
    phy.radio.standby().map_err(Error::Radio)?;
    if let Some(rx) = &received {
        debug!("{} bytes in window {}", rx.frame.len(), window as u8);
    }
    Ok(received)
}
