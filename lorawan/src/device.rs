//! High-level LoRaWAN node interface
//!
//! [`LoRaWANNode`] ties the frame processor to the window scheduler. It owns
//! the radio and the clock and exposes activation, traffic, tuning and
//! persistence.
//!
//! Persist the nonces buffer after every [`LoRaWANNode::join`] attempt and
//! the session buffer after every [`LoRaWANNode::send`].

use crate::{
    class::{
        class_a::{WindowPlan, RX2_OFFSET_MS},
        guard::{Csma, DutyCycle},
        Received, Scheduler, State,
    },
    config::{
        device::{AbpCredentials, DevAddr, DeviceClass, OtaaCredentials, Revision},
        CsmaConfig, NodeSettings,
    },
    error::Error,
    lorawan::{
        commands::{cid, DeviceTime, LinkCheck},
        mac::{
            Downlink, MacLayer, MulticastSession, Uplink, JOIN_ACCEPT_DELAY_1_MS,
            JOIN_ACCEPT_DELAY_2_MS,
        },
        region::{Band, Channel},
        session::{Credentials, SessionStatus, NONCES_BUF_LEN, SESSION_BUF_LEN},
    },
    radio::traits::{Clock, Radio},
};

/// Highest application port
pub const MAX_APP_PORT: u8 = 223;

/// Port reserved for compliance testing
pub const TEST_PORT: u8 = 224;

/// Result of [`LoRaWANNode::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome<E> {
    /// Frame counter the uplink used
    pub fcnt: u32,
    /// Downlink received in Rx1, Rx2 or RxC
    pub downlink: Option<Downlink>,
    /// The confirmed uplink was acknowledged
    pub acked: bool,
    /// The application payload went out; `false` when pending MAC answers
    /// had to be sent alone on port 0 and the payload must be sent again
    pub payload_sent: bool,
    /// Last frame discarded during the exchange (bad MIC, replay, ...)
    pub rejected: Option<Error<E>>,
}

/// LoRaWAN end device
pub struct LoRaWANNode<R: Radio, C: Clock> {
    mac: MacLayer<R>,
    clock: C,
    settings: NodeSettings,
    scheduler: Scheduler,
}

impl<R: Radio, C: Clock> LoRaWANNode<R, C> {
    /// Create a node on `band`
    ///
    /// `sub_band` selects an 8-channel bank of a fixed band (1-based); 0
    /// enables all channels.
    pub fn new(radio: R, clock: C, band: &'static Band, sub_band: u8, settings: NodeSettings) -> Self {
        info!("LoRaWAN node on {}", band.id);
        Self {
            mac: MacLayer::new(radio, band, sub_band),
            clock,
            settings,
            scheduler: Scheduler::new(),
        }
    }

    /// Configure over-the-air activation
    ///
    /// Any previous session and nonces are dropped; restore the nonces
    /// buffer afterwards to continue the DevNonce sequence.
    pub fn begin_otaa(&mut self, credentials: OtaaCredentials) -> Result<(), Error<R::Error>> {
        self.mac.set_credentials(Credentials::Otaa(credentials));
        self.scheduler = Scheduler::new();
        self.create_session()
    }

    /// Configure activation by personalization
    pub fn begin_abp(&mut self, credentials: AbpCredentials) -> Result<(), Error<R::Error>> {
        self.mac.set_credentials(Credentials::Abp(credentials));
        self.scheduler = Scheduler::new();
        self.create_session()
    }

    /// Populate a fresh session with defaults
    pub fn create_session(&mut self) -> Result<(), Error<R::Error>> {
        self.mac.create_session(self.settings.adr_enabled)
    }

    /// Join the network over the air
    ///
    /// Returns immediately when a restored session is pending or a session is
    /// already active. Otherwise sends one join request and listens in both
    /// join-accept windows.
    pub fn join(&mut self) -> Result<(), Error<R::Error>> {
        if !matches!(self.mac.credentials(), Credentials::Otaa(_)) {
            return Err(Error::Unsupported);
        }
        if self.mac.confirm_session() || self.mac.session().is_active() {
            return Ok(());
        }
        if self.mac.session().status != SessionStatus::Activating {
            self.create_session()?;
        }
        self.guard_duty_cycle()?;

        let (frame, dev_nonce) = self.mac.compose_join_request()?;
        self.scheduler.enter(State::TransmitGuard);
        let guarded = self.join_channel(dev_nonce);
        let channel = self.idle_on_error(guarded)?;

        info!("join request on {} Hz DR {}", channel.frequency, channel.dr);
        let tx_end = self
            .scheduler
            .transmit(&mut self.mac, &mut self.clock, &frame, channel.dr, |_| {})?;

        let plan = WindowPlan {
            rx1: self.mac.plan().rx1(&channel),
            rx2: self.rx2(),
            rx1_delay_ms: JOIN_ACCEPT_DELAY_1_MS,
            rx2_delay_ms: JOIN_ACCEPT_DELAY_2_MS,
        };
        let mut rejected = None;
        let accepted = self.scheduler.class_a_windows(
            &mut self.mac,
            &mut self.clock,
            tx_end,
            &plan,
            self.settings.rx_guard_ms,
            false,
            &mut rejected,
            |mac, rx| mac.process_join_accept(&rx.frame, dev_nonce),
        )?;

        match (accepted, rejected) {
            (Some(()), _) => Ok(()),
            (None, Some(e)) => Err(e),
            (None, None) => {
                info!("no join accept");
                Err(Error::NoJoinAccept)
            }
        }
    }

    /// Activate by personalization, or confirm a restored session
    pub fn activate_abp(&mut self) -> Result<(), Error<R::Error>> {
        self.mac.activate_abp()
    }

    /// Join or activate, depending on the configured credentials
    pub fn activate(&mut self) -> Result<(), Error<R::Error>> {
        match self.mac.credentials() {
            Credentials::Otaa(_) => self.join(),
            Credentials::Abp(_) => self.activate_abp(),
            Credentials::None => Err(Error::NoSession),
        }
    }

    /// Whether a session is active
    pub fn is_activated(&self) -> bool {
        self.mac.session().is_active()
    }

    fn check_port(&self, port: u8) -> Result<(), Error<R::Error>> {
        match port {
            1..=MAX_APP_PORT => Ok(()),
            TEST_PORT if self.settings.allow_test_port => Ok(()),
            _ => Err(Error::InvalidPort(port)),
        }
    }

    fn duty_cycle_budget(&self) -> Option<u32> {
        if !self.settings.duty_cycle_enabled {
            return None;
        }
        let band = self
            .settings
            .duty_cycle_ms_per_hour
            .unwrap_or(self.mac.plan().band().duty_cycle_ms_per_hour);
        DutyCycle::budget_ms(band, self.mac.session().mac.duty_cycle_exp)
    }

    fn guard_duty_cycle(&mut self) -> Result<(), Error<R::Error>> {
        let wait_ms = self.time_until_uplink();
        if wait_ms > 0 {
            debug!("duty cycle: {} ms left", wait_ms);
            return Err(Error::DutyCycleLimited { wait_ms });
        }
        Ok(())
    }

    fn rx2(&self) -> (u32, u8) {
        let rx2 = self.mac.plan().rx2;
        (rx2.frequency, rx2.dr)
    }

    fn idle_on_error<T>(&mut self, result: Result<T, Error<R::Error>>) -> Result<T, Error<R::Error>> {
        if result.is_err() {
            self.scheduler.enter(State::Idle);
        }
        result
    }

    /// Pick a join channel that passes CSMA and configure the radio for it
    fn join_channel(&mut self, dev_nonce: u16) -> Result<Channel, Error<R::Error>> {
        let mut csma = Csma::new(self.settings.csma, &mut self.mac.phy)?;
        loop {
            let channel = self.mac.select_join_channel(dev_nonce)?;
            let band = self.mac.plan().band();
            self.mac
                .phy
                .configure_tx(band, channel.frequency, channel.dr, band.power_max)?;
            if csma.probe(&mut self.mac.phy, &mut self.clock)? {
                return Ok(channel);
            }
        }
    }

    /// Pick an uplink channel that passes CSMA and configure the radio
    ///
    /// The first copy of an uplink is composed on the chosen channel;
    /// repetitions reuse `first` and are only signed again.
    fn uplink_channel(
        &mut self,
        first: Option<&Uplink>,
        payload: &[u8],
        port: u8,
        confirmed: bool,
        fcnt: u32,
    ) -> Result<(Uplink, Channel), Error<R::Error>> {
        let mut csma = Csma::new(self.settings.csma, &mut self.mac.phy)?;
        loop {
            let channel = self.mac.select_uplink_channel()?;
            let uplink = match first {
                Some(first) => {
                    let mut uplink = first.clone();
                    self.mac.sign_uplink(&mut uplink, &channel);
                    uplink
                }
                None => self
                    .mac
                    .compose_uplink(payload, port, confirmed, fcnt, &channel)?,
            };
            let band = self.mac.plan().band();
            let power = self.mac.tx_power_dbm();
            self.mac
                .phy
                .configure_tx(band, channel.frequency, channel.dr, power)?;
            if csma.probe(&mut self.mac.phy, &mut self.clock)? {
                return Ok((uplink, channel));
            }
        }
    }

    /// Select a channel and transmit one copy of the uplink
    ///
    /// The session accounts for the uplink as soon as the radio accepts the
    /// first copy, so a lost TxDone never reuses the frame counter.
    fn transmit_uplink(
        &mut self,
        first: Option<&Uplink>,
        payload: &[u8],
        port: u8,
        confirmed: bool,
        fcnt: u32,
    ) -> Result<(Uplink, Channel, u64), Error<R::Error>> {
        self.scheduler.enter(State::TransmitGuard);
        let guarded = self.uplink_channel(first, payload, port, confirmed, fcnt);
        let (uplink, channel) = self.idle_on_error(guarded)?;

        debug!(
            "uplink FCnt {} on {} Hz DR {}",
            fcnt, channel.frequency, channel.dr
        );
        let repeat = first.is_some();
        let tx_end = self.scheduler.transmit(
            &mut self.mac,
            &mut self.clock,
            &uplink.frame,
            channel.dr,
            |mac| {
                if !repeat {
                    mac.uplink_sent(&uplink);
                }
            },
        )?;
        Ok((uplink, channel, tx_end))
    }

    /// Send `payload` on `port` and listen for a downlink
    ///
    /// Unconfirmed uplinks are repeated `NbTrans` times unless a downlink
    /// arrives; confirmed uplinks are repeated until acknowledged, after a
    /// random delay. Repetitions reuse the frame counter and skip the
    /// duty-cycle check.
    pub fn send(
        &mut self,
        payload: &[u8],
        port: u8,
        confirmed: bool,
    ) -> Result<SendOutcome<R::Error>, Error<R::Error>> {
        self.check_port(port)?;
        if !self.mac.session().is_active() {
            return Err(Error::NotActivated);
        }
        self.guard_duty_cycle()?;
        self.mac.adr_backoff();

        let fcnt = self.mac.session().counters.f_cnt_up;
        let repeats = self.mac.session().mac.nb_trans.clamp(1, 15);
        let mut outcome = SendOutcome {
            fcnt,
            downlink: None,
            acked: false,
            payload_sent: false,
            rejected: None,
        };

        let mut first: Option<Uplink> = None;
        for attempt in 0..repeats {
            if attempt > 0 {
                let delay = self.mac.phy.random_range(
                    self.settings.retransmit_delay_min_ms,
                    self.settings.retransmit_delay_max_ms,
                )?;
                debug!("repeat {} of FCnt {} in {} ms", attempt, fcnt, delay);
                self.clock.delay_ms(delay);
            }

            let (uplink, channel, tx_end) =
                self.transmit_uplink(first.as_ref(), payload, port, confirmed, fcnt)?;
            outcome.payload_sent = uplink.payload_sent;

            let rxc = self.mac.session().class == DeviceClass::C;
            let rx1_delay = self.mac.session().mac.rx1_delay_ms;
            let plan = WindowPlan {
                rx1: self.mac.plan().rx1(&channel),
                rx2: self.rx2(),
                rx1_delay_ms: rx1_delay,
                rx2_delay_ms: rx1_delay + RX2_OFFSET_MS,
            };
            let downlink = self.scheduler.class_a_windows(
                &mut self.mac,
                &mut self.clock,
                tx_end,
                &plan,
                self.settings.rx_guard_ms,
                rxc,
                &mut outcome.rejected,
                |mac, rx| mac.parse_downlink(&rx.frame, rx.window, rx.rssi, rx.snr),
            )?;

            if let Some(downlink) = downlink {
                outcome.acked = downlink.ack;
                outcome.downlink = Some(downlink);
            }
            let done = if uplink.confirmed {
                outcome.acked
            } else {
                outcome.downlink.is_some()
            };
            if done {
                break;
            }
            if uplink.confirmed {
                info!("FCnt {} not acknowledged", fcnt);
            }
            first = Some(uplink);
        }

        if self.mac.session().class == DeviceClass::C {
            self.scheduler.start_rxc(&mut self.mac)?;
        }
        Ok(outcome)
    }

    /// Wait up to `timeout_ms` for a Class C downlink
    pub fn receive(&mut self, timeout_ms: u32) -> Result<Option<Downlink>, Error<R::Error>> {
        if !self.mac.session().is_active() {
            return Err(Error::NotActivated);
        }
        if self.mac.session().class != DeviceClass::C {
            return Err(Error::InvalidClass);
        }
        let until = self.clock.now_ms() + timeout_ms as u64;
        let mut rejected = None;
        let downlink = self.scheduler.listen_rxc(
            &mut self.mac,
            &mut self.clock,
            until,
            &mut rejected,
            &mut |mac: &mut MacLayer<R>, rx: &Received| {
                mac.parse_downlink(&rx.frame, rx.window, rx.rssi, rx.snr)
            },
        )?;
        if downlink.is_some() {
            self.scheduler.start_rxc(&mut self.mac)?;
        }
        Ok(downlink)
    }

    /// Switch between Class A and Class C
    ///
    /// On LoRaWAN 1.1 the change is requested with DeviceModeInd and takes
    /// effect when the network confirms it.
    pub fn set_class(&mut self, class: DeviceClass) -> Result<(), Error<R::Error>> {
        if class == DeviceClass::B {
            return Err(Error::InvalidClass);
        }
        let session = self.mac.session_mut();
        if session.is_active() && session.revision == Revision::V1_1 {
            session.uplink_queue.remove(cid::DEVICE_MODE);
            if class != session.class {
                session
                    .uplink_queue
                    .push(cid::DEVICE_MODE, &[class.code()])?;
                info!("class {} requested", class.code());
            }
            return Ok(());
        }
        session.class = class;
        let active = session.is_active();
        match class {
            DeviceClass::C if active => self.scheduler.start_rxc(&mut self.mac)?,
            _ => self.scheduler.stop_rxc(&mut self.mac)?,
        }
        Ok(())
    }

    /// Device class in use
    pub fn class(&self) -> DeviceClass {
        self.mac.session().class
    }

    /// Listen for a multicast group in RxC
    pub fn start_multicast_session(&mut self, group: MulticastSession) -> Result<(), Error<R::Error>> {
        if group.fcnt_min > group.fcnt_max {
            return Err(Error::FCntOutOfRange);
        }
        self.mac.start_multicast(group);
        Ok(())
    }

    /// Stop listening for the multicast group
    pub fn stop_multicast_session(&mut self) {
        self.mac.stop_multicast();
    }

    /// Enable or disable adaptive data rate
    pub fn set_adr(&mut self, enabled: bool) {
        self.settings.adr_enabled = enabled;
        self.mac.session_mut().mac.adr_enabled = enabled;
    }

    /// Set the uplink data rate
    pub fn set_datarate(&mut self, dr: u8) -> Result<(), Error<R::Error>> {
        if self.mac.plan_mut().set_data_rate(dr) {
            Ok(())
        } else {
            Err(Error::InvalidDataRate(dr))
        }
    }

    /// Set the output power; must be one of the band's TXPower steps
    pub fn set_tx_power(&mut self, dbm: i8) -> Result<(), Error<R::Error>> {
        let band = self.mac.plan().band();
        let steps = band.tx_power_steps(dbm).ok_or(Error::InvalidTxPower(dbm))?;
        self.mac.session_mut().mac.tx_power_steps = steps;
        Ok(())
    }

    /// Enable the duty-cycle guard, optionally with a custom budget in ms
    /// of airtime per hour
    pub fn set_duty_cycle(&mut self, enabled: bool, ms_per_hour: Option<u32>) {
        self.settings.duty_cycle_enabled = enabled;
        self.settings.duty_cycle_ms_per_hour = ms_per_hour;
    }

    /// Configure carrier sensing
    pub fn set_csma(&mut self, csma: CsmaConfig) {
        self.settings.csma = csma;
    }

    /// Set the uplink dwell limit; 0 disables it
    pub fn set_dwell_time(&mut self, ms: u32) {
        self.mac.plan_mut().dwell_time_up_ms = ms;
    }

    /// Set the Rx2 data rate
    pub fn set_rx2_datarate(&mut self, dr: u8) -> Result<(), Error<R::Error>> {
        let plan = self.mac.plan_mut();
        if plan.band().data_rate(dr).is_none() {
            return Err(Error::InvalidDataRate(dr));
        }
        plan.rx2.dr = dr;
        Ok(())
    }

    /// Battery level for DevStatusAns: 0 external power, 1..=254, 255 unknown
    pub fn set_device_status(&mut self, battery_level: u8) {
        self.mac.session_mut().mac.battery_level = battery_level;
    }

    /// Queue LinkCheckReq or DeviceTimeReq for the next uplink
    pub fn send_mac_command_req(&mut self, id: u8) -> Result<(), Error<R::Error>> {
        self.mac.request_mac_command(id)
    }

    /// Last LinkCheckAns
    pub fn link_check_answer(&self) -> Option<LinkCheck> {
        self.mac.link_check_answer()
    }

    /// Last DeviceTimeAns
    pub fn device_time_answer(&self) -> Option<DeviceTime> {
        self.mac.device_time_answer()
    }

    /// Session address
    pub fn dev_addr(&self) -> DevAddr {
        self.mac.session().dev_addr
    }

    /// Counter of the next uplink
    pub fn f_cnt_up(&self) -> u32 {
        self.mac.session().counters.f_cnt_up
    }

    /// Last network downlink counter
    pub fn n_f_cnt_down(&self) -> Option<u32> {
        self.mac.session().counters.n_f_cnt_down
    }

    /// Last application downlink counter (LoRaWAN 1.1)
    pub fn a_f_cnt_down(&self) -> Option<u32> {
        self.mac.session().counters.a_f_cnt_down
    }

    /// Airtime of the last transmission
    pub fn last_time_on_air(&self) -> u32 {
        self.scheduler.last_time_on_air_ms()
    }

    /// Time until the duty-cycle budget allows the next uplink
    pub fn time_until_uplink(&mut self) -> u32 {
        let now = self.clock.now_ms();
        self.scheduler
            .duty_cycle()
            .wait_ms(now, self.duty_cycle_budget())
    }

    /// Largest payload the next uplink can carry
    pub fn max_payload_len(&self) -> usize {
        self.mac.max_payload_len()
    }

    /// Scheduler state
    pub fn state(&self) -> State {
        self.scheduler.state()
    }

    /// MAC layer, for inspection
    pub fn mac(&self) -> &MacLayer<R> {
        &self.mac
    }

    /// Signed nonces buffer
    pub fn export_nonces(&self) -> [u8; NONCES_BUF_LEN] {
        self.mac.export_nonces()
    }

    /// Load a nonces buffer
    pub fn restore_nonces(&mut self, buf: &[u8]) -> Result<(), Error<R::Error>> {
        self.mac.restore_nonces(buf)
    }

    /// Signed session buffer
    pub fn export_session(&self) -> [u8; SESSION_BUF_LEN] {
        self.mac.export_session()
    }

    /// Load a session buffer; confirm it with `join` or `activate_abp`
    pub fn restore_session(&mut self, buf: &[u8]) -> Result<(), Error<R::Error>> {
        self.mac.restore_session(buf)
    }

    /// Drop the session, keeping the nonces
    pub fn clear_session(&mut self) -> Result<(), Error<R::Error>> {
        self.scheduler.stop_rxc(&mut self.mac)?;
        self.mac.clear_session();
        Ok(())
    }

    /// Drop nonces and session
    pub fn clear_nonces(&mut self) -> Result<(), Error<R::Error>> {
        self.scheduler.stop_rxc(&mut self.mac)?;
        self.mac.clear_nonces();
        Ok(())
    }

    /// Forget everything learned from the network, including duty-cycle history
    pub fn wipe(&mut self) -> Result<(), Error<R::Error>> {
        self.clear_nonces()?;
        self.scheduler = Scheduler::new();
        info!("node wiped");
        Ok(())
    }

    /// Release the radio and the clock
    pub fn free(self) -> (R, C) {
        (self.mac.phy.radio, self.clock)
    }
}
