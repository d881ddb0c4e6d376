//! Frame processor
//!
//! [`MacLayer`] owns the PHY, the channel plan and the session. It composes
//! join requests and data uplinks and validates join accepts and data
//! downlinks. A downlink only changes state after its MIC and frame counter
//! have been verified.

use heapless::Vec;

use super::channels::{ChannelPlan, CFLIST_LEN};
use super::codec::{get_u16_le, get_u24_le, get_u32_le, FCtrl, MType, MAJOR_R1};
use super::commands::{self, cid, DeviceTime, LinkCheck, MacContext, EIRP_TABLE, FOPTS_MAX_LEN};
use super::phy::{self, PhyLayer, FRAME_OVERHEAD};
use super::region::{Band, Channel};
use super::session::{
    Credentials, Nonces, Session, SessionKeys, SessionStatus, NONCES_BUF_LEN, SESSION_BUF_LEN,
};
use crate::class::Window;
use crate::config::device::{AESKey, DevAddr, OtaaCredentials, Revision};
use crate::crypto::{self, CounterId, Direction, KeyType, MIC_SIZE};
use crate::error::Error;
use crate::radio::traits::Radio;

/// Largest PHY payload
pub const MAX_FRAME_LEN: usize = 255;

/// Largest FRMPayload
pub const MAX_PAYLOAD_LEN: usize = 242;

/// Join request length
pub const JOIN_REQUEST_LEN: usize = 23;

/// Join accept length without CFList
pub const JOIN_ACCEPT_LEN: usize = 17;

/// Delay from the end of a join request to Rx1
pub const JOIN_ACCEPT_DELAY_1_MS: u32 = 5000;

/// Delay from the end of a join request to Rx2
pub const JOIN_ACCEPT_DELAY_2_MS: u32 = 6000;

/// JoinReqType in the 1.1 join accept MIC
const JOIN_REQUEST_TYPE: u8 = 0xFF;

/// MHDR, FHDR without FOpts, MIC
const MIN_DATA_FRAME_LEN: usize = 12;

/// Offset of FOpts in a data frame
const FOPTS_POS: usize = 8;

const DL_SETTINGS_OPT_NEG: u8 = 0x80;

/// PHY payload buffer
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// Composed data uplink
#[derive(Debug, Clone)]
pub struct Uplink {
    /// Wire bytes
    pub frame: Frame,
    /// 32-bit frame counter
    pub fcnt: u32,
    /// Confirmed data frame
    pub confirmed: bool,
    /// The application payload is in the frame; `false` when pending MAC
    /// commands had to be sent on port 0 instead
    pub payload_sent: bool,
    /// Queue bytes carried by the frame
    pub mac_len: usize,
    /// Confirmed downlink counter acknowledged by the frame, signed into the
    /// 1.1 MIC
    pub ack_f_cnt_down: u16,
}

/// Accepted downlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    /// Window the frame arrived in
    pub window: Window,
    /// FPort, `None` when the frame had none
    pub port: Option<u8>,
    /// Decrypted application payload; empty for port 0
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
    /// Confirmed data frame, acknowledged in the next uplink
    pub confirmed: bool,
    /// The frame acknowledged our confirmed uplink
    pub ack: bool,
    /// The network has more data pending
    pub f_pending: bool,
    /// 32-bit frame counter
    pub fcnt: u32,
    /// Received on the multicast address
    pub multicast: bool,
    /// RSSI in dBm
    pub rssi: i16,
    /// SNR in dB
    pub snr: i8,
}

/// Class C multicast group
#[derive(Debug, Clone, Copy)]
pub struct MulticastSession {
    /// Group address
    pub dev_addr: DevAddr,
    /// McAppSKey
    pub app_s_key: AESKey,
    /// McNwkSKey
    pub nwk_s_key: AESKey,
    /// Lowest accepted McFCnt
    pub fcnt_min: u32,
    /// Highest accepted McFCnt
    pub fcnt_max: u32,
    /// Last accepted McFCnt
    pub last_fcnt: Option<u32>,
}

/// 32-bit counter of a downlink from its 16-bit wire value and the last
/// accepted counter
pub fn infer_fcnt(prev: u32, fcnt16: u16) -> u32 {
    let low = prev & 0xFFFF;
    let candidate = (prev & 0xFFFF_0000) | fcnt16 as u32;
    if (fcnt16 as u32) < low {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}

fn extend<E>(frame: &mut Frame, bytes: &[u8]) -> Result<(), Error<E>> {
    frame
        .extend_from_slice(bytes)
        .map_err(|_| Error::PayloadTooLong(MAX_PAYLOAD_LEN))
}

/// MAC layer state
pub struct MacLayer<R: Radio> {
    /// PHY layer
    pub phy: PhyLayer<R>,
    plan: ChannelPlan,
    session: Session,
    nonces: Nonces,
    credentials: Credentials,
    multicast: Option<MulticastSession>,
}

impl<R: Radio> MacLayer<R> {
    /// Create a MAC layer for `band`
    pub fn new(radio: R, band: &'static Band, sub_band: u8) -> Self {
        Self {
            phy: PhyLayer::new(radio),
            plan: ChannelPlan::new(band, sub_band),
            session: Session::new(),
            nonces: Nonces::default(),
            credentials: Credentials::None,
            multicast: None,
        }
    }

    /// Channel plan
    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    /// Mutable channel plan
    pub fn plan_mut(&mut self) -> &mut ChannelPlan {
        &mut self.plan
    }

    /// Session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable session
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Join nonces
    pub fn nonces(&self) -> &Nonces {
        &self.nonces
    }

    /// Configured credentials
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Active multicast group
    pub fn multicast(&self) -> Option<&MulticastSession> {
        self.multicast.as_ref()
    }

    /// Replace the credentials, dropping nonces and session
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        self.nonces = Nonces::default();
        self.multicast = None;
        self.session = Session::new();
        self.plan = ChannelPlan::new(self.plan.band(), self.plan.sub_band());
    }

    /// Populate a fresh session with defaults
    pub fn create_session(&mut self, adr_enabled: bool) -> Result<(), Error<R::Error>> {
        if let Credentials::None = self.credentials {
            return Err(Error::NoSession);
        }
        let battery = self.session.mac.battery_level;
        self.session = Session::new();
        self.session.status = SessionStatus::Activating;
        self.session.revision = self.credentials.revision();
        self.session.mac.adr_enabled = adr_enabled;
        self.session.mac.battery_level = battery;
        self.plan = ChannelPlan::new(self.plan.band(), self.plan.sub_band());
        self.multicast = None;
        debug!("session created");
        Ok(())
    }

    /// Drop the session; the nonces stay valid
    pub fn clear_session(&mut self) {
        self.session = Session::new();
        self.nonces.session_active = false;
        self.multicast = None;
        self.plan = ChannelPlan::new(self.plan.band(), self.plan.sub_band());
    }

    /// Drop the nonces and with them any session
    pub fn clear_nonces(&mut self) {
        self.clear_session();
        self.nonces = Nonces::default();
    }

    /// Signed nonces buffer
    pub fn export_nonces(&self) -> [u8; NONCES_BUF_LEN] {
        self.nonces.export(&self.credentials, &self.plan)
    }

    /// Load a nonces buffer for the configured credentials
    pub fn restore_nonces(&mut self, buf: &[u8]) -> Result<(), Error<R::Error>> {
        if let Credentials::None = self.credentials {
            return Err(Error::NoSession);
        }
        if self.session.is_active() {
            warn!("session active, ignoring nonces buffer");
            return Ok(());
        }
        let mut nonces = Nonces::default();
        nonces.restore(buf, &self.credentials, &self.plan)?;
        self.nonces = nonces;
        Ok(())
    }

    /// Signed session buffer
    pub fn export_session(&self) -> [u8; SESSION_BUF_LEN] {
        let signature = self.nonces.signature(&self.credentials, &self.plan);
        self.session.export(&self.plan, signature)
    }

    /// Load a session buffer belonging to the restored nonces
    pub fn restore_session(&mut self, buf: &[u8]) -> Result<(), Error<R::Error>> {
        if let Credentials::None = self.credentials {
            return Err(Error::NoSession);
        }
        if !self.nonces.session_active && !self.session.is_active() {
            warn!("nonces carry no session");
            return Err(Error::SessionMismatch);
        }
        let signature = self.nonces.signature(&self.credentials, &self.plan);
        self.session
            .restore(buf, &mut self.plan, &self.phy.radio, signature)
    }

    /// Confirm a restored session
    pub fn confirm_session(&mut self) -> bool {
        if self.session.status == SessionStatus::Pending {
            self.session.status = SessionStatus::Active;
            info!("restored session in use, DevAddr {}", self.session.dev_addr.value());
            true
        } else {
            false
        }
    }

    /// Start an ABP session from the configured keys
    pub fn activate_abp(&mut self) -> Result<(), Error<R::Error>> {
        let creds = match self.credentials {
            Credentials::Abp(creds) => creds,
            Credentials::Otaa(_) => return Err(Error::Unsupported),
            Credentials::None => return Err(Error::NoSession),
        };
        if self.confirm_session() || self.session.is_active() {
            return Ok(());
        }
        if self.session.status != SessionStatus::Activating {
            let adr = self.session.mac.adr_enabled;
            self.create_session(adr)?;
        }

        let s = &mut self.session;
        s.revision = creds.revision();
        s.dev_addr = creds.dev_addr;
        s.keys = SessionKeys {
            nwk_s_enc: creds.nwk_s_enc_key,
            app_s: creds.app_s_key,
            f_nwk_s_int: creds.f_nwk_s_int_key.unwrap_or(creds.nwk_s_enc_key),
            s_nwk_s_int: creds.s_nwk_s_int_key.unwrap_or(creds.nwk_s_enc_key),
        };
        if s.revision == Revision::V1_1 && s.uplink_queue.push(cid::RESET, &[1]).is_err() {
            return Err(Error::QueueFull);
        }
        s.status = SessionStatus::Active;
        self.nonces.session_active = true;
        info!("ABP session active, DevAddr {}", creds.dev_addr.value());
        Ok(())
    }

    fn otaa_credentials(&self) -> Result<OtaaCredentials, Error<R::Error>> {
        match self.credentials {
            Credentials::Otaa(creds) => Ok(creds),
            Credentials::Abp(_) => Err(Error::Unsupported),
            Credentials::None => Err(Error::NoSession),
        }
    }

    /// Compose the next join request
    ///
    /// DevNonce is incremented before use; the nonces buffer must be saved
    /// after every attempt.
    pub fn compose_join_request(&mut self) -> Result<(Frame, u16), Error<R::Error>> {
        let creds = self.otaa_credentials()?;
        let dev_nonce = self
            .nonces
            .dev_nonce
            .checked_add(1)
            .ok_or(Error::NonceExhausted)?;
        self.nonces.dev_nonce = dev_nonce;
        self.nonces.session_active = false;

        let mut frame = Frame::new();
        extend(&mut frame, &[MType::JoinRequest.mhdr()])?;
        extend(&mut frame, &creds.join_eui.to_le_bytes())?;
        extend(&mut frame, &creds.dev_eui.to_le_bytes())?;
        extend(&mut frame, &dev_nonce.to_le_bytes())?;
        let root = creds.nwk_key.unwrap_or(creds.app_key);
        let mic = crypto::compute_mic(&root, &[&frame]);
        extend(&mut frame, &mic)?;

        debug!("join request, DevNonce {}", dev_nonce);
        Ok((frame, dev_nonce))
    }

    /// Validate a join accept and start the session it describes
    ///
    /// Nothing changes unless the MIC and JoinNonce are valid.
    pub fn process_join_accept(&mut self, data: &[u8], dev_nonce: u16) -> Result<(), Error<R::Error>> {
        let creds = self.otaa_credentials()?;
        let len = data.len();
        if len != JOIN_ACCEPT_LEN && len != JOIN_ACCEPT_LEN + CFLIST_LEN {
            return Err(Error::MalformedFrame);
        }
        if MType::from_mhdr(data[0]) != MType::JoinAccept {
            return Err(Error::MalformedFrame);
        }

        let root = creds.nwk_key.unwrap_or(creds.app_key);
        let mut buf = [0u8; JOIN_ACCEPT_LEN + CFLIST_LEN];
        buf[..len].copy_from_slice(data);
        crypto::decrypt_join_accept(&root, &mut buf[1..len]);
        let (msg, mic) = buf[..len].split_at(len - MIC_SIZE);

        let join_nonce = get_u24_le(msg, 1);
        let net_id = get_u24_le(msg, 4);
        let dev_addr = DevAddr::new(get_u32_le(msg, 7));
        let dl_settings = msg[11];
        let rx_delay = msg[12];

        let revision = match (dl_settings & DL_SETTINGS_OPT_NEG != 0, creds.nwk_key) {
            (true, Some(_)) => Revision::V1_1,
            (true, None) => {
                warn!("network negotiated 1.1 but only 1.0 keys are configured");
                return Err(Error::VersionMismatch);
            }
            (false, _) => Revision::V1_0,
        };

        let expected = match revision {
            Revision::V1_1 => {
                let js_int = crypto::derive_join_key(&root, KeyType::JSInt, creds.dev_eui);
                crypto::compute_mic(
                    &js_int,
                    &[
                        &[JOIN_REQUEST_TYPE],
                        &creds.join_eui.to_le_bytes(),
                        &dev_nonce.to_le_bytes(),
                        msg,
                    ],
                )
            }
            Revision::V1_0 => crypto::compute_mic(&root, &[msg]),
        };
        if expected != mic {
            warn!("join accept MIC mismatch");
            return Err(Error::InvalidMic);
        }

        if let Some(prev) = self.nonces.join_nonce {
            let replay = match revision {
                Revision::V1_1 => join_nonce <= prev,
                Revision::V1_0 => join_nonce == prev,
            };
            if replay {
                warn!("JoinNonce {} replayed, last {}", join_nonce, prev);
                return Err(Error::JoinNonceReplay);
            }
        }

        let keys = match revision {
            Revision::V1_1 => {
                let derive = |key: &AESKey, kind| {
                    crypto::derive_key_v1_1(key, kind, join_nonce, creds.join_eui, dev_nonce)
                };
                SessionKeys {
                    app_s: derive(&creds.app_key, KeyType::AppS),
                    f_nwk_s_int: derive(&root, KeyType::FNwkSInt),
                    s_nwk_s_int: derive(&root, KeyType::SNwkSInt),
                    nwk_s_enc: derive(&root, KeyType::NwkSEnc),
                }
            }
            Revision::V1_0 => {
                let nwk_s = crypto::derive_key_v1_0(&root, KeyType::FNwkSInt, join_nonce, net_id, dev_nonce);
                SessionKeys {
                    app_s: crypto::derive_key_v1_0(&root, KeyType::AppS, join_nonce, net_id, dev_nonce),
                    f_nwk_s_int: nwk_s,
                    s_nwk_s_int: nwk_s,
                    nwk_s_enc: nwk_s,
                }
            }
        };

        let mut plan = ChannelPlan::new(self.plan.band(), self.plan.sub_band());
        let band = plan.band();
        let rx1_offset = (dl_settings >> 4) & 0x07;
        let rx2_dr = dl_settings & 0x0F;
        if band.rx1_data_rate(band.join_data_rate(), rx1_offset).is_some() {
            plan.rx1_dr_offset = rx1_offset;
        } else {
            warn!("ignoring Rx1 offset {}", rx1_offset);
        }
        if band.data_rate(rx2_dr).is_some() {
            plan.rx2.dr = rx2_dr;
        } else {
            warn!("ignoring Rx2 data rate {}", rx2_dr);
        }
        if len > JOIN_ACCEPT_LEN {
            plan.apply_cflist(&msg[13..13 + CFLIST_LEN]);
        }

        let mut session = Session::new();
        session.status = SessionStatus::Active;
        session.revision = revision;
        session.dev_addr = dev_addr;
        session.home_net_id = net_id;
        session.keys = keys;
        session.mac.adr_enabled = self.session.mac.adr_enabled;
        session.mac.battery_level = self.session.mac.battery_level;
        session.mac.rx1_delay_ms = (rx_delay & 0x0F).max(1) as u32 * 1000;
        if revision == Revision::V1_1 {
            // empty queue always has room
            let _ = session.uplink_queue.push(cid::REKEY, &[revision.minor()]);
        }

        self.session = session;
        self.plan = plan;
        self.multicast = None;
        self.nonces.join_nonce = Some(join_nonce);
        self.nonces.session_active = true;
        info!(
            "joined, LoRaWAN 1.{} DevAddr {} NetID {}",
            revision.minor(),
            dev_addr.value(),
            net_id
        );
        Ok(())
    }

    fn adr_since(&self) -> u32 {
        let c = &self.session.counters;
        c.f_cnt_up.wrapping_sub(c.adr_f_cnt)
    }

    /// ADRAckReq bit of the next uplink
    pub fn adr_ack_req(&self) -> bool {
        let m = &self.session.mac;
        m.adr_enabled && self.adr_since() >= 1u32 << m.adr_ack_limit_exp.min(31)
    }

    fn dr_usable(&self, dr: u8) -> bool {
        let band = self.plan.band();
        let rate = match band.data_rate(dr) {
            Some(rate) => rate,
            None => return false,
        };
        if !self.plan.dr_supported(self.plan.mask(), dr) {
            return false;
        }
        let dwell = self.plan.dwell_time_up_ms;
        dwell == 0
            || phy::time_on_air_ms(rate, FRAME_OVERHEAD)
                .map(|toa| toa <= dwell)
                .unwrap_or(false)
    }

    /// Run one ADR backoff step when the uplink count since the last downlink
    /// calls for it: maximum power first, then a lower data rate, then the
    /// default channels.
    pub fn adr_backoff(&mut self) {
        let m = &self.session.mac;
        if !m.adr_enabled {
            return;
        }
        let limit = 1u32 << m.adr_ack_limit_exp.min(30);
        let delay = 1u32 << m.adr_ack_delay_exp.min(30);
        let since = self.adr_since();
        if since < limit.saturating_add(delay) || (since - limit) % delay != 0 {
            return;
        }

        if self.session.mac.tx_power_steps > 0 {
            self.session.mac.tx_power_steps = 0;
            info!("ADR backoff: maximum power");
            return;
        }
        let current = self.plan.data_rate_up;
        if let Some(dr) = (0..current).rev().find(|&dr| self.dr_usable(dr)) {
            self.plan.set_data_rate(dr);
            info!("ADR backoff: data rate {}", dr);
            return;
        }
        self.plan.enable_default_channels();
        info!("ADR backoff: default channels enabled");
    }

    /// Largest application payload at the current data rate
    pub fn max_payload_len(&self) -> usize {
        phy::max_payload_len(
            self.plan.band(),
            self.plan.data_rate_up,
            self.plan.dwell_time_up_ms,
            0,
        )
    }

    /// Pick the channel of the next data uplink
    pub fn select_uplink_channel(&mut self) -> Result<Channel, Error<R::Error>> {
        let phy = &mut self.phy;
        self.plan.select_uplink(|n| phy.random_below(n))
    }

    /// Pick the channel of a join request carrying `dev_nonce`
    pub fn select_join_channel(&mut self, dev_nonce: u16) -> Result<Channel, Error<R::Error>> {
        let phy = &mut self.phy;
        let join_nonce = self.nonces.join_nonce.unwrap_or(0);
        self.plan.select_join(dev_nonce, join_nonce, |n| phy.random_below(n))
    }

    /// Output power for data uplinks, capped by the network's max EIRP
    pub fn tx_power_dbm(&self) -> i8 {
        let band = self.plan.band();
        let m = &self.session.mac;
        let power = band.tx_power_dbm(m.tx_power_steps).unwrap_or(band.power_max);
        match m.tx_param {
            Some(p) => power.min(EIRP_TABLE[(p & 0x0F) as usize] as i8),
            None => power,
        }
    }

    /// Compose a data uplink on `channel` with frame counter `fcnt`
    ///
    /// Pending MAC answers go into FOpts when they fit alongside the payload;
    /// otherwise the frame carries them on port 0 instead of the payload.
    /// The session is not changed; see [`MacLayer::uplink_sent`].
    pub fn compose_uplink(
        &self,
        payload: &[u8],
        port: u8,
        confirmed: bool,
        fcnt: u32,
        channel: &Channel,
    ) -> Result<Uplink, Error<R::Error>> {
        let s = &self.session;
        if !s.is_active() {
            return Err(Error::NotActivated);
        }
        let band = self.plan.band();
        let dr = channel.dr;
        let dwell = self.plan.dwell_time_up_ms;
        let max = phy::max_payload_len(band, dr, dwell, 0);
        if payload.len() > max {
            let table = phy::max_payload_len(band, dr, 0, 0);
            if payload.len() <= table {
                return Err(Error::DwellTimeExceeded);
            }
            return Err(Error::PayloadTooLong(max));
        }

        let queue = s.uplink_queue.as_bytes();
        let piggyback = queue.len() <= FOPTS_MAX_LEN
            && payload.len() <= phy::max_payload_len(band, dr, dwell, queue.len());
        let (fopts, frm, port, mac_len) = if piggyback {
            (queue, payload, port, queue.len())
        } else {
            let len = s.uplink_queue.prefix_len(max);
            warn!("{} bytes of MAC commands sent on port 0", len);
            (&[][..], &queue[..len], 0, len)
        };
        let confirmed = confirmed && piggyback;

        let ack = s.counters.conf_f_cnt_down.is_some();
        let fctrl = FCtrl {
            adr: s.mac.adr_enabled,
            adr_ack_req: self.adr_ack_req(),
            ack,
            f_pending: false,
            f_opts_len: fopts.len() as u8,
        };
        let mtype = if confirmed {
            MType::ConfirmedDataUp
        } else {
            MType::UnconfirmedDataUp
        };

        let mut frame = Frame::new();
        extend(&mut frame, &[mtype.mhdr()])?;
        extend(&mut frame, &s.dev_addr.to_le_bytes())?;
        extend(&mut frame, &[fctrl.to_byte()])?;
        extend(&mut frame, &(fcnt as u16).to_le_bytes())?;

        let mut opts = [0u8; FOPTS_MAX_LEN];
        let opts = &mut opts[..fopts.len()];
        opts.copy_from_slice(fopts);
        if s.revision == Revision::V1_1 {
            crypto::ctr_transform(
                &s.keys.nwk_s_enc,
                CounterId::NetworkFOpts,
                Direction::Up,
                s.dev_addr,
                fcnt,
                opts,
            );
        }
        extend(&mut frame, opts)?;

        if !frm.is_empty() || piggyback {
            extend(&mut frame, &[port])?;
            let start = frame.len();
            extend(&mut frame, frm)?;
            let key = if port == 0 { &s.keys.nwk_s_enc } else { &s.keys.app_s };
            crypto::encrypt_payload(key, s.dev_addr, fcnt, Direction::Up, &mut frame[start..]);
        }

        extend(&mut frame, &[0; MIC_SIZE])?;

        let mut uplink = Uplink {
            frame,
            fcnt,
            confirmed,
            payload_sent: piggyback,
            mac_len,
            ack_f_cnt_down: s.counters.conf_f_cnt_down.unwrap_or(0) as u16,
        };
        self.sign_uplink(&mut uplink, channel);
        trace!("uplink FCnt {} len {}", fcnt, uplink.frame.len());
        Ok(uplink)
    }

    /// Compute the MIC of `uplink` for transmission on `channel`
    ///
    /// Repetitions of a frame keep its content; only the 1.1 MIC covers the
    /// channel and data rate.
    pub fn sign_uplink(&self, uplink: &mut Uplink, channel: &Channel) {
        let s = &self.session;
        let len = uplink.frame.len() - MIC_SIZE;
        let (msg, mic) = uplink.frame.split_at_mut(len);
        let msg = &*msg;
        let b0 = crypto::mic_block_b0(Direction::Up, s.dev_addr, uplink.fcnt, 0, len);
        let mic_f = crypto::compute_mic(&s.keys.f_nwk_s_int, &[&b0, msg]);
        let signed = match s.revision {
            Revision::V1_0 => mic_f,
            Revision::V1_1 => {
                let b1 = crypto::mic_block_b1(
                    s.dev_addr,
                    uplink.fcnt,
                    uplink.ack_f_cnt_down,
                    channel.dr,
                    channel.idx,
                    len,
                );
                let mic_s = crypto::compute_mic(&s.keys.s_nwk_s_int, &[&b1, msg]);
                crypto::pack_mic_v1_1(&mic_s, &mic_f)
            }
        };
        mic.copy_from_slice(&signed);
    }

    /// Account for `uplink` once the radio has accepted its first copy
    pub fn uplink_sent(&mut self, uplink: &Uplink) {
        let s = &mut self.session;
        s.counters.f_cnt_up = s.counters.f_cnt_up.wrapping_add(1);
        s.counters.conf_f_cnt_down = None;
        if uplink.confirmed {
            s.counters.conf_f_cnt_up = Some(uplink.fcnt);
        }
        s.uplink_queue.remove_sent(uplink.mac_len);
    }

    /// Validate and apply a data downlink received in `window`
    pub fn parse_downlink(
        &mut self,
        frame: &[u8],
        window: Window,
        rssi: i16,
        snr: i8,
    ) -> Result<Downlink, Error<R::Error>> {
        let len = frame.len();
        if !(MIN_DATA_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) || frame[0] & 0x03 != MAJOR_R1 {
            return Err(Error::MalformedFrame);
        }
        let confirmed = match MType::from_mhdr(frame[0]) {
            MType::UnconfirmedDataDown => false,
            MType::ConfirmedDataDown => true,
            _ => return Err(Error::MalformedFrame),
        };
        let dev_addr = DevAddr::new(get_u32_le(frame, 1));
        let fctrl = FCtrl::from_byte(frame[5]);
        let fcnt16 = get_u16_le(frame, 6);
        let fopts_end = FOPTS_POS + fctrl.f_opts_len as usize;
        let mic_pos = len - MIC_SIZE;
        if fopts_end > mic_pos {
            return Err(Error::MalformedFrame);
        }
        let port = if mic_pos > fopts_end {
            Some(frame[fopts_end])
        } else {
            None
        };
        let frm_start = fopts_end + port.is_some() as usize;
        let has_fopts = fctrl.f_opts_len > 0;

        let multicast = match self.multicast {
            Some(mc) if window == Window::RxC && mc.dev_addr == dev_addr => Some(mc),
            _ => None,
        };
        if multicast.is_none() {
            if !self.session.is_active() {
                return Err(Error::NotActivated);
            }
            if dev_addr != self.session.dev_addr {
                debug!("downlink for DevAddr {} ignored", dev_addr.value());
                return Err(Error::MalformedFrame);
            }
        }
        if has_fopts && port == Some(0) {
            warn!("FOpts together with port 0");
            return Err(Error::MalformedFrame);
        }
        if window == Window::RxC && (has_fopts || port == Some(0)) {
            warn!("MAC commands outside a Class A window");
            return Err(Error::MalformedFrame);
        }

        if let Some(mut mc) = multicast {
            if confirmed {
                return Err(Error::MalformedFrame);
            }
            let fcnt = match mc.last_fcnt {
                Some(prev) => infer_fcnt(prev, fcnt16),
                None => {
                    let candidate = (mc.fcnt_min & 0xFFFF_0000) | fcnt16 as u32;
                    if candidate < mc.fcnt_min {
                        candidate.wrapping_add(0x1_0000)
                    } else {
                        candidate
                    }
                }
            };
            let b0 = crypto::mic_block_b0(Direction::Down, dev_addr, fcnt, 0, mic_pos);
            if crypto::compute_mic(&mc.nwk_s_key, &[&b0, &frame[..mic_pos]]) != frame[mic_pos..] {
                warn!("multicast MIC mismatch");
                return Err(Error::InvalidMic);
            }
            if mc.last_fcnt == Some(fcnt) {
                return Err(Error::FCntReplay);
            }
            if fcnt < mc.fcnt_min || fcnt > mc.fcnt_max {
                warn!("multicast FCnt {} out of range", fcnt);
                return Err(Error::FCntOutOfRange);
            }

            let mut payload = Vec::new();
            if port.is_some() {
                extend_payload(&mut payload, &frame[frm_start..mic_pos])?;
                crypto::encrypt_payload(&mc.app_s_key, dev_addr, fcnt, Direction::Down, &mut payload);
            }
            mc.last_fcnt = Some(fcnt);
            self.multicast = Some(mc);
            debug!("multicast downlink FCnt {}", fcnt);
            return Ok(Downlink {
                window,
                port,
                payload,
                confirmed: false,
                ack: false,
                f_pending: fctrl.f_pending,
                fcnt,
                multicast: true,
                rssi,
                snr,
            });
        }

        let s = &self.session;
        let app_counter = s.revision == Revision::V1_1 && port.map(|p| p > 0).unwrap_or(false);
        let prev = if app_counter {
            s.counters.a_f_cnt_down
        } else {
            s.counters.n_f_cnt_down
        };
        let fcnt = match prev {
            Some(prev) => infer_fcnt(prev, fcnt16),
            None => fcnt16 as u32,
        };

        let conf = if s.revision == Revision::V1_1 && fctrl.ack {
            s.counters.conf_f_cnt_up.unwrap_or(0) as u16
        } else {
            0
        };
        let b0 = crypto::mic_block_b0(Direction::Down, dev_addr, fcnt, conf, mic_pos);
        if crypto::compute_mic(&s.keys.s_nwk_s_int, &[&b0, &frame[..mic_pos]]) != frame[mic_pos..] {
            warn!("downlink MIC mismatch, FCnt {}", fcnt);
            return Err(Error::InvalidMic);
        }
        if prev == Some(fcnt) {
            warn!("downlink FCnt {} replayed", fcnt);
            return Err(Error::FCntReplay);
        }

        let mut payload = Vec::new();
        if port.is_some() {
            extend_payload(&mut payload, &frame[frm_start..mic_pos])?;
        }
        let mut opts = [0u8; FOPTS_MAX_LEN];
        let opts = &mut opts[..fctrl.f_opts_len as usize];
        opts.copy_from_slice(&frame[FOPTS_POS..fopts_end]);

        let s = &mut self.session;
        if app_counter {
            s.counters.a_f_cnt_down = Some(fcnt);
        } else {
            s.counters.n_f_cnt_down = Some(fcnt);
        }
        s.counters.adr_f_cnt = s.counters.f_cnt_up;
        if confirmed {
            s.counters.conf_f_cnt_down = Some(fcnt);
        }
        let ack = fctrl.ack && s.counters.conf_f_cnt_up.take().is_some();
        s.uplink_queue.on_downlink();

        if s.revision == Revision::V1_1 && !opts.is_empty() {
            let ctr = if app_counter {
                CounterId::AppFOpts
            } else {
                CounterId::NetworkFOpts
            };
            crypto::ctr_transform(&s.keys.nwk_s_enc, ctr, Direction::Down, dev_addr, fcnt, opts);
        }
        match port {
            Some(0) => {
                crypto::encrypt_payload(&s.keys.nwk_s_enc, dev_addr, fcnt, Direction::Down, &mut payload)
            }
            Some(_) => crypto::encrypt_payload(&s.keys.app_s, dev_addr, fcnt, Direction::Down, &mut payload),
            None => {}
        }

        let mut ctx = MacContext {
            session: &mut self.session,
            plan: &mut self.plan,
            caps: &self.phy.radio,
            snr,
        };
        if !opts.is_empty() {
            commands::process_commands(&mut ctx, opts);
        }
        if port == Some(0) {
            commands::process_commands(&mut ctx, &payload);
            payload.clear();
        }

        debug!("downlink FCnt {} port {} ack {}", fcnt, port.unwrap_or(0), ack);
        Ok(Downlink {
            window,
            port,
            payload,
            confirmed,
            ack,
            f_pending: fctrl.f_pending,
            fcnt,
            multicast: false,
            rssi,
            snr,
        })
    }

    /// Queue a LinkCheckReq or DeviceTimeReq for the next uplink
    pub fn request_mac_command(&mut self, id: u8) -> Result<(), Error<R::Error>> {
        match commands::find(id) {
            Some(spec) if spec.user && spec.len_up == 0 && id != cid::PROPRIETARY => {}
            _ => return Err(Error::InvalidMacCommand(id)),
        }
        let s = &mut self.session;
        if s.uplink_queue.contains(id) {
            return Ok(());
        }
        s.downlink_queue.remove(id);
        s.uplink_queue.push(id, &[])?;
        Ok(())
    }

    /// Last LinkCheckAns
    pub fn link_check_answer(&self) -> Option<LinkCheck> {
        self.session
            .downlink_queue
            .get(cid::LINK_CHECK)
            .and_then(LinkCheck::from_payload)
    }

    /// Last DeviceTimeAns
    pub fn device_time_answer(&self) -> Option<DeviceTime> {
        self.session
            .downlink_queue
            .get(cid::DEVICE_TIME)
            .and_then(DeviceTime::from_payload)
    }

    /// Start listening for a multicast group
    pub fn start_multicast(&mut self, group: MulticastSession) {
        info!("multicast group {} started", group.dev_addr.value());
        self.multicast = Some(group);
    }

    /// Stop listening for the multicast group
    pub fn stop_multicast(&mut self) {
        self.multicast = None;
    }
}

fn extend_payload<E>(payload: &mut Vec<u8, MAX_PAYLOAD_LEN>, bytes: &[u8]) -> Result<(), Error<E>> {
    payload
        .extend_from_slice(bytes)
        .map_err(|_| Error::MalformedFrame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::AbpCredentials;
    use crate::lorawan::region::{DataRate, EU868};
    use crate::radio::traits::{Capabilities, PacketParams, RadioEvent};

    struct NullRadio;

    impl Capabilities for NullRadio {
        fn clip_output_power(&self, dbm: i8) -> i8 {
            dbm.min(20)
        }

        fn supports_frequency(&self, _hz: u32) -> bool {
            true
        }
    }

    impl Radio for NullRadio {
        type Error = ();

        fn set_frequency(&mut self, _hz: u32) -> Result<(), ()> {
            Ok(())
        }
        fn set_data_rate(&mut self, _dr: &DataRate) -> Result<(), ()> {
            Ok(())
        }
        fn set_output_power(&mut self, _dbm: i8) -> Result<(), ()> {
            Ok(())
        }
        fn set_packet_params(&mut self, _params: &PacketParams) -> Result<(), ()> {
            Ok(())
        }
        fn start_transmit(&mut self, _data: &[u8]) -> Result<(), ()> {
            Ok(())
        }
        fn start_receive(&mut self, _timeout_ms: Option<u32>) -> Result<(), ()> {
            Ok(())
        }
        fn start_channel_activity_detection(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn poll_event(&mut self) -> nb::Result<RadioEvent, ()> {
            Err(nb::Error::WouldBlock)
        }
        fn read_packet(&mut self, _buffer: &mut [u8]) -> Result<usize, ()> {
            Ok(0)
        }
        fn random_byte(&mut self) -> Result<u8, ()> {
            Ok(0)
        }
        fn last_snr(&mut self) -> i8 {
            0
        }
        fn last_rssi(&mut self) -> i16 {
            0
        }
        fn standby(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn sleep(&mut self) -> Result<(), ()> {
            Ok(())
        }
    }

    const ADDR: DevAddr = DevAddr::new(0x2601_1F2E);
    const NWK: AESKey = AESKey::new([0x11; 16]);
    const APP: AESKey = AESKey::new([0x22; 16]);

    fn abp_v1_0() -> MacLayer<NullRadio> {
        let mut mac = MacLayer::new(NullRadio, &EU868, 0);
        mac.set_credentials(Credentials::Abp(AbpCredentials::new_v1_0(ADDR, NWK, APP)));
        mac.activate_abp().unwrap();
        mac
    }

    fn channel(mac: &MacLayer<NullRadio>) -> Channel {
        mac.plan().channel(0).unwrap()
    }

    /// Downlink as a network server would build it
    fn downlink(fcnt: u32, fctrl: u8, fopts: &[u8], port: Option<u8>, plain: &[u8]) -> Frame {
        let mut f = Frame::new();
        f.push(MType::UnconfirmedDataDown.mhdr()).unwrap();
        f.extend_from_slice(&ADDR.to_le_bytes()).unwrap();
        f.push(fctrl | fopts.len() as u8).unwrap();
        f.extend_from_slice(&(fcnt as u16).to_le_bytes()).unwrap();
        f.extend_from_slice(fopts).unwrap();
        if let Some(port) = port {
            f.push(port).unwrap();
            let start = f.len();
            f.extend_from_slice(plain).unwrap();
            let key = if port == 0 { &NWK } else { &APP };
            crypto::encrypt_payload(key, ADDR, fcnt, Direction::Down, &mut f[start..]);
        }
        let b0 = crypto::mic_block_b0(Direction::Down, ADDR, fcnt, 0, f.len());
        let mic = crypto::compute_mic(&NWK, &[&b0, &f]);
        f.extend_from_slice(&mic).unwrap();
        f
    }

    #[test]
    fn test_infer_fcnt_rollover() {
        assert_eq!(infer_fcnt(5, 6), 6);
        assert_eq!(infer_fcnt(0xFFFF, 0), 0x1_0000);
        assert_eq!(infer_fcnt(0x1_0005, 0x0004), 0x2_0004);
        assert_eq!(infer_fcnt(0x1_0005, 0x0005), 0x1_0005);
    }

    #[test]
    fn test_uplink_layout_and_mic() {
        let mac = abp_v1_0();
        let ch = channel(&mac);
        let up = mac.compose_uplink(b"hi", 10, false, 7, &ch).unwrap();
        let f = &up.frame;
        assert_eq!(f.len(), FRAME_OVERHEAD + 2);
        assert_eq!(f[0], 0x40);
        assert_eq!(&f[1..5], &ADDR.to_le_bytes());
        assert_eq!(f[5], 0x80);
        assert_eq!(&f[6..8], &[7, 0]);
        assert_eq!(f[8], 10);

        let mut plain = [f[9], f[10]];
        crypto::encrypt_payload(&APP, ADDR, 7, Direction::Up, &mut plain);
        assert_eq!(&plain, b"hi");

        let n = f.len() - MIC_SIZE;
        let b0 = crypto::mic_block_b0(Direction::Up, ADDR, 7, 0, n);
        assert_eq!(crypto::compute_mic(&NWK, &[&b0, &f[..n]]), f[n..]);
    }

    #[test]
    fn test_fopts_piggyback_and_port_zero() {
        let mut mac = abp_v1_0();
        assert!(mac.plan_mut().set_data_rate(3));
        let ch = channel(&mac);
        mac.session_mut().uplink_queue.push(cid::DEV_STATUS, &[255, 3]).unwrap();
        let up = mac.compose_uplink(b"x", 1, false, 0, &ch).unwrap();
        assert!(up.payload_sent);
        assert_eq!(up.frame[5] & 0x0F, 3);
        assert_eq!(&up.frame[8..11], &[0x06, 255, 3]);
        mac.uplink_sent(&up);
        assert!(mac.session().uplink_queue.is_empty());

        // payload at the DR3 limit leaves no room for FOpts
        let mut mac = abp_v1_0();
        assert!(mac.plan_mut().set_data_rate(3));
        mac.session_mut().uplink_queue.push(cid::DEV_STATUS, &[255, 3]).unwrap();
        let big = [0u8; 115];
        let up = mac.compose_uplink(&big, 1, true, 0, &ch).unwrap();
        assert!(!up.payload_sent);
        assert!(!up.confirmed);
        assert_eq!(up.frame[5] & 0x0F, 0);
        assert_eq!(up.frame[8], 0);
        assert_eq!(up.frame.len(), FRAME_OVERHEAD + 3);
    }

    #[test]
    fn test_payload_too_long() {
        let mut mac = abp_v1_0();
        assert!(mac.plan_mut().set_data_rate(3));
        let ch = channel(&mac);
        let big = [0u8; 116];
        assert_eq!(
            mac.compose_uplink(&big, 1, false, 0, &ch).unwrap_err(),
            Error::PayloadTooLong(115)
        );
    }

    #[test]
    fn test_dwell_time_exceeded() {
        let mut mac = abp_v1_0();
        mac.plan_mut().dwell_time_up_ms = 400;
        let mut ch = channel(&mac);
        // SF12 needs more than 400 ms for any frame
        ch.dr = 0;
        assert_eq!(
            mac.compose_uplink(b"x", 1, false, 0, &ch).unwrap_err(),
            Error::DwellTimeExceeded
        );
        assert_eq!(
            mac.compose_uplink(&[0u8; 250], 1, false, 0, &ch).unwrap_err(),
            Error::PayloadTooLong(0)
        );
    }

    #[test]
    fn test_downlink_accepted_and_decrypted() {
        let mut mac = abp_v1_0();
        let f = downlink(3, 0x00, &[], Some(5), b"hello");
        let dl = mac.parse_downlink(&f, Window::Rx1, -40, 7).unwrap();
        assert_eq!(dl.port, Some(5));
        assert_eq!(&dl.payload[..], b"hello");
        assert_eq!(mac.session().counters.n_f_cnt_down, Some(3));

        // same counter again
        assert_eq!(
            mac.parse_downlink(&f, Window::Rx1, -40, 7),
            Err(Error::FCntReplay)
        );
    }

    #[test]
    fn test_bad_mic_leaves_state_unchanged() {
        let mut mac = abp_v1_0();
        mac.session_mut().uplink_queue.push(cid::RX_TIMING_SETUP, &[]).unwrap();
        let mut f = downlink(1, 0x00, &[0x04, 0x03], None, &[]);
        let last = f.len() - 1;
        f[last] ^= 1;
        let before = mac.session().counters;
        assert_eq!(mac.parse_downlink(&f, Window::Rx1, 0, 0), Err(Error::InvalidMic));
        assert_eq!(mac.session().counters, before);
        assert_eq!(mac.session().mac.duty_cycle_exp, 0);
        assert!(mac.session().uplink_queue.contains(cid::RX_TIMING_SETUP));
    }

    #[test]
    fn test_mac_commands_in_fopts_and_port_zero() {
        let mut mac = abp_v1_0();
        let f = downlink(1, 0x00, &[0x04, 0x03], None, &[]);
        mac.parse_downlink(&f, Window::Rx1, 0, 0).unwrap();
        assert_eq!(mac.session().mac.duty_cycle_exp, 3);

        let f = downlink(2, 0x00, &[], Some(0), &[0x04, 0x05]);
        let dl = mac.parse_downlink(&f, Window::Rx2, 0, 0).unwrap();
        assert!(dl.payload.is_empty());
        assert_eq!(mac.session().mac.duty_cycle_exp, 5);

        let f = downlink(3, 0x00, &[0x04, 0x01], Some(0), &[0x04, 0x05]);
        assert_eq!(mac.parse_downlink(&f, Window::Rx1, 0, 0), Err(Error::MalformedFrame));

        let f = downlink(4, 0x00, &[0x04, 0x01], Some(1), &[]);
        assert_eq!(mac.parse_downlink(&f, Window::RxC, 0, 0), Err(Error::MalformedFrame));
    }

    #[test]
    fn test_ack_clears_confirmed_uplink() {
        let mut mac = abp_v1_0();
        let ch = channel(&mac);
        let up = mac.compose_uplink(b"c", 1, true, 0, &ch).unwrap();
        assert_eq!(up.frame[0], 0x80);
        mac.uplink_sent(&up);
        assert_eq!(mac.session().counters.conf_f_cnt_up, Some(0));
        assert_eq!(mac.session().counters.f_cnt_up, 1);

        let f = downlink(1, 0x20, &[], None, &[]);
        let dl = mac.parse_downlink(&f, Window::Rx1, 0, 0).unwrap();
        assert!(dl.ack);
        assert_eq!(mac.session().counters.conf_f_cnt_up, None);
    }

    #[test]
    fn test_adr_backoff_order() {
        let mut mac = abp_v1_0();
        mac.plan_mut().set_data_rate(2);
        mac.session_mut().mac.tx_power_steps = 3;
        mac.session_mut().mac.adr_ack_limit_exp = 2;
        mac.session_mut().mac.adr_ack_delay_exp = 1;

        mac.session_mut().counters.f_cnt_up = 4;
        assert!(mac.adr_ack_req());
        mac.adr_backoff();
        assert_eq!(mac.session().mac.tx_power_steps, 3);

        mac.session_mut().counters.f_cnt_up = 6;
        mac.adr_backoff();
        assert_eq!(mac.session().mac.tx_power_steps, 0);
        assert_eq!(mac.plan().data_rate_up, 2);

        mac.session_mut().counters.f_cnt_up = 7;
        mac.adr_backoff();
        assert_eq!(mac.plan().data_rate_up, 2);

        for (fcnt, dr) in [(8, 1), (10, 0)] {
            mac.session_mut().counters.f_cnt_up = fcnt;
            mac.adr_backoff();
            assert_eq!(mac.plan().data_rate_up, dr);
        }

        mac.plan_mut().set_uplink_channel(3, 867_100_000, 0, 5);
        assert!(mac.plan_mut().set_mask(0b1000));
        mac.session_mut().counters.f_cnt_up = 12;
        mac.adr_backoff();
        assert_eq!(mac.plan().mask(), 0b1111);
    }

    #[test]
    fn test_user_mac_requests() {
        let mut mac = abp_v1_0();
        mac.request_mac_command(cid::LINK_CHECK).unwrap();
        mac.request_mac_command(cid::LINK_CHECK).unwrap();
        assert_eq!(mac.session().uplink_queue.as_bytes(), &[0x02]);
        assert_eq!(
            mac.request_mac_command(cid::LINK_ADR),
            Err(Error::InvalidMacCommand(cid::LINK_ADR))
        );

        let f = downlink(1, 0x00, &[0x02, 9, 2], None, &[]);
        mac.parse_downlink(&f, Window::Rx1, 0, 0).unwrap();
        let lc = mac.link_check_answer().unwrap();
        assert_eq!((lc.margin, lc.gateway_count), (9, 2));
    }
}
