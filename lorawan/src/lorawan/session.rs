//! Session and identity store
//!
//! Holds the credentials, the negotiated session (keys, counters, MAC
//! parameters, pending MAC answers) and the join nonces, and converts them to
//! and from the two signed persistence buffers:
//!
//! - the nonces buffer (16 bytes), to be written after every join attempt so
//!   a DevNonce is never reused
//! - the session buffer, to be written after every uplink so the session
//!   survives power loss
//!
//! Both buffers end in a 16-bit XOR-fold signature over everything before it.
//! The session buffer embeds the nonces signature of the join it belongs to;
//! a later join invalidates it. Negotiated MAC state is stored in the wire
//! format of the command that set it and replayed through the same handler on
//! restore.

use super::channels::{ChannelPlan, FREQ_UNIT_HZ, NUM_DYNAMIC_CHANNELS};
use super::codec::{
    get_u16_le, get_u24_le, get_u32_le, get_uint_le, put_u16_le, put_u24_le, put_u32_le,
    put_uint_le,
};
use super::commands::{
    self, cid, MacContext, MacQueue, ADR_ACK_DELAY_EXP, ADR_ACK_LIMIT_EXP, MAX_DOWNLINK_QUEUE_LEN,
    MAX_MAC_QUEUE_LEN,
};
use crate::config::device::{
    AESKey, AbpCredentials, ActivationMode, DevAddr, DeviceClass, OtaaCredentials, Revision,
};
use crate::crypto::{checksum16, Direction};
use crate::error::Error;
use crate::radio::traits::Capabilities;

/// Layout version of both persistence buffers
pub const BUFFER_VERSION: u16 = 0x0001;

/// Size of the nonces buffer
pub const NONCES_BUF_LEN: usize = 16;

/// Size of the session buffer
pub const SESSION_BUF_LEN: usize = 304;

/// Default delay between the end of an uplink and Rx1
pub const RECEIVE_DELAY_1_MS: u32 = 1000;

/// Value stored for counters that have not been set
const COUNTER_NONE: u32 = 0xFFFF_FFFF;

/// Stored TxParamSetup byte when no command was accepted (RFU bits set)
const TX_PARAM_NONE: u8 = 0xFF;

/// Number of channel mask bytes in the session buffer
const MASK_LEN: usize = 12;

mod nonces_offset {
    pub const VERSION: usize = 0;
    pub const MODE: usize = 2;
    pub const PLAN: usize = 4;
    pub const SUB_BAND: usize = 5;
    pub const KEY_CHECKSUM: usize = 6;
    pub const DEV_NONCE: usize = 8;
    pub const JOIN_NONCE: usize = 10;
    pub const FLAGS: usize = 13;
    pub const SIGNATURE: usize = 14;
}

mod session_offset {
    pub const NWK_S_ENC_KEY: usize = 0;
    pub const APP_S_KEY: usize = 16;
    pub const F_NWK_S_INT_KEY: usize = 32;
    pub const S_NWK_S_INT_KEY: usize = 48;
    pub const DEV_ADDR: usize = 64;
    pub const NONCES_SIGNATURE: usize = 68;
    pub const F_CNT_UP: usize = 70;
    pub const N_F_CNT_DOWN: usize = 74;
    pub const A_F_CNT_DOWN: usize = 78;
    pub const CONF_F_CNT_UP: usize = 82;
    pub const CONF_F_CNT_DOWN: usize = 86;
    pub const ADR_F_CNT: usize = 90;
    pub const HOME_NET_ID: usize = 94;
    pub const VERSION: usize = 98;
    pub const CLASS: usize = 99;
    pub const LINK_ADR: usize = 100;
    pub const DUTY_CYCLE: usize = 116;
    pub const RX_PARAM_SETUP: usize = 117;
    pub const RX_TIMING_SETUP: usize = 121;
    pub const TX_PARAM_SETUP: usize = 122;
    pub const ADR_PARAM_SETUP: usize = 123;
    pub const REJOIN_PARAM_SETUP: usize = 124;
    pub const UL_CHANNELS: usize = 125;
    pub const DL_CHANNELS: usize = 205;
    pub const MAC_QUEUE_UL: usize = 269;
    pub const SIGNATURE: usize = 302;
}

const FLAG_SESSION_ACTIVE: u8 = 0x01;
const FLAG_JOIN_NONCE_VALID: u8 = 0x02;

const UL_CHANNEL_LEN: usize = 5;
const DL_CHANNEL_LEN: usize = 4;

/// Configured credentials
#[derive(Debug, Clone, Copy)]
pub enum Credentials {
    /// Nothing configured yet
    None,
    /// Over-the-air activation root keys
    Otaa(OtaaCredentials),
    /// Personalized session keys
    Abp(AbpCredentials),
}

impl Credentials {
    /// Activation mode of these credentials
    pub fn mode(&self) -> ActivationMode {
        match self {
            Credentials::None => ActivationMode::None,
            Credentials::Otaa(_) => ActivationMode::Otaa,
            Credentials::Abp(_) => ActivationMode::Abp,
        }
    }

    /// Protocol revision implied by the keys
    pub fn revision(&self) -> Revision {
        match self {
            Credentials::None => Revision::V1_0,
            Credentials::Otaa(c) => c.revision(),
            Credentials::Abp(c) => c.revision(),
        }
    }

    /// Checksum binding a persisted buffer to these keys
    pub fn key_checksum(&self) -> u16 {
        let key = |k: &AESKey| checksum16(k.as_bytes());
        match self {
            Credentials::None => 0,
            Credentials::Otaa(c) => {
                key(&c.app_key) ^ c.nwk_key.as_ref().map(key).unwrap_or(0)
            }
            Credentials::Abp(c) => {
                key(&c.nwk_s_enc_key)
                    ^ key(&c.app_s_key)
                    ^ c.f_nwk_s_int_key.as_ref().map(key).unwrap_or(0)
                    ^ c.s_nwk_s_int_key.as_ref().map(key).unwrap_or(0)
                    ^ checksum16(&c.dev_addr.to_le_bytes())
            }
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionStatus {
    /// No session
    None,
    /// Defaults populated, waiting for a join or ABP activation
    Activating,
    /// Restored from a buffer, waiting for `join` or `activate` to confirm it
    Pending,
    /// Usable for traffic
    Active,
}

/// Session keys
///
/// On LoRaWAN 1.0 the three network keys all hold NwkSKey.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionKeys {
    /// Network session encryption key
    pub nwk_s_enc: AESKey,
    /// Application session key
    pub app_s: AESKey,
    /// Forwarding network session integrity key
    pub f_nwk_s_int: AESKey,
    /// Serving network session integrity key
    pub s_nwk_s_int: AESKey,
}

/// Frame counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCounters {
    /// Next uplink counter
    pub f_cnt_up: u32,
    /// Last network downlink counter
    pub n_f_cnt_down: Option<u32>,
    /// Last application downlink counter
    pub a_f_cnt_down: Option<u32>,
    /// Counter of the outstanding confirmed uplink
    pub conf_f_cnt_up: Option<u32>,
    /// Counter of the confirmed downlink to acknowledge in the next uplink
    pub conf_f_cnt_down: Option<u32>,
    /// Uplink counter at the last downlink, base of the ADR backoff
    pub adr_f_cnt: u32,
}

/// MAC parameters negotiated with the network or set by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacParams {
    /// Adaptive data rate requested in uplinks
    pub adr_enabled: bool,
    /// TXPower index (0 = band maximum, each step -2 dB)
    pub tx_power_steps: u8,
    /// Transmissions per unconfirmed uplink
    pub nb_trans: u8,
    /// Aggregated duty-cycle exponent; 0 selects the band default
    pub duty_cycle_exp: u8,
    /// Delay between the end of an uplink and Rx1
    pub rx1_delay_ms: u32,
    /// ADR_ACK_LIMIT exponent
    pub adr_ack_limit_exp: u8,
    /// ADR_ACK_DELAY exponent
    pub adr_ack_delay_exp: u8,
    /// Last accepted TxParamSetupReq payload
    pub tx_param: Option<u8>,
    /// Last accepted RejoinParamSetupReq payload
    pub rejoin_param: u8,
    /// Battery level reported in DevStatusAns (0 external, 1-254, 255 unknown)
    pub battery_level: u8,
}

impl Default for MacParams {
    fn default() -> Self {
        Self {
            adr_enabled: true,
            tx_power_steps: 0,
            nb_trans: 1,
            duty_cycle_exp: 0,
            rx1_delay_ms: RECEIVE_DELAY_1_MS,
            adr_ack_limit_exp: ADR_ACK_LIMIT_EXP,
            adr_ack_delay_exp: ADR_ACK_DELAY_EXP,
            tx_param: None,
            rejoin_param: 0,
            battery_level: 255,
        }
    }
}

/// Join nonces and the activity flag covered by the nonces buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nonces {
    /// Last DevNonce used
    pub dev_nonce: u16,
    /// Last JoinNonce accepted
    pub join_nonce: Option<u32>,
    /// A session was established with these nonces
    pub session_active: bool,
}

impl Nonces {
    /// Serialize into the signed nonces buffer
    pub fn export(&self, creds: &Credentials, plan: &ChannelPlan) -> [u8; NONCES_BUF_LEN] {
        use nonces_offset::*;

        let mut buf = [0u8; NONCES_BUF_LEN];
        put_u16_le(&mut buf, VERSION, BUFFER_VERSION);
        put_u16_le(&mut buf, MODE, creds.mode().code());
        buf[PLAN] = plan.band().id;
        buf[SUB_BAND] = plan.sub_band();
        put_u16_le(&mut buf, KEY_CHECKSUM, creds.key_checksum());
        put_u16_le(&mut buf, DEV_NONCE, self.dev_nonce);
        put_u24_le(&mut buf, JOIN_NONCE, self.join_nonce.unwrap_or(0));

        let mut flags = 0;
        if self.session_active {
            flags |= FLAG_SESSION_ACTIVE;
        }
        if self.join_nonce.is_some() {
            flags |= FLAG_JOIN_NONCE_VALID;
        }
        buf[FLAGS] = flags;

        let signature = checksum16(&buf[..SIGNATURE]);
        put_u16_le(&mut buf, SIGNATURE, signature);
        buf
    }

    /// Signature of the nonces buffer this state exports to
    pub fn signature(&self, creds: &Credentials, plan: &ChannelPlan) -> u16 {
        get_u16_le(&self.export(creds, plan), nonces_offset::SIGNATURE)
    }

    /// Load a nonces buffer written for the same credentials and band
    pub fn restore<E>(
        &mut self,
        buf: &[u8],
        creds: &Credentials,
        plan: &ChannelPlan,
    ) -> Result<(), Error<E>> {
        use nonces_offset::*;

        if buf.len() != NONCES_BUF_LEN {
            return Err(Error::ChecksumMismatch);
        }
        if checksum16(&buf[..SIGNATURE]) != get_u16_le(buf, SIGNATURE) {
            warn!("nonces buffer signature mismatch");
            return Err(Error::ChecksumMismatch);
        }
        if get_u16_le(buf, VERSION) != BUFFER_VERSION
            || get_u16_le(buf, MODE) != creds.mode().code()
            || get_u16_le(buf, KEY_CHECKSUM) != creds.key_checksum()
            || buf[PLAN] != plan.band().id
            || buf[SUB_BAND] != plan.sub_band()
        {
            warn!("nonces buffer belongs to a different configuration");
            return Err(Error::ConfigurationMismatch);
        }

        let flags = buf[FLAGS];
        self.dev_nonce = get_u16_le(buf, DEV_NONCE);
        self.join_nonce = if flags & FLAG_JOIN_NONCE_VALID != 0 {
            Some(get_u24_le(buf, JOIN_NONCE))
        } else {
            None
        };
        self.session_active = flags & FLAG_SESSION_ACTIVE != 0;
        debug!("nonces restored, DevNonce {}", self.dev_nonce);
        Ok(())
    }
}

/// Session state
#[derive(Debug, Clone)]
pub struct Session {
    /// Lifecycle
    pub status: SessionStatus,
    /// Negotiated protocol revision
    pub revision: Revision,
    /// Device class in use
    pub class: DeviceClass,
    /// Device address
    pub dev_addr: DevAddr,
    /// NetID of the home network
    pub home_net_id: u32,
    /// Session keys
    pub keys: SessionKeys,
    /// Frame counters
    pub counters: FrameCounters,
    /// Negotiated MAC parameters
    pub mac: MacParams,
    /// MAC answers and indications waiting for an uplink
    pub uplink_queue: MacQueue<MAX_MAC_QUEUE_LEN>,
    /// Answers to user requests received from the network
    pub downlink_queue: MacQueue<MAX_DOWNLINK_QUEUE_LEN>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn put_counter(buf: &mut [u8], pos: usize, value: Option<u32>) {
    put_u32_le(buf, pos, value.unwrap_or(COUNTER_NONE));
}

fn get_counter(buf: &[u8], pos: usize) -> Option<u32> {
    match get_u32_le(buf, pos) {
        COUNTER_NONE => None,
        value => Some(value),
    }
}

fn get_key(buf: &[u8], pos: usize) -> AESKey {
    let mut key = [0u8; 16];
    key.copy_from_slice(&buf[pos..pos + 16]);
    AESKey::new(key)
}

impl Session {
    /// Empty session
    pub fn new() -> Self {
        Self {
            status: SessionStatus::None,
            revision: Revision::V1_0,
            class: DeviceClass::A,
            dev_addr: DevAddr::new(0),
            home_net_id: 0,
            keys: SessionKeys::default(),
            counters: FrameCounters::default(),
            mac: MacParams::default(),
            uplink_queue: MacQueue::new(Direction::Up),
            downlink_queue: MacQueue::new(Direction::Down),
        }
    }

    /// Whether the session can carry traffic
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Serialize into the signed session buffer
    pub fn export(&self, plan: &ChannelPlan, nonces_signature: u16) -> [u8; SESSION_BUF_LEN] {
        use session_offset::*;

        let mut buf = [0u8; SESSION_BUF_LEN];
        buf[NWK_S_ENC_KEY..NWK_S_ENC_KEY + 16].copy_from_slice(self.keys.nwk_s_enc.as_bytes());
        buf[APP_S_KEY..APP_S_KEY + 16].copy_from_slice(self.keys.app_s.as_bytes());
        buf[F_NWK_S_INT_KEY..F_NWK_S_INT_KEY + 16].copy_from_slice(self.keys.f_nwk_s_int.as_bytes());
        buf[S_NWK_S_INT_KEY..S_NWK_S_INT_KEY + 16].copy_from_slice(self.keys.s_nwk_s_int.as_bytes());
        put_u32_le(&mut buf, DEV_ADDR, self.dev_addr.value());
        put_u16_le(&mut buf, NONCES_SIGNATURE, nonces_signature);

        let c = &self.counters;
        put_u32_le(&mut buf, F_CNT_UP, c.f_cnt_up);
        put_counter(&mut buf, N_F_CNT_DOWN, c.n_f_cnt_down);
        put_counter(&mut buf, A_F_CNT_DOWN, c.a_f_cnt_down);
        put_counter(&mut buf, CONF_F_CNT_UP, c.conf_f_cnt_up);
        put_counter(&mut buf, CONF_F_CNT_DOWN, c.conf_f_cnt_down);
        put_u32_le(&mut buf, ADR_F_CNT, c.adr_f_cnt);
        put_u32_le(&mut buf, HOME_NET_ID, self.home_net_id);
        buf[VERSION] = self.revision.minor();
        buf[CLASS] = self.class.code();

        let m = &self.mac;
        buf[LINK_ADR] = plan.data_rate_up;
        buf[LINK_ADR + 1] = m.tx_power_steps;
        buf[LINK_ADR + 2] = m.nb_trans;
        buf[LINK_ADR + 3] = m.adr_enabled as u8;
        put_uint_le(&mut buf, LINK_ADR + 4, MASK_LEN, plan.mask());

        buf[DUTY_CYCLE] = m.duty_cycle_exp;
        buf[RX_PARAM_SETUP] = (plan.rx1_dr_offset << 4) | (plan.rx2.dr & 0x0F);
        put_u24_le(&mut buf, RX_PARAM_SETUP + 1, plan.rx2.frequency / FREQ_UNIT_HZ);
        buf[RX_TIMING_SETUP] = (m.rx1_delay_ms / 1000) as u8;
        buf[TX_PARAM_SETUP] = m.tx_param.unwrap_or(TX_PARAM_NONE);
        buf[ADR_PARAM_SETUP] = (m.adr_ack_limit_exp << 4) | (m.adr_ack_delay_exp & 0x0F);
        buf[REJOIN_PARAM_SETUP] = m.rejoin_param;

        if !plan.band().is_fixed() {
            for (i, ch) in plan.uplink_channels().iter().enumerate() {
                let pos = UL_CHANNELS + i * UL_CHANNEL_LEN;
                buf[pos] = i as u8;
                put_u24_le(&mut buf, pos + 1, ch.frequency / FREQ_UNIT_HZ);
                buf[pos + 4] = (ch.dr_max << 4) | (ch.dr_min & 0x0F);
            }
            for (i, ch) in plan.downlink_channels().iter().enumerate() {
                let pos = DL_CHANNELS + i * DL_CHANNEL_LEN;
                buf[pos] = i as u8;
                put_u24_le(&mut buf, pos + 1, ch.frequency / FREQ_UNIT_HZ);
            }
        }

        let queue = self.uplink_queue.as_bytes();
        buf[MAC_QUEUE_UL] = queue.len() as u8;
        buf[MAC_QUEUE_UL + 1..MAC_QUEUE_UL + 1 + queue.len()].copy_from_slice(queue);

        let signature = checksum16(&buf[..SIGNATURE]);
        put_u16_le(&mut buf, SIGNATURE, signature);
        buf
    }

    /// Load a session buffer
    ///
    /// The buffer must carry the signature of the current nonces. On success
    /// the session is `Pending` until the next `join` or `activate` call.
    /// Nothing changes when any check fails.
    pub fn restore<E>(
        &mut self,
        buf: &[u8],
        plan: &mut ChannelPlan,
        caps: &dyn Capabilities,
        nonces_signature: u16,
    ) -> Result<(), Error<E>> {
        use session_offset::*;

        if buf.len() != SESSION_BUF_LEN {
            return Err(Error::ChecksumMismatch);
        }
        if checksum16(&buf[..SIGNATURE]) != get_u16_le(buf, SIGNATURE) {
            warn!("session buffer signature mismatch");
            return Err(Error::ChecksumMismatch);
        }
        if self.is_active() {
            warn!("session already active, ignoring session buffer");
            return Ok(());
        }
        if get_u16_le(buf, NONCES_SIGNATURE) != nonces_signature {
            warn!("session buffer belongs to a different join");
            return Err(Error::SessionMismatch);
        }
        let revision = Revision::from_minor(buf[VERSION]).ok_or(Error::ConfigurationMismatch)?;
        let class = DeviceClass::from_code(buf[CLASS]).ok_or(Error::ConfigurationMismatch)?;
        let queue_len = buf[MAC_QUEUE_UL] as usize;
        if queue_len > MAX_MAC_QUEUE_LEN {
            return Err(Error::ChecksumMismatch);
        }

        let mut session = Session::new();
        session.revision = revision;
        session.class = class;
        session.keys = SessionKeys {
            nwk_s_enc: get_key(buf, NWK_S_ENC_KEY),
            app_s: get_key(buf, APP_S_KEY),
            f_nwk_s_int: get_key(buf, F_NWK_S_INT_KEY),
            s_nwk_s_int: get_key(buf, S_NWK_S_INT_KEY),
        };
        session.dev_addr = DevAddr::new(get_u32_le(buf, DEV_ADDR));
        session.home_net_id = get_u32_le(buf, HOME_NET_ID);
        session.counters = FrameCounters {
            f_cnt_up: get_u32_le(buf, F_CNT_UP),
            n_f_cnt_down: get_counter(buf, N_F_CNT_DOWN),
            a_f_cnt_down: get_counter(buf, A_F_CNT_DOWN),
            conf_f_cnt_up: get_counter(buf, CONF_F_CNT_UP),
            conf_f_cnt_down: get_counter(buf, CONF_F_CNT_DOWN),
            adr_f_cnt: get_u32_le(buf, ADR_F_CNT),
        };
        session.mac.battery_level = self.mac.battery_level;

        let mut new_plan = ChannelPlan::new(plan.band(), plan.sub_band());
        {
            let mut ctx = MacContext {
                session: &mut session,
                plan: &mut new_plan,
                caps,
                snr: 0,
            };

            if !ctx.plan.band().is_fixed() {
                // channels 0-2 are the band defaults and cannot be redefined
                for i in 3..NUM_DYNAMIC_CHANNELS {
                    let pos = UL_CHANNELS + i * UL_CHANNEL_LEN;
                    if get_u24_le(buf, pos + 1) != 0 {
                        commands::replay(&mut ctx, cid::NEW_CHANNEL, &buf[pos..pos + UL_CHANNEL_LEN]);
                    }
                }
                for i in 0..NUM_DYNAMIC_CHANNELS {
                    let pos = DL_CHANNELS + i * DL_CHANNEL_LEN;
                    let freq = get_u24_le(buf, pos + 1) * FREQ_UNIT_HZ;
                    let defined = ctx.plan.uplink_channels()[i].frequency;
                    if freq != 0 && defined != 0 && freq != defined {
                        commands::replay(&mut ctx, cid::DL_CHANNEL, &buf[pos..pos + DL_CHANNEL_LEN]);
                    }
                }
            }

            commands::replay(&mut ctx, cid::DUTY_CYCLE, &buf[DUTY_CYCLE..DUTY_CYCLE + 1]);
            commands::replay(&mut ctx, cid::RX_PARAM_SETUP, &buf[RX_PARAM_SETUP..RX_PARAM_SETUP + 4]);
            commands::replay(&mut ctx, cid::RX_TIMING_SETUP, &buf[RX_TIMING_SETUP..RX_TIMING_SETUP + 1]);
            if buf[TX_PARAM_SETUP] != TX_PARAM_NONE {
                commands::replay(&mut ctx, cid::TX_PARAM_SETUP, &buf[TX_PARAM_SETUP..TX_PARAM_SETUP + 1]);
            }
            commands::replay(&mut ctx, cid::ADR_PARAM_SETUP, &buf[ADR_PARAM_SETUP..ADR_PARAM_SETUP + 1]);
            commands::replay(
                &mut ctx,
                cid::REJOIN_PARAM_SETUP,
                &buf[REJOIN_PARAM_SETUP..REJOIN_PARAM_SETUP + 1],
            );

            let mask = get_uint_le(buf, LINK_ADR + 4, MASK_LEN);
            commands::apply_link_adr_state(
                &mut ctx,
                buf[LINK_ADR],
                buf[LINK_ADR + 1],
                buf[LINK_ADR + 2],
                mask,
            );
        }
        session.mac.adr_enabled = buf[LINK_ADR + 3] != 0;

        // answers produced by the replay are not part of the stored queue
        session.uplink_queue.clear();
        if !session
            .uplink_queue
            .load(&buf[MAC_QUEUE_UL + 1..MAC_QUEUE_UL + 1 + queue_len])
        {
            return Err(Error::ChecksumMismatch);
        }

        session.status = SessionStatus::Pending;
        *self = session;
        *plan = new_plan;
        info!("session restored, FCntUp {}", self.counters.f_cnt_up);
        Ok(())
    }
}
