//! MAC command engine
//!
//! Commands are dispatched through a static descriptor table keyed by CID.
//! Each entry knows the payload length per direction, how long the uplink
//! answer stays queued, whether the downlink payload is kept for the
//! application, and the handler that applies the request to the session and
//! channel plan. A handler returns the answer to queue, if any.
//!
//! Contiguous LinkADRReq instances form one block: their channel masks are
//! merged in order and the result is applied atomically together with the data
//! rate, power and NbTrans of the last instance.

use heapless::Vec;

use super::channels::{ChannelPlan, FREQ_UNIT_HZ, NUM_DYNAMIC_CHANNELS};
use super::codec::{get_u16_le, get_u24_le, get_u32_le};
use super::region::{DR_UNUSED, DWELL_TIME_MS};
use super::session::Session;
use crate::config::device::DeviceClass;
use crate::crypto::Direction;
use crate::error::Error;
use crate::radio::traits::Capabilities;

/// Command identifiers
pub mod cid {
    /// ResetInd / ResetConf
    pub const RESET: u8 = 0x01;
    /// LinkCheckReq / LinkCheckAns
    pub const LINK_CHECK: u8 = 0x02;
    /// LinkADRReq / LinkADRAns
    pub const LINK_ADR: u8 = 0x03;
    /// DutyCycleReq / DutyCycleAns
    pub const DUTY_CYCLE: u8 = 0x04;
    /// RXParamSetupReq / RXParamSetupAns
    pub const RX_PARAM_SETUP: u8 = 0x05;
    /// DevStatusReq / DevStatusAns
    pub const DEV_STATUS: u8 = 0x06;
    /// NewChannelReq / NewChannelAns
    pub const NEW_CHANNEL: u8 = 0x07;
    /// RXTimingSetupReq / RXTimingSetupAns
    pub const RX_TIMING_SETUP: u8 = 0x08;
    /// TxParamSetupReq / TxParamSetupAns
    pub const TX_PARAM_SETUP: u8 = 0x09;
    /// DlChannelReq / DlChannelAns
    pub const DL_CHANNEL: u8 = 0x0A;
    /// RekeyInd / RekeyConf
    pub const REKEY: u8 = 0x0B;
    /// ADRParamSetupReq / ADRParamSetupAns
    pub const ADR_PARAM_SETUP: u8 = 0x0C;
    /// DeviceTimeReq / DeviceTimeAns
    pub const DEVICE_TIME: u8 = 0x0D;
    /// ForceRejoinReq
    pub const FORCE_REJOIN: u8 = 0x0E;
    /// RejoinParamSetupReq / RejoinParamSetupAns
    pub const REJOIN_PARAM_SETUP: u8 = 0x0F;
    /// DeviceModeInd / DeviceModeConf
    pub const DEVICE_MODE: u8 = 0x20;
    /// Proprietary command
    pub const PROPRIETARY: u8 = 0x80;
}

/// Maximum FOpts length
pub const FOPTS_MAX_LEN: usize = 15;

/// Capacity of the uplink MAC queue
pub const MAX_MAC_QUEUE_LEN: usize = 32;

/// Capacity of the queue of answers kept for the application
pub const MAX_DOWNLINK_QUEUE_LEN: usize = 15;

/// Longest uplink answer payload
pub const MAX_ANSWER_LEN: usize = 4;

/// Default ADR_ACK_LIMIT exponent (64 uplinks)
pub const ADR_ACK_LIMIT_EXP: u8 = 6;

/// Default ADR_ACK_DELAY exponent (32 uplinks)
pub const ADR_ACK_DELAY_EXP: u8 = 5;

/// Max EIRP in dBm per TxParamSetupReq index
pub const EIRP_TABLE: [u8; 16] = [8, 10, 12, 13, 14, 16, 18, 20, 21, 24, 26, 27, 29, 30, 33, 36];

/// Duty-cycle reference period
pub const DUTY_CYCLE_PERIOD_MS: u32 = 3_600_000;

const LINK_ADR_LEN: usize = 4;

/// How long a queued uplink answer is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Persistence {
    /// Sent in the next uplink only
    Once,
    /// Repeated in every uplink until any downlink arrives
    UntilDownlink,
    /// Repeated until the matching confirmation command arrives
    UntilConfirmed,
}

/// State a handler may read and change
pub struct MacContext<'a> {
    /// Session being updated
    pub session: &'a mut Session,
    /// Channel plan being updated
    pub plan: &'a mut ChannelPlan,
    /// Radio limits
    pub caps: &'a dyn Capabilities,
    /// SNR of the downlink that carried the commands
    pub snr: i8,
}

/// Uplink answer produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAnswer {
    /// Command identifier
    pub cid: u8,
    /// Answer payload
    pub payload: Vec<u8, MAX_ANSWER_LEN>,
}

impl MacAnswer {
    fn new(cid: u8, payload: &[u8]) -> Self {
        let mut buf = Vec::new();
        // answer payloads never exceed MAX_ANSWER_LEN
        let _ = buf.extend_from_slice(payload);
        Self { cid, payload: buf }
    }
}

/// Command handler
pub type Handler = fn(&mut MacContext<'_>, &[u8]) -> Option<MacAnswer>;

/// Descriptor of one MAC command
pub struct MacCommandSpec {
    /// Command identifier
    pub cid: u8,
    /// Payload length of the downlink form
    pub len_dn: u8,
    /// Payload length of the uplink form
    pub len_up: u8,
    /// Lifetime of the uplink form in the queue
    pub persistence: Persistence,
    /// Downlink payload is kept for the application, uplink form may be
    /// requested by it
    pub user: bool,
    /// Applies the downlink form
    pub handler: Handler,
}

impl MacCommandSpec {
    /// Payload length in direction `dir`
    pub fn len(&self, dir: Direction) -> usize {
        match dir {
            Direction::Up => self.len_up as usize,
            Direction::Down => self.len_dn as usize,
        }
    }
}

const fn spec(
    cid: u8,
    len_dn: u8,
    len_up: u8,
    persistence: Persistence,
    user: bool,
    handler: Handler,
) -> MacCommandSpec {
    MacCommandSpec {
        cid,
        len_dn,
        len_up,
        persistence,
        user,
        handler,
    }
}

/// Descriptor table
pub static MAC_COMMANDS: [MacCommandSpec; 17] = [
    spec(cid::RESET, 1, 1, Persistence::UntilConfirmed, false, reset_conf),
    spec(cid::LINK_CHECK, 2, 0, Persistence::Once, true, link_check_ans),
    spec(cid::LINK_ADR, 4, 1, Persistence::Once, false, link_adr),
    spec(cid::DUTY_CYCLE, 1, 0, Persistence::Once, false, duty_cycle),
    spec(cid::RX_PARAM_SETUP, 4, 1, Persistence::UntilDownlink, false, rx_param_setup),
    spec(cid::DEV_STATUS, 0, 2, Persistence::Once, false, dev_status),
    spec(cid::NEW_CHANNEL, 5, 1, Persistence::Once, false, new_channel),
    spec(cid::RX_TIMING_SETUP, 1, 0, Persistence::UntilDownlink, false, rx_timing_setup),
    spec(cid::TX_PARAM_SETUP, 1, 0, Persistence::Once, false, tx_param_setup),
    spec(cid::DL_CHANNEL, 4, 1, Persistence::UntilDownlink, false, dl_channel),
    spec(cid::REKEY, 1, 1, Persistence::UntilConfirmed, false, rekey_conf),
    spec(cid::ADR_PARAM_SETUP, 1, 0, Persistence::Once, false, adr_param_setup),
    spec(cid::DEVICE_TIME, 5, 0, Persistence::Once, true, device_time_ans),
    spec(cid::FORCE_REJOIN, 2, 0, Persistence::Once, false, force_rejoin),
    spec(cid::REJOIN_PARAM_SETUP, 1, 1, Persistence::Once, false, rejoin_param_setup),
    spec(cid::DEVICE_MODE, 1, 1, Persistence::UntilConfirmed, false, device_mode_conf),
    spec(cid::PROPRIETARY, 5, 0, Persistence::Once, true, proprietary),
];

/// Look up the descriptor of `cid`
pub fn find(cid: u8) -> Option<&'static MacCommandSpec> {
    MAC_COMMANDS.iter().find(|c| c.cid == cid)
}

/// Rejected queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No room left
    Full,
    /// CID has no descriptor
    UnknownCommand(u8),
    /// Payload length differs from the descriptor for the queue's direction
    InvalidLength(u8),
}

impl<E> From<QueueError> for Error<E> {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full => Error::QueueFull,
            QueueError::UnknownCommand(cid) | QueueError::InvalidLength(cid) => {
                Error::InvalidMacCommand(cid)
            }
        }
    }
}

/// Byte queue of `CID | payload` records
///
/// Record lengths follow the descriptor table for the queue's direction, so
/// the queue is stored exactly as it goes on the wire.
#[derive(Debug, Clone)]
pub struct MacQueue<const N: usize> {
    dir: Direction,
    buf: Vec<u8, N>,
}

/// Iterator over the records of a [`MacQueue`]
pub struct Records<'a> {
    dir: Direction,
    buf: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&cid, rest) = self.buf.split_first()?;
        let len = find(cid)?.len(self.dir);
        if rest.len() < len {
            return None;
        }
        let (payload, tail) = rest.split_at(len);
        self.buf = tail;
        Some((cid, payload))
    }
}

impl<const N: usize> MacQueue<N> {
    /// Empty queue for direction `dir`
    pub fn new(dir: Direction) -> Self {
        Self {
            dir,
            buf: Vec::new(),
        }
    }

    /// Queued bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Drop all records
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Iterate over `(cid, payload)` records
    pub fn records(&self) -> Records<'_> {
        Records {
            dir: self.dir,
            buf: &self.buf,
        }
    }

    /// Whether a record for `cid` is queued
    pub fn contains(&self, cid: u8) -> bool {
        self.records().any(|(c, _)| c == cid)
    }

    /// Payload of the first record for `cid`
    pub fn get(&self, cid: u8) -> Option<&[u8]> {
        self.records().find(|(c, _)| *c == cid).map(|(_, p)| p)
    }

    /// Append a record
    pub fn push(&mut self, cid: u8, payload: &[u8]) -> Result<(), QueueError> {
        let spec = find(cid).ok_or(QueueError::UnknownCommand(cid))?;
        if spec.len(self.dir) != payload.len() {
            return Err(QueueError::InvalidLength(cid));
        }
        if self.buf.len() + 1 + payload.len() > N {
            return Err(QueueError::Full);
        }
        // capacity checked above
        let _ = self.buf.push(cid);
        let _ = self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Replace any record for `cid`, otherwise append
    pub fn replace(&mut self, cid: u8, payload: &[u8]) -> Result<(), QueueError> {
        self.remove(cid);
        self.push(cid, payload)
    }

    /// Remove every record for `cid`
    pub fn remove(&mut self, cid: u8) {
        self.retain(|c| c != cid);
    }

    /// Keep only records whose CID satisfies `keep`
    pub fn retain<F: FnMut(u8) -> bool>(&mut self, mut keep: F) {
        let mut kept: Vec<u8, N> = Vec::new();
        for (cid, payload) in self.records() {
            if keep(cid) {
                let _ = kept.push(cid);
                let _ = kept.extend_from_slice(payload);
            }
        }
        self.buf = kept;
    }

    /// Number of leading bytes that hold whole records and fit in `max`
    pub fn prefix_len(&self, max: usize) -> usize {
        let mut len = 0;
        for (_, payload) in self.records() {
            if len + 1 + payload.len() > max {
                break;
            }
            len += 1 + payload.len();
        }
        len
    }

    /// Drop the `Once` records among the first `len` bytes after they were
    /// transmitted
    pub fn remove_sent(&mut self, len: usize) {
        let mut kept: Vec<u8, N> = Vec::new();
        let mut offset = 0;
        for (cid, payload) in self.records() {
            let sent = offset < len;
            offset += 1 + payload.len();
            let once = find(cid).map(|s| s.persistence == Persistence::Once).unwrap_or(true);
            if !(sent && once) {
                let _ = kept.push(cid);
                let _ = kept.extend_from_slice(payload);
            }
        }
        self.buf = kept;
    }

    /// Drop records that only wait for a downlink
    pub fn on_downlink(&mut self) {
        self.retain(|cid| {
            find(cid)
                .map(|s| s.persistence == Persistence::UntilConfirmed)
                .unwrap_or(false)
        });
    }

    /// Replace the content with `bytes` if they form valid records
    pub fn load(&mut self, bytes: &[u8]) -> bool {
        let walked: usize = Records {
            dir: self.dir,
            buf: bytes,
        }
        .map(|(_, p)| 1 + p.len())
        .sum();
        if walked != bytes.len() || bytes.len() > N {
            return false;
        }
        self.buf.clear();
        let _ = self.buf.extend_from_slice(bytes);
        true
    }
}

/// Apply the MAC commands of a downlink
///
/// Answers are queued for the next uplink. Parsing stops at the first unknown
/// or truncated command.
pub fn process_commands(ctx: &mut MacContext<'_>, mut data: &[u8]) {
    while let Some(&id) = data.first() {
        let spec = match find(id) {
            Some(spec) => spec,
            None => {
                warn!("unknown MAC command {}, dropping the rest", id);
                return;
            }
        };

        if id == cid::LINK_ADR {
            let mut end = 0;
            while end + 1 + LINK_ADR_LEN <= data.len() && data[end] == cid::LINK_ADR {
                end += 1 + LINK_ADR_LEN;
            }
            if end == 0 {
                warn!("truncated LinkADRReq");
                return;
            }
            let status = link_adr_block(ctx, &data[..end]);
            for _ in 0..end / (1 + LINK_ADR_LEN) {
                if ctx.session.uplink_queue.push(cid::LINK_ADR, &[status]).is_err() {
                    warn!("MAC queue full, LinkADRAns dropped");
                    break;
                }
            }
            data = &data[end..];
            continue;
        }

        let len = spec.len_dn as usize;
        if data.len() < 1 + len {
            warn!("truncated MAC command {}", id);
            return;
        }
        debug!("MAC command {}", id);
        if let Some(answer) = (spec.handler)(ctx, &data[1..1 + len]) {
            queue_answer(ctx, &answer);
        }
        data = &data[1 + len..];
    }
}

/// Run a handler without queuing its answer
///
/// Used to restore negotiated state from its persisted wire form.
pub fn replay(ctx: &mut MacContext<'_>, id: u8, payload: &[u8]) {
    if let Some(spec) = find(id) {
        if payload.len() == spec.len_dn as usize {
            let _ = (spec.handler)(ctx, payload);
        }
    }
}

fn queue_answer(ctx: &mut MacContext<'_>, answer: &MacAnswer) {
    if ctx
        .session
        .uplink_queue
        .replace(answer.cid, &answer.payload)
        .is_err()
    {
        warn!("MAC queue full, answer {} dropped", answer.cid);
    }
}

/// Apply persisted LinkADR state: data rate, TXPower index, NbTrans and mask
pub fn apply_link_adr_state(ctx: &mut MacContext<'_>, dr: u8, power: u8, nb_trans: u8, mask: u128) {
    if !ctx.plan.set_mask(mask) {
        warn!("stored channel mask rejected");
    }
    if !ctx.plan.set_data_rate(dr) {
        warn!("stored data rate {} rejected", dr);
    }
    if ctx.plan.band().tx_power_dbm(power).is_some() {
        ctx.session.mac.tx_power_steps = power;
    }
    ctx.session.mac.nb_trans = nb_trans.max(1);
}

fn ok(flag: bool, bit: u8) -> u8 {
    (flag as u8) << bit
}

fn link_adr(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let mut block = [0u8; 1 + LINK_ADR_LEN];
    block[0] = cid::LINK_ADR;
    block[1..].copy_from_slice(payload);
    let status = link_adr_block(ctx, &block);
    Some(MacAnswer::new(cid::LINK_ADR, &[status]))
}

/// Evaluate a block of contiguous LinkADRReq (`CID | payload` each) and apply
/// it if every part can be honored. Returns the LinkADRAns status byte.
fn link_adr_block(ctx: &mut MacContext<'_>, block: &[u8]) -> u8 {
    let plan = &*ctx.plan;
    let band = plan.band();

    let mut mask = plan.mask();
    let mut mask_ok = true;
    let mut last = [0u8; LINK_ADR_LEN];
    for req in block.chunks_exact(1 + LINK_ADR_LEN) {
        let p = &req[1..];
        let ch_mask = get_u16_le(p, 1);
        let cntl = (p[3] >> 4) & 0x07;
        match plan.ch_mask_control(mask, cntl, ch_mask) {
            Some(m) => mask = m,
            None => mask_ok = false,
        }
        last.copy_from_slice(p);
    }
    mask_ok &= plan.mask_valid(mask);

    let dr_req = last[0] >> 4;
    let power_req = last[0] & 0x0F;
    let nb_trans = last[3] & 0x0F;

    let mut dr = plan.data_rate_up;
    let mut power = ctx.session.mac.tx_power_steps;
    let (dr_ok, power_ok) = if ctx.session.mac.adr_enabled {
        if dr_req != 0x0F {
            dr = dr_req;
        }
        if power_req != 0x0F {
            power = power_req;
        }
        let check_mask = if mask_ok { mask } else { plan.mask() };
        let dr_ok = plan.dr_supported(check_mask, dr);
        let power_ok = match band.tx_power_dbm(power) {
            Some(dbm) => ctx.caps.clip_output_power(dbm) <= dbm,
            None => false,
        };
        (dr_ok, power_ok)
    } else {
        (true, true)
    };

    debug!(
        "LinkADRReq: dr {} power {} nbTrans {} ok {} {} {}",
        dr, power, nb_trans, mask_ok, dr_ok, power_ok
    );

    if mask_ok && dr_ok && power_ok {
        ctx.plan.set_mask(mask);
        ctx.plan.set_data_rate(dr);
        ctx.session.mac.tx_power_steps = power;
        ctx.session.mac.nb_trans = nb_trans.max(1);
    } else {
        warn!("LinkADRReq rejected");
    }

    ok(power_ok, 2) | ok(dr_ok, 1) | ok(mask_ok, 0)
}

fn reset_conf(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let minor = payload[0] & 0x0F;
    info!("ResetConf, server version 1.{}", minor);
    if minor == ctx.session.revision.minor() {
        ctx.session.uplink_queue.remove(cid::RESET);
    }
    None
}

fn rekey_conf(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let minor = payload[0] & 0x0F;
    info!("RekeyConf, server version 1.{}", minor);
    if minor > 0 && minor <= ctx.session.revision.minor() {
        ctx.session.uplink_queue.remove(cid::REKEY);
    }
    None
}

fn device_mode_conf(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    match DeviceClass::from_code(payload[0]) {
        Some(class) => {
            info!("DeviceModeConf, class {}", payload[0]);
            ctx.session.class = class;
            ctx.session.uplink_queue.remove(cid::DEVICE_MODE);
        }
        None => warn!("DeviceModeConf with unknown class {}", payload[0]),
    }
    None
}

fn store_user_answer(ctx: &mut MacContext<'_>, id: u8, payload: &[u8]) {
    if ctx.session.downlink_queue.replace(id, payload).is_err() {
        warn!("answer queue full, {} dropped", id);
    }
}

fn link_check_ans(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    store_user_answer(ctx, cid::LINK_CHECK, payload);
    None
}

fn device_time_ans(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    store_user_answer(ctx, cid::DEVICE_TIME, payload);
    None
}

fn proprietary(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    store_user_answer(ctx, cid::PROPRIETARY, payload);
    None
}

fn duty_cycle(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let exp = payload[0] & 0x0F;
    debug!("max duty cycle 1/2^{}", exp);
    ctx.session.mac.duty_cycle_exp = exp;
    Some(MacAnswer::new(cid::DUTY_CYCLE, &[]))
}

fn rx_param_setup(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let band = ctx.plan.band();
    let offset = (payload[0] >> 4) & 0x07;
    let rx2_dr = payload[0] & 0x0F;
    let freq = get_u24_le(payload, 1) * FREQ_UNIT_HZ;

    let offset_ok = band.rx1_dr_table[0][offset as usize] != DR_UNUSED;
    let dr_ok = band.data_rate(rx2_dr).is_some();
    let freq_ok = band.frequency_valid(freq) && ctx.caps.supports_frequency(freq);

    if offset_ok && dr_ok && freq_ok {
        ctx.plan.rx1_dr_offset = offset;
        ctx.plan.rx2.dr = rx2_dr;
        ctx.plan.rx2.frequency = freq;
    }
    let status = ok(offset_ok, 2) | ok(dr_ok, 1) | ok(freq_ok, 0);
    Some(MacAnswer::new(cid::RX_PARAM_SETUP, &[status]))
}

fn dev_status(ctx: &mut MacContext<'_>, _payload: &[u8]) -> Option<MacAnswer> {
    let margin = ctx.snr.clamp(-32, 31) as u8 & 0x3F;
    Some(MacAnswer::new(
        cid::DEV_STATUS,
        &[ctx.session.mac.battery_level, margin],
    ))
}

fn new_channel(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let band = ctx.plan.band();
    if band.is_fixed() {
        debug!("NewChannelReq ignored on fixed band");
        return None;
    }
    let idx = payload[0];
    let freq = get_u24_le(payload, 1) * FREQ_UNIT_HZ;
    let dr_max = payload[4] >> 4;
    let dr_min = payload[4] & 0x0F;

    let idx_ok = (3..NUM_DYNAMIC_CHANNELS as u8).contains(&idx);
    let freq_ok =
        idx_ok && (freq == 0 || (band.frequency_valid(freq) && ctx.caps.supports_frequency(freq)));
    let dr_ok = idx_ok
        && (freq == 0
            || (dr_min <= dr_max
                && band.data_rate(dr_min).is_some()
                && band.data_rate(dr_max).is_some()));

    if freq_ok && dr_ok {
        ctx.plan.set_uplink_channel(idx, freq, dr_min, dr_max);
    }
    Some(MacAnswer::new(
        cid::NEW_CHANNEL,
        &[ok(dr_ok, 1) | ok(freq_ok, 0)],
    ))
}

fn rx_timing_setup(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let delay = (payload[0] & 0x0F).max(1);
    ctx.session.mac.rx1_delay_ms = delay as u32 * 1000;
    Some(MacAnswer::new(cid::RX_TIMING_SETUP, &[]))
}

fn tx_param_setup(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    if !ctx.plan.band().tx_param_supported {
        debug!("TxParamSetupReq not supported in this band");
        return None;
    }
    let p = payload[0];
    ctx.plan.dwell_time_dn_ms = if p & 0x20 != 0 { DWELL_TIME_MS } else { 0 };
    ctx.plan.dwell_time_up_ms = if p & 0x10 != 0 { DWELL_TIME_MS } else { 0 };
    ctx.session.mac.tx_param = Some(p);
    debug!("max EIRP {} dBm", EIRP_TABLE[(p & 0x0F) as usize]);
    Some(MacAnswer::new(cid::TX_PARAM_SETUP, &[]))
}

fn dl_channel(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let band = ctx.plan.band();
    if band.is_fixed() {
        debug!("DlChannelReq ignored on fixed band");
        return None;
    }
    let idx = payload[0];
    let freq = get_u24_le(payload, 1) * FREQ_UNIT_HZ;
    let freq_ok = band.frequency_valid(freq) && ctx.caps.supports_frequency(freq);
    let ul_exists = ctx
        .plan
        .uplink_channels()
        .get(idx as usize)
        .map(|c| c.frequency != 0)
        .unwrap_or(false);
    if freq_ok && ul_exists {
        ctx.plan.set_downlink_frequency(idx, freq);
    }
    Some(MacAnswer::new(
        cid::DL_CHANNEL,
        &[ok(ul_exists, 1) | ok(freq_ok, 0)],
    ))
}

fn adr_param_setup(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    ctx.session.mac.adr_ack_limit_exp = payload[0] >> 4;
    ctx.session.mac.adr_ack_delay_exp = payload[0] & 0x0F;
    Some(MacAnswer::new(cid::ADR_PARAM_SETUP, &[]))
}

fn force_rejoin(_ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    let req = get_u16_le(payload, 0);
    warn!(
        "ForceRejoinReq (period {}, retries {}, type {}, dr {}) not supported",
        (req >> 11) & 0x07,
        (req >> 8) & 0x07,
        (req >> 4) & 0x07,
        req & 0x0F
    );
    None
}

fn rejoin_param_setup(ctx: &mut MacContext<'_>, payload: &[u8]) -> Option<MacAnswer> {
    ctx.session.mac.rejoin_param = payload[0];
    // time-based rejoin is not supported: TimeOK = 0
    Some(MacAnswer::new(cid::REJOIN_PARAM_SETUP, &[0x00]))
}

/// LinkCheckAns content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkCheck {
    /// Demodulation margin in dB
    pub margin: u8,
    /// Number of gateways that received the request
    pub gateway_count: u8,
}

impl LinkCheck {
    /// Decode a LinkCheckAns payload
    pub fn from_payload(p: &[u8]) -> Option<Self> {
        match p {
            [margin, gateway_count] => Some(Self {
                margin: *margin,
                gateway_count: *gateway_count,
            }),
            _ => None,
        }
    }
}

/// Seconds between the Unix and GPS epochs
pub const GPS_EPOCH_OFFSET: u32 = 315_964_800;

/// Leap seconds between GPS time and UTC
pub const GPS_LEAP_SECONDS: u32 = 18;

/// DeviceTimeAns content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceTime {
    /// Seconds since the GPS epoch
    pub gps_seconds: u32,
    /// Fractional second in 1/256 s
    pub fraction: u8,
}

impl DeviceTime {
    /// Decode a DeviceTimeAns payload
    pub fn from_payload(p: &[u8]) -> Option<Self> {
        if p.len() != 5 {
            return None;
        }
        Some(Self {
            gps_seconds: get_u32_le(p, 0),
            fraction: p[4],
        })
    }

    /// Seconds since the Unix epoch (UTC)
    pub fn unix_seconds(&self) -> u32 {
        self.gps_seconds
            .wrapping_add(GPS_EPOCH_OFFSET)
            .wrapping_sub(GPS_LEAP_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::region::{EU868, US915};
    use crate::lorawan::session::SessionStatus;

    struct Caps {
        max_dbm: i8,
    }

    impl Capabilities for Caps {
        fn clip_output_power(&self, dbm: i8) -> i8 {
            dbm.min(self.max_dbm)
        }

        fn supports_frequency(&self, hz: u32) -> bool {
            hz != 868_900_000
        }
    }

    const CAPS: Caps = Caps { max_dbm: 22 };

    fn setup(band: &'static crate::lorawan::region::Band) -> (Session, ChannelPlan) {
        let mut session = Session::new();
        session.status = SessionStatus::Active;
        (session, ChannelPlan::new(band, 0))
    }

    fn run(session: &mut Session, plan: &mut ChannelPlan, data: &[u8]) {
        let mut ctx = MacContext {
            session,
            plan,
            caps: &CAPS,
            snr: -7,
        };
        process_commands(&mut ctx, data);
    }

    #[test]
    fn test_table_lookup() {
        assert_eq!(find(cid::LINK_ADR).map(|s| s.len_dn), Some(4));
        assert_eq!(find(cid::DEV_STATUS).map(|s| s.len_up), Some(2));
        assert!(find(0x7F).is_none());
        for spec in MAC_COMMANDS.iter() {
            assert!(spec.len_up as usize <= MAX_ANSWER_LEN);
        }
    }

    #[test]
    fn test_queue_rejects_malformed_records() {
        let mut q: MacQueue<8> = MacQueue::new(Direction::Up);
        assert_eq!(q.push(0x7F, &[]), Err(QueueError::UnknownCommand(0x7F)));
        // DevStatusAns carries two bytes uplink
        assert_eq!(
            q.push(cid::DEV_STATUS, &[1]),
            Err(QueueError::InvalidLength(cid::DEV_STATUS))
        );
        assert!(q.is_empty());

        let err: Error<()> = QueueError::InvalidLength(cid::DEV_STATUS).into();
        assert_eq!(err, Error::InvalidMacCommand(cid::DEV_STATUS));
        let err: Error<()> = QueueError::Full.into();
        assert_eq!(err, Error::QueueFull);
    }

    #[test]
    fn test_queue_records() {
        let mut q: MacQueue<8> = MacQueue::new(Direction::Up);
        q.push(cid::DEV_STATUS, &[1, 2]).unwrap();
        q.push(cid::RX_TIMING_SETUP, &[]).unwrap();
        q.push(cid::LINK_ADR, &[7]).unwrap();
        assert_eq!(q.as_bytes(), &[0x06, 1, 2, 0x08, 0x03, 7]);
        assert_eq!(q.push(cid::DEV_STATUS, &[3, 4]), Err(QueueError::Full));

        q.replace(cid::DEV_STATUS, &[9, 9]).unwrap();
        assert_eq!(q.as_bytes(), &[0x08, 0x03, 7, 0x06, 9, 9]);
        assert_eq!(q.prefix_len(3), 3);

        // only the first three bytes went out
        q.remove_sent(3);
        assert_eq!(q.as_bytes(), &[0x08, 0x06, 9, 9]);
        q.remove_sent(q.len());
        assert_eq!(q.as_bytes(), &[0x08]);
        q.on_downlink();
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_load_rejects_garbage() {
        let mut q: MacQueue<32> = MacQueue::new(Direction::Up);
        assert!(q.load(&[0x06, 1, 2]));
        assert!(!q.load(&[0x06, 1]));
        assert!(!q.load(&[0x7F]));
        assert_eq!(q.as_bytes(), &[0x06, 1, 2]);
    }

    #[test]
    fn test_link_adr_applies_block() {
        let (mut s, mut plan) = setup(&US915);
        // ChMaskCntl 7 (all 125 kHz off, 500 kHz channel 64 on), then bank 1 on
        let data = [
            0x03, 0x20, 0x01, 0x00, 0x70, //
            0x03, 0x33, 0x00, 0xFF, 0x02,
        ];
        run(&mut s, &mut plan, &data);
        assert_eq!(plan.mask(), (0xFFu128 << 8) | (1u128 << 64));
        assert_eq!(plan.data_rate_up, 3);
        assert_eq!(s.mac.tx_power_steps, 3);
        assert_eq!(s.mac.nb_trans, 2);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x03, 0x07, 0x03, 0x07]);
    }

    #[test]
    fn test_link_adr_is_atomic() {
        let (mut s, mut plan) = setup(&EU868);
        let mask = plan.mask();
        let dr = plan.data_rate_up;
        // valid mask and power, undefined data rate 12
        run(&mut s, &mut plan, &[0x03, 0xC1, 0x03, 0x00, 0x01]);
        assert_eq!(plan.mask(), mask);
        assert_eq!(plan.data_rate_up, dr);
        assert_eq!(s.mac.tx_power_steps, 0);
        assert_eq!(s.mac.nb_trans, 1);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x03, 0b101]);
    }

    #[test]
    fn test_link_adr_rejects_undefined_channel() {
        let (mut s, mut plan) = setup(&EU868);
        run(&mut s, &mut plan, &[0x03, 0x51, 0x08, 0x00, 0x00]);
        assert_eq!(plan.mask(), 0b111);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x03, 0b110]);
    }

    #[test]
    fn test_link_adr_ignores_dr_power_without_adr() {
        let (mut s, mut plan) = setup(&EU868);
        s.mac.adr_enabled = false;
        run(&mut s, &mut plan, &[0x03, 0x55, 0x01, 0x00, 0x03]);
        assert_eq!(plan.mask(), 0b001);
        assert_eq!(plan.data_rate_up, 3);
        assert_eq!(s.mac.tx_power_steps, 0);
        assert_eq!(s.mac.nb_trans, 3);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x03, 0b111]);
    }

    #[test]
    fn test_rx_param_setup() {
        let (mut s, mut plan) = setup(&EU868);
        // offset 2, DR 3, 869.525 MHz
        let f = (869_525_000u32 / 100).to_le_bytes();
        run(&mut s, &mut plan, &[0x05, 0x23, f[0], f[1], f[2]]);
        assert_eq!(plan.rx1_dr_offset, 2);
        assert_eq!(plan.rx2.dr, 3);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x05, 0x07]);

        // unsupported frequency rejects everything
        let f = (868_900_000u32 / 100).to_le_bytes();
        run(&mut s, &mut plan, &[0x05, 0x00, f[0], f[1], f[2]]);
        assert_eq!(plan.rx1_dr_offset, 2);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x05, 0x06]);
    }

    #[test]
    fn test_dev_status_and_duty_cycle() {
        let (mut s, mut plan) = setup(&EU868);
        s.mac.battery_level = 200;
        run(&mut s, &mut plan, &[0x06, 0x04, 0x05]);
        assert_eq!(s.mac.duty_cycle_exp, 5);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x06, 200, 0x39, 0x04]);
    }

    #[test]
    fn test_new_and_dl_channel() {
        let (mut s, mut plan) = setup(&EU868);
        let f = (867_100_000u32 / 100).to_le_bytes();
        run(&mut s, &mut plan, &[0x07, 3, f[0], f[1], f[2], 0x50]);
        let ch = plan.channel(3).unwrap();
        assert_eq!(ch.frequency, 867_100_000);
        assert!(ch.enabled);
        assert_eq!((ch.dr_min, ch.dr_max), (0, 5));

        let d = (869_000_000u32 / 100).to_le_bytes();
        run(&mut s, &mut plan, &[0x0A, 3, d[0], d[1], d[2]]);
        assert_eq!(plan.downlink_channels()[3].frequency, 869_000_000);
        assert_eq!(s.uplink_queue.get(cid::DL_CHANNEL), Some(&[0x03][..]));

        // default channel may not be redefined
        run(&mut s, &mut plan, &[0x07, 1, f[0], f[1], f[2], 0x50]);
        assert_eq!(s.uplink_queue.get(cid::NEW_CHANNEL), Some(&[0x00][..]));
        assert_eq!(plan.channel(1).unwrap().frequency, 868_300_000);
    }

    #[test]
    fn test_user_answers_kept() {
        let (mut s, mut plan) = setup(&EU868);
        run(
            &mut s,
            &mut plan,
            &[0x02, 12, 3, 0x0D, 0x10, 0x20, 0x30, 0x40, 0x80],
        );
        let lc = LinkCheck::from_payload(s.downlink_queue.get(cid::LINK_CHECK).unwrap()).unwrap();
        assert_eq!(lc.margin, 12);
        assert_eq!(lc.gateway_count, 3);
        let dt = DeviceTime::from_payload(s.downlink_queue.get(cid::DEVICE_TIME).unwrap()).unwrap();
        assert_eq!(dt.gps_seconds, 0x4030_2010);
        assert_eq!(dt.fraction, 0x80);
        assert!(s.uplink_queue.is_empty());
    }

    #[test]
    fn test_unknown_command_stops_parsing() {
        let (mut s, mut plan) = setup(&EU868);
        run(&mut s, &mut plan, &[0x04, 0x02, 0x7F, 0x04, 0x09]);
        assert_eq!(s.mac.duty_cycle_exp, 2);
    }

    #[test]
    fn test_confirmations_clear_indications() {
        let (mut s, mut plan) = setup(&EU868);
        s.revision = crate::config::device::Revision::V1_1;
        s.uplink_queue.push(cid::RESET, &[1]).unwrap();
        s.uplink_queue.push(cid::DEVICE_MODE, &[2]).unwrap();
        run(&mut s, &mut plan, &[0x01, 0x01, 0x20, 0x02]);
        assert!(s.uplink_queue.is_empty());
        assert_eq!(s.class, DeviceClass::C);
    }

    #[test]
    fn test_adr_param_and_timing() {
        let (mut s, mut plan) = setup(&EU868);
        run(&mut s, &mut plan, &[0x0C, 0x43, 0x08, 0x00]);
        assert_eq!(s.mac.adr_ack_limit_exp, 4);
        assert_eq!(s.mac.adr_ack_delay_exp, 3);
        assert_eq!(s.mac.rx1_delay_ms, 1000);
        assert_eq!(s.uplink_queue.as_bytes(), &[0x0C, 0x08]);
    }

    #[test]
    fn test_device_time_conversion() {
        let dt = DeviceTime {
            gps_seconds: 1_000_000_000,
            fraction: 0,
        };
        assert_eq!(dt.unix_seconds(), 1_315_964_782);
    }
}
