use lorawan::{
    class::State,
    config::{
        device::{AESKey, AbpCredentials, DevAddr, DeviceClass, OtaaCredentials, Revision, EUI64},
        NodeSettings,
    },
    crypto::{self, CounterId, Direction, KeyType},
    device::LoRaWANNode,
    lorawan::region::EU868,
    Error,
};

use mock::{network, MockClock, MockRadio};

const ADDR: DevAddr = DevAddr::new(0x2601_1F2E);
const NWK: AESKey = AESKey::new([0x11; 16]);
const APP: AESKey = AESKey::new([0x22; 16]);
const F_NWK: AESKey = AESKey::new([0x33; 16]);
const APP_KEY: AESKey = AESKey::new([0x7E; 16]);
const NWK_KEY: AESKey = AESKey::new([0x2B; 16]);
const JOIN_EUI: EUI64 = EUI64::new(0x0000_0000_0000_0001);
const DEV_EUI: EUI64 = EUI64::new(0x70B3_D57E_D005_E5A1);
const NET_ID: u32 = 0x13;

// 867.1 - 867.9 MHz in 100 Hz units, CFListType 0
const CFLIST: [u8; 16] = [
    0x18, 0x4F, 0x84, 0xE8, 0x56, 0x84, 0xB8, 0x5E, 0x84, 0x88, 0x66, 0x84, 0x58, 0x6E, 0x84, 0x00,
];

fn settings() -> NodeSettings {
    NodeSettings {
        duty_cycle_enabled: false,
        ..NodeSettings::default()
    }
}

fn otaa_credentials() -> OtaaCredentials {
    OtaaCredentials::new(JOIN_EUI, DEV_EUI, None, APP_KEY)
}

fn abp_node(radio: &MockRadio, clock: &MockClock) -> LoRaWANNode<MockRadio, MockClock> {
    let mut node = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    node.begin_abp(AbpCredentials::new_v1_0(ADDR, NWK, APP)).unwrap();
    node.activate_abp().unwrap();
    node
}

fn otaa_node(radio: &MockRadio, clock: &MockClock) -> LoRaWANNode<MockRadio, MockClock> {
    let mut node = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    node.begin_otaa(otaa_credentials()).unwrap();
    node
}

fn join_accept(join_nonce: u32) -> Vec<u8> {
    network::join_accept_v1_0(&APP_KEY, join_nonce, NET_ID, ADDR, 0x00, 1, Some(&CFLIST))
}

#[test]
fn test_otaa_join() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);
    assert!(!node.is_activated());

    radio.push_rx(&join_accept(1));
    node.join().unwrap();
    assert!(node.is_activated());
    assert_eq!(node.dev_addr(), ADDR);
    assert_eq!(node.state(), State::Idle);

    let request = &radio.tx_frames()[0];
    assert_eq!(request.len(), 23);
    assert_eq!(request[0], 0x00);
    assert_eq!(&request[1..9], &JOIN_EUI.to_le_bytes());
    assert_eq!(&request[9..17], &DEV_EUI.to_le_bytes());
    // first DevNonce is 1
    assert_eq!(&request[17..19], &[1, 0]);
    assert_eq!(crypto::compute_mic(&APP_KEY, &[&request[..19]]), request[19..]);

    // Rx1 opens 5 s after the request, minus the guard
    assert_eq!(clock.get(), 4990);
    let rx = radio.rx_calls();
    assert_eq!(rx.len(), 1);
    assert!(rx[0].invert_iq);

    let session = node.mac().session();
    let nwk_s = crypto::derive_key_v1_0(&APP_KEY, KeyType::FNwkSInt, 1, NET_ID, 1);
    let app_s = crypto::derive_key_v1_0(&APP_KEY, KeyType::AppS, 1, NET_ID, 1);
    assert_eq!(session.keys.nwk_s_enc, nwk_s);
    assert_eq!(session.keys.s_nwk_s_int, nwk_s);
    assert_eq!(session.keys.app_s, app_s);
    assert_eq!(session.mac.rx1_delay_ms, 1000);

    let plan = node.mac().plan();
    let freqs: Vec<u32> = (3..8).map(|i| plan.channel(i).unwrap().frequency).collect();
    assert_eq!(
        freqs,
        vec![867_100_000, 867_300_000, 867_500_000, 867_700_000, 867_900_000]
    );
    assert!(plan.channel(8).is_none());
}

#[test]
fn test_join_accept_in_rx2() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);

    radio.push_timeout();
    radio.push_rx(&join_accept(1));
    node.join().unwrap();
    assert!(node.is_activated());

    let rx = radio.rx_calls();
    assert_eq!(rx.len(), 2);
    assert_eq!(rx[1].frequency, 869_525_000);
    assert_eq!(clock.get(), 5990);
}

#[test]
fn test_join_without_answer() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);

    radio.push_timeout();
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::NoJoinAccept));
    assert!(!node.is_activated());
    assert_eq!(node.state(), State::Idle);

    // the next attempt uses a fresh DevNonce
    radio.push_rx(&join_accept(1));
    node.join().unwrap();
    assert_eq!(&radio.tx_frames()[1][17..19], &[2, 0]);
}

#[test]
fn test_join_rejects_bad_accept() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);

    // corrupt the second cipher block, which holds the MIC
    let mut forged = join_accept(1);
    forged[30] ^= 0x01;
    radio.push_rx(&forged);
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::InvalidMic));
    assert!(!node.is_activated());

    // a good accept in Rx2 wins over a bad one in Rx1
    radio.push_rx(&forged);
    radio.push_rx(&join_accept(1));
    node.join().unwrap();
    assert!(node.is_activated());
}

#[test]
fn test_join_nonce_replay() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);

    radio.push_rx(&join_accept(7));
    node.join().unwrap();

    node.create_session().unwrap();
    radio.push_rx(&join_accept(7));
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::JoinNonceReplay));
    assert!(!node.is_activated());
}

fn otaa_node_v1_1(radio: &MockRadio, clock: &MockClock) -> LoRaWANNode<MockRadio, MockClock> {
    let mut node = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    node.begin_otaa(OtaaCredentials::new(JOIN_EUI, DEV_EUI, Some(NWK_KEY), APP_KEY))
        .unwrap();
    node
}

fn join_accept_v1_1(join_nonce: u32, dev_nonce: u16) -> Vec<u8> {
    network::join_accept_v1_1(&NWK_KEY, JOIN_EUI, DEV_EUI, dev_nonce, join_nonce, NET_ID, ADDR, 1)
}

/// `AES(root, type | JoinNonce | JoinEUI | DevNonce | pad)`
fn session_key_v1_1(root: &AESKey, kind: u8, join_nonce: u32, dev_nonce: u16) -> AESKey {
    let mut block = [0u8; 16];
    block[0] = kind;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..12].copy_from_slice(&JOIN_EUI.to_le_bytes());
    block[12..14].copy_from_slice(&dev_nonce.to_le_bytes());
    crypto::aes_encrypt_block(root, &mut block);
    AESKey::new(block)
}

#[test]
fn test_otaa_join_v1_1() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node_v1_1(&radio, &clock);

    radio.push_rx(&join_accept_v1_1(0x00_0102, 1));
    node.join().unwrap();
    assert!(node.is_activated());
    assert_eq!(node.dev_addr(), ADDR);

    // the request is signed with NwkKey
    let request = &radio.tx_frames()[0];
    assert_eq!(crypto::compute_mic(&NWK_KEY, &[&request[..19]]), request[19..]);

    let session = node.mac().session();
    assert_eq!(session.revision, Revision::V1_1);
    assert_eq!(session.keys.f_nwk_s_int, session_key_v1_1(&NWK_KEY, 0x01, 0x102, 1));
    assert_eq!(session.keys.app_s, session_key_v1_1(&APP_KEY, 0x02, 0x102, 1));
    assert_eq!(session.keys.s_nwk_s_int, session_key_v1_1(&NWK_KEY, 0x03, 0x102, 1));
    assert_eq!(session.keys.nwk_s_enc, session_key_v1_1(&NWK_KEY, 0x04, 0x102, 1));
    assert_ne!(session.keys.f_nwk_s_int, session.keys.s_nwk_s_int);
    // RekeyInd for 1.1 waits for the first uplink
    assert_eq!(session.uplink_queue.as_bytes(), &[0x0B, 0x01]);
}

#[test]
fn test_join_nonce_must_increase_v1_1() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node_v1_1(&radio, &clock);

    radio.push_rx(&join_accept_v1_1(5, 1));
    node.join().unwrap();

    node.create_session().unwrap();
    radio.push_rx(&join_accept_v1_1(5, 2));
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::JoinNonceReplay));

    radio.push_rx(&join_accept_v1_1(4, 3));
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::JoinNonceReplay));
    assert!(!node.is_activated());

    radio.push_rx(&join_accept_v1_1(6, 4));
    node.join().unwrap();
    assert!(node.is_activated());
    assert_eq!(
        node.mac().session().keys.app_s,
        session_key_v1_1(&APP_KEY, 0x02, 6, 4)
    );
}

#[test]
fn test_join_accept_with_opt_neg_needs_v1_1_keys() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);

    // a 1.1 accept for a device holding only AppKey
    let accept = network::join_accept_v1_1(&APP_KEY, JOIN_EUI, DEV_EUI, 1, 1, NET_ID, ADDR, 1);
    radio.push_rx(&accept);
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::VersionMismatch));
    assert!(!node.is_activated());
    assert_eq!(node.mac().nonces().join_nonce, None);
}

#[test]
fn test_v1_1_device_falls_back_to_v1_0() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node_v1_1(&radio, &clock);

    // no OptNeg: 1.0 accept signed with NwkKey
    let accept = network::join_accept_v1_0(&NWK_KEY, 3, NET_ID, ADDR, 0x00, 1, None);
    radio.push_rx(&accept);
    node.join().unwrap();

    let session = node.mac().session();
    assert_eq!(session.revision, Revision::V1_0);
    let nwk_s = crypto::derive_key_v1_0(&NWK_KEY, KeyType::FNwkSInt, 3, NET_ID, 1);
    assert_eq!(session.keys.nwk_s_enc, nwk_s);
    assert_eq!(session.keys.f_nwk_s_int, nwk_s);
}

#[test]
fn test_join_requires_otaa() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);
    assert_eq!(node.join(), Err(Error::Unsupported));
}

#[test]
fn test_abp_uplink() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);
    assert!(node.is_activated());

    radio.push_timeout();
    radio.push_timeout();
    let outcome = node.send(b"hello", 10, false).unwrap();
    assert_eq!(outcome.fcnt, 0);
    assert!(outcome.downlink.is_none());
    assert!(outcome.payload_sent);
    assert_eq!(node.f_cnt_up(), 1);

    let tx = radio.last_tx().unwrap();
    assert!(network::uplink_mic_valid_v1_0(&NWK, &tx.frame));
    assert_eq!(tx.frame[0], 0x40);
    assert_eq!(&tx.frame[1..5], &ADDR.to_le_bytes());
    // ADR bit set, no FOpts
    assert_eq!(tx.frame[5], 0x80);
    assert_eq!(tx.frame[8], 10);
    assert_eq!(network::uplink_payload(&APP, &tx.frame), b"hello");
    assert_eq!(tx.power, 16);

    let rx = radio.rx_calls();
    assert_eq!(rx.len(), 2);
    assert_eq!(rx[0].frequency, tx.frequency);
    assert_eq!(rx[1].frequency, 869_525_000);
    assert!(rx.iter().all(|r| r.invert_iq && r.timeout_ms.is_some()));
    assert_eq!(clock.get(), 1990);
}

#[test]
fn test_abp_downlink() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    let frame = network::downlink_v1_0(&NWK, &APP, ADDR, 0, false, 0x00, &[], Some(5), b"hi");
    radio.push_rx(&frame);
    let outcome = node.send(b"ping", 1, false).unwrap();
    let downlink = outcome.downlink.unwrap();
    assert_eq!(downlink.port, Some(5));
    assert_eq!(&downlink.payload[..], b"hi");
    assert!(!downlink.multicast);
    assert_eq!(downlink.rssi, -60);
    assert_eq!(node.n_f_cnt_down(), Some(0));
    // Rx2 was never opened
    assert_eq!(radio.rx_calls().len(), 1);

    // the same frame again is a replay
    radio.push_rx(&frame);
    radio.push_timeout();
    let outcome = node.send(b"ping", 1, false).unwrap();
    assert!(outcome.downlink.is_none());
    assert_eq!(outcome.rejected, Some(Error::FCntReplay));
}

#[test]
fn test_confirmed_downlink_is_acknowledged() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    let frame = network::downlink_v1_0(&NWK, &APP, ADDR, 3, true, 0x00, &[], Some(5), b"ok");
    radio.push_rx(&frame);
    let outcome = node.send(b"ping", 1, false).unwrap();
    assert!(outcome.downlink.unwrap().confirmed);

    radio.push_timeout();
    radio.push_timeout();
    node.send(b"ping", 1, false).unwrap();
    let tx = radio.last_tx().unwrap();
    assert_eq!(tx.frame[5] & 0x20, 0x20);
}

#[test]
fn test_confirmed_uplink_retransmission() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    // LinkADRReq: DR5, TXPower 0, channels 0-2, NbTrans 3
    let link_adr = [0x03, 0x50, 0x07, 0x00, 0x03];
    let frame = network::downlink_v1_0(&NWK, &APP, ADDR, 0, false, 0x00, &link_adr, None, &[]);
    radio.push_rx(&frame);
    node.send(b"ping", 1, false).unwrap();
    assert_eq!(node.mac().session().mac.nb_trans, 3);

    for _ in 0..6 {
        radio.push_timeout();
    }
    let outcome = node.send(b"conf", 2, true).unwrap();
    assert!(!outcome.acked);
    assert_eq!(outcome.fcnt, 1);
    assert_eq!(node.f_cnt_up(), 2);

    let frames = radio.tx_frames();
    assert_eq!(frames.len(), 4);
    for frame in &frames[1..] {
        assert_eq!(frame[0], 0x80);
        assert_eq!(&frame[6..8], &[1, 0]);
        assert!(network::uplink_mic_valid_v1_0(&NWK, frame));
    }
    // every copy repeats the first one, LinkADRAns included
    assert_eq!(frames[1][5] & 0x0F, 2);
    assert_eq!(frames[2], frames[1]);
    assert_eq!(frames[3], frames[1]);
    assert_eq!(&network::uplink_payload(&APP, &frames[1])[..], b"conf");
    assert!(node.mac().session().uplink_queue.is_empty());

    let ack = network::downlink_v1_0(&NWK, &APP, ADDR, 1, false, 0x20, &[], None, &[]);
    radio.push_rx(&ack);
    let outcome = node.send(b"conf", 2, true).unwrap();
    assert!(outcome.acked);
    assert_eq!(radio.tx_frames().len(), 5);
    assert_eq!(node.mac().session().counters.conf_f_cnt_up, None);
}

#[test]
fn test_repeats_keep_ack() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    // confirmed downlink carrying LinkADRReq with NbTrans 2
    let link_adr = [0x03, 0x50, 0x07, 0x00, 0x02];
    let frame = network::downlink_v1_0(&NWK, &APP, ADDR, 0, true, 0x00, &link_adr, Some(4), b"c");
    radio.push_rx(&frame);
    node.send(b"ping", 1, false).unwrap();
    assert_eq!(node.mac().session().mac.nb_trans, 2);

    for _ in 0..4 {
        radio.push_timeout();
    }
    node.send(b"data", 1, false).unwrap();
    let frames = radio.tx_frames();
    assert_eq!(frames.len(), 3);
    // ACK set, LinkADRAns in FOpts
    assert_eq!(frames[1][5], 0x80 | 0x20 | 2);
    assert_eq!(&frames[1][6..8], &[1, 0]);
    assert_eq!(frames[2], frames[1]);
    assert!(network::uplink_mic_valid_v1_0(&NWK, &frames[2]));
    assert_eq!(node.mac().session().counters.conf_f_cnt_down, None);
}

#[test]
fn test_port_validation() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    assert_eq!(node.send(b"x", 0, false), Err(Error::InvalidPort(0)));
    assert_eq!(node.send(b"x", 224, false), Err(Error::InvalidPort(224)));
    assert_eq!(node.send(b"x", 250, false), Err(Error::InvalidPort(250)));
    assert!(radio.tx_frames().is_empty());

    let mut node = LoRaWANNode::new(
        radio.clone(),
        clock.clone(),
        &EU868,
        0,
        NodeSettings {
            allow_test_port: true,
            ..settings()
        },
    );
    node.begin_abp(AbpCredentials::new_v1_0(ADDR, NWK, APP)).unwrap();
    node.activate_abp().unwrap();
    radio.push_timeout();
    radio.push_timeout();
    node.send(b"x", 224, false).unwrap();
}

#[test]
fn test_send_requires_session() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);
    assert_eq!(node.send(b"x", 1, false), Err(Error::NotActivated));
}

#[test]
fn test_payload_too_long() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);

    // DR3 carries 115 bytes
    assert_eq!(node.max_payload_len(), 115);
    let payload = [0u8; 116];
    assert_eq!(node.send(&payload, 1, false), Err(Error::PayloadTooLong(115)));
    assert_eq!(node.f_cnt_up(), 0);
    assert_eq!(node.state(), State::Idle);
}

#[test]
fn test_abp_session_persistence() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);
    radio.push_timeout();
    radio.push_timeout();
    node.send(b"hello", 1, false).unwrap();

    let nonces = node.export_nonces();
    let session = node.export_session();

    let mut restored = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    restored
        .begin_abp(AbpCredentials::new_v1_0(ADDR, NWK, APP))
        .unwrap();
    restored.restore_nonces(&nonces).unwrap();
    restored.restore_session(&session).unwrap();
    assert!(!restored.is_activated());
    restored.activate_abp().unwrap();
    assert!(restored.is_activated());
    assert_eq!(restored.f_cnt_up(), 1);
    assert_eq!(restored.dev_addr(), ADDR);

    radio.push_timeout();
    radio.push_timeout();
    restored.send(b"again", 1, false).unwrap();
    let tx = radio.last_tx().unwrap();
    assert_eq!(&tx.frame[6..8], &[1, 0]);
    assert!(network::uplink_mic_valid_v1_0(&NWK, &tx.frame));
}

#[test]
fn test_otaa_session_persistence() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);
    radio.push_rx(&join_accept(1));
    node.join().unwrap();

    let nonces = node.export_nonces();
    let session = node.export_session();
    let sent = radio.tx_frames().len();

    let mut restored = otaa_node(&radio, &clock);
    restored.restore_nonces(&nonces).unwrap();
    restored.restore_session(&session).unwrap();
    // confirming a restored session transmits nothing
    restored.join().unwrap();
    assert!(restored.is_activated());
    assert_eq!(radio.tx_frames().len(), sent);
    assert_eq!(restored.mac().session().keys, node.mac().session().keys);
    assert_eq!(
        restored.mac().plan().channel(7).map(|c| c.frequency),
        Some(867_900_000)
    );
}

#[test]
fn test_dev_nonce_survives_restart() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);
    radio.push_timeout();
    radio.push_timeout();
    assert_eq!(node.join(), Err(Error::NoJoinAccept));
    let nonces = node.export_nonces();

    let mut restored = otaa_node(&radio, &clock);
    restored.restore_nonces(&nonces).unwrap();
    radio.push_rx(&join_accept(1));
    restored.join().unwrap();
    assert_eq!(&radio.last_tx().unwrap().frame[17..19], &[2, 0]);
}

#[test]
fn test_corrupted_buffers_rejected() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = abp_node(&radio, &clock);
    let nonces = node.export_nonces();
    let session = node.export_session();

    let mut restored = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    restored
        .begin_abp(AbpCredentials::new_v1_0(ADDR, NWK, APP))
        .unwrap();

    let mut bad = nonces;
    bad[4] ^= 0x01;
    assert_eq!(restored.restore_nonces(&bad), Err(Error::ChecksumMismatch));
    assert_eq!(restored.restore_nonces(&nonces[..10]), Err(Error::ChecksumMismatch));
    restored.restore_nonces(&nonces).unwrap();

    let mut bad = session;
    bad[20] ^= 0x80;
    assert_eq!(restored.restore_session(&bad), Err(Error::ChecksumMismatch));
    assert!(!restored.is_activated());

    // other keys, other configuration
    let mut other = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    other
        .begin_abp(AbpCredentials::new_v1_0(ADDR, NWK, AESKey::new([0x33; 16])))
        .unwrap();
    assert_eq!(other.restore_nonces(&nonces), Err(Error::ConfigurationMismatch));

    node.clear_session().unwrap();
    assert!(!node.is_activated());
}

#[test]
fn test_wipe_forgets_session() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = otaa_node(&radio, &clock);
    radio.push_rx(&join_accept(1));
    node.join().unwrap();

    node.wipe().unwrap();
    assert!(!node.is_activated());
    assert_eq!(node.mac().nonces().dev_nonce, 0);
    assert_eq!(node.mac().nonces().join_nonce, None);

    // credentials survive, the DevNonce sequence restarts
    radio.push_rx(&join_accept(2));
    node.join().unwrap();
    assert_eq!(&radio.last_tx().unwrap().frame[17..19], &[1, 0]);
}

#[test]
fn test_v1_1_indications_and_class_switch() {
    let radio = MockRadio::new();
    let clock = MockClock::new();
    let mut node = LoRaWANNode::new(radio.clone(), clock.clone(), &EU868, 0, settings());
    // SNwkSIntKey equals NwkSEncKey so the network helper can sign port-0 frames
    node.begin_abp(AbpCredentials::new_v1_1(ADDR, F_NWK, NWK, NWK, APP))
        .unwrap();
    node.activate_abp().unwrap();

    // the switch waits for DeviceModeConf
    node.set_class(DeviceClass::C).unwrap();
    assert_eq!(node.class(), DeviceClass::A);

    radio.push_timeout();
    radio.push_timeout();
    node.send(b"v11", 1, false).unwrap();
    let tx = radio.last_tx().unwrap();
    let frame = &tx.frame;
    assert_eq!(frame[5] & 0x0F, 4);
    let mut opts = frame[8..12].to_vec();
    crypto::ctr_transform(&NWK, CounterId::NetworkFOpts, Direction::Up, ADDR, 0, &mut opts);
    // ResetInd 1.1, DeviceModeInd class C
    assert_eq!(opts, [0x01, 0x01, 0x20, 0x02]);

    let n = frame.len() - 4;
    let ch = [868_100_000, 868_300_000, 868_500_000]
        .iter()
        .position(|&f| f == tx.frequency)
        .unwrap() as u8;
    let b0 = crypto::mic_block_b0(Direction::Up, ADDR, 0, 0, n);
    let b1 = crypto::mic_block_b1(ADDR, 0, 0, 3, ch, n);
    let mic = crypto::pack_mic_v1_1(
        &crypto::compute_mic(&NWK, &[&b1, &frame[..n]]),
        &crypto::compute_mic(&F_NWK, &[&b0, &frame[..n]]),
    );
    assert_eq!(mic, frame[n..]);

    // ResetConf and DeviceModeConf on port 0
    let conf = network::downlink_v1_0(
        &NWK,
        &APP,
        ADDR,
        0,
        false,
        0x00,
        &[],
        Some(0),
        &[0x01, 0x01, 0x20, 0x02],
    );
    radio.push_rx(&conf);
    let outcome = node.send(b"v11", 1, false).unwrap();
    assert!(outcome.downlink.is_some());
    assert_eq!(node.class(), DeviceClass::C);
    assert_eq!(node.state(), State::RxC);
    assert!(node.mac().session().uplink_queue.as_bytes().is_empty());
}
