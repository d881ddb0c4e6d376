//! LoRaWAN cryptographic operations
//!
//! This module provides the keyed transforms used by the MAC:
//! - Message Integrity Code (MIC) computation with AES-CMAC
//! - Payload and FOpts encryption with AES in counter mode
//! - Join accept decryption (AES-ECB encrypt)
//! - Session key derivation for LoRaWAN 1.0 and 1.1
//! - The 16-bit XOR-fold checksum used by the persistence buffers

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr, EUI64};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
pub const BLOCK_SIZE: usize = 16;

const ENC_BLOCK_MAGIC: u8 = 0x01;
const MIC_BLOCK_MAGIC: u8 = 0x49;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

/// Counter-mode stream identifier (byte 4 of the A block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterId {
    /// FRMPayload
    Payload = 0x00,
    /// FOpts covered by the network counter
    NetworkFOpts = 0x01,
    /// FOpts of a downlink covered by the application counter
    AppFOpts = 0x02,
}

fn cipher(key: &AESKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

/// Encrypt a single block in place
pub fn aes_encrypt_block(key: &AESKey, block: &mut [u8; BLOCK_SIZE]) {
    cipher(key).encrypt_block(GenericArray::from_mut_slice(block));
}

/// Full 16-byte AES-CMAC over the concatenation of `parts`
pub fn cmac(key: &AESKey, parts: &[&[u8]]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// MIC over the concatenation of `parts`: the first four CMAC bytes
pub fn compute_mic(key: &AESKey, parts: &[&[u8]]) -> [u8; MIC_SIZE] {
    let full = cmac(key, parts);
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

/// B0 block for data frames
///
/// `conf_fcnt` is the 16-bit counter of the frame being acknowledged (1.1 only, zero otherwise).
pub fn mic_block_b0(
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    conf_fcnt: u16,
    len: usize,
) -> [u8; BLOCK_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = MIC_BLOCK_MAGIC;
    if dir == Direction::Down {
        b0[1..3].copy_from_slice(&conf_fcnt.to_le_bytes());
    }
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = len as u8;
    b0
}

/// B1 block for LoRaWAN 1.1 uplinks
pub fn mic_block_b1(
    dev_addr: DevAddr,
    fcnt: u32,
    conf_fcnt: u16,
    tx_dr: u8,
    tx_ch: u8,
    len: usize,
) -> [u8; BLOCK_SIZE] {
    let mut b1 = [0u8; BLOCK_SIZE];
    b1[0] = MIC_BLOCK_MAGIC;
    b1[1..3].copy_from_slice(&conf_fcnt.to_le_bytes());
    b1[3] = tx_dr;
    b1[4] = tx_ch;
    b1[5] = Direction::Up as u8;
    b1[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b1[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b1[15] = len as u8;
    b1
}

/// Pack the two 1.1 uplink CMACs into the wire MIC: `cmacS[0..2] | cmacF[0..2]`
pub fn pack_mic_v1_1(mic_s: &[u8; MIC_SIZE], mic_f: &[u8; MIC_SIZE]) -> [u8; MIC_SIZE] {
    [mic_s[0], mic_s[1], mic_f[0], mic_f[1]]
}

/// Encrypt or decrypt `data` in place using AES-128 in counter mode
///
/// The keystream blocks are `A_i = 0x01 | 0 0 0 | ctr_id | dir | DevAddr | FCnt | 0 | i`
/// with `i` starting at 1.
pub fn ctr_transform(
    key: &AESKey,
    ctr_id: CounterId,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    data: &mut [u8],
) {
    let cipher = cipher(key);
    let mut a = [0u8; BLOCK_SIZE];
    a[0] = ENC_BLOCK_MAGIC;
    a[4] = ctr_id as u8;
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());

    for (i, chunk) in data.chunks_mut(BLOCK_SIZE).enumerate() {
        a[15] = (i + 1) as u8;
        let mut s = a;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut s));
        for (byte, k) in chunk.iter_mut().zip(s.iter()) {
            *byte ^= k;
        }
    }
}

/// Encrypt or decrypt an FRMPayload in place
pub fn encrypt_payload(key: &AESKey, dev_addr: DevAddr, fcnt: u32, dir: Direction, payload: &mut [u8]) {
    ctr_transform(key, CounterId::Payload, dir, dev_addr, fcnt, payload);
}

/// Decrypt a join accept in place
///
/// The network encrypts with AES decrypt, so the device recovers the plaintext
/// by running AES encrypt over each 16-byte block. `data` must be a multiple of 16.
pub fn decrypt_join_accept(key: &AESKey, data: &mut [u8]) {
    let cipher = cipher(key);
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Session key type constants for the derivation block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// FNwkSIntKey (1.1) / NwkSKey (1.0)
    FNwkSInt = 0x01,
    /// AppSKey
    AppS = 0x02,
    /// SNwkSIntKey
    SNwkSInt = 0x03,
    /// NwkSEncKey
    NwkSEnc = 0x04,
    /// JSEncKey
    JSEnc = 0x05,
    /// JSIntKey
    JSInt = 0x06,
}

/// Derive a 1.1 session key: `AES(root, type | JoinNonce | JoinEUI | DevNonce | pad)`
pub fn derive_key_v1_1(
    root: &AESKey,
    kind: KeyType,
    join_nonce: u32,
    join_eui: EUI64,
    dev_nonce: u16,
) -> AESKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = kind as u8;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..12].copy_from_slice(&join_eui.to_le_bytes());
    block[12..14].copy_from_slice(&dev_nonce.to_le_bytes());
    aes_encrypt_block(root, &mut block);
    AESKey::new(block)
}

/// Derive a 1.0 session key: `AES(AppKey, type | JoinNonce | NetID | DevNonce | pad)`
pub fn derive_key_v1_0(
    root: &AESKey,
    kind: KeyType,
    join_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> AESKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = kind as u8;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    aes_encrypt_block(root, &mut block);
    AESKey::new(block)
}

/// Derive a join-server key (JSIntKey, JSEncKey): `AES(NwkKey, type | DevEUI | pad)`
pub fn derive_join_key(nwk_key: &AESKey, kind: KeyType, dev_eui: EUI64) -> AESKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = kind as u8;
    block[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    aes_encrypt_block(nwk_key, &mut block);
    AESKey::new(block)
}

/// 16-bit XOR fold over big-endian byte pairs; an odd trailing byte is the high half
pub fn checksum16(data: &[u8]) -> u16 {
    data.chunks(2).fold(0u16, |acc, pair| {
        let hi = pair[0] as u16;
        let lo = pair.get(1).copied().unwrap_or(0) as u16;
        acc ^ ((hi << 8) | lo)
    })
}
