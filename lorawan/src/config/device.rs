use core::fmt;

/// EUI-64 identifier (JoinEUI or DevEUI), stored MSB first as usually printed
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EUI64(u64);

impl EUI64 {
    /// Create an EUI from its numeric value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Numeric value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Wire representation (LSB first)
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EUI64({:016X})", self.0)
    }
}

/// AES-128 key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Create a key from raw bytes
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AESKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AESKey(..)")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AESKey {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "AESKey(..)")
    }
}

/// Device address assigned at join or ABP provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DevAddr(u32);

impl DevAddr {
    /// Create a device address from its numeric value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Numeric value
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Wire representation (LSB first)
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Network identifier bits (top 7 bits, NwkID of a type 0 NetID)
    pub fn nwk_id(&self) -> u8 {
        (self.0 >> 25) as u8
    }
}

/// LoRaWAN protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Revision {
    /// LoRaWAN 1.0.x
    V1_0,
    /// LoRaWAN 1.1
    V1_1,
}

impl Revision {
    /// Minor version number as carried by ResetInd / RekeyInd
    pub fn minor(&self) -> u8 {
        match self {
            Revision::V1_0 => 0,
            Revision::V1_1 => 1,
        }
    }

    /// Parse a minor version number
    pub fn from_minor(minor: u8) -> Option<Self> {
        match minor {
            0 => Some(Revision::V1_0),
            1 => Some(Revision::V1_1),
            _ => None,
        }
    }
}

/// How the current credentials establish a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActivationMode {
    /// No credentials configured
    None,
    /// Over-the-air activation
    Otaa,
    /// Activation by personalization
    Abp,
}

impl ActivationMode {
    /// Persisted mode tag
    pub fn code(&self) -> u16 {
        match self {
            ActivationMode::None => 0x0000,
            ActivationMode::Otaa => 0x07AA,
            ActivationMode::Abp => 0x0AB9,
        }
    }

    /// Parse a persisted mode tag
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(ActivationMode::None),
            0x07AA => Some(ActivationMode::Otaa),
            0x0AB9 => Some(ActivationMode::Abp),
            _ => None,
        }
    }
}

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceClass {
    /// Class A: Uplink followed by two receive windows
    A,
    /// Class B: Scheduled receive slots (beaconing)
    B,
    /// Class C: Continuously listening except when transmitting
    C,
}

impl DeviceClass {
    /// Wire value used by DeviceModeInd and the persistence buffers
    pub fn code(&self) -> u8 {
        match self {
            DeviceClass::A => 0x00,
            DeviceClass::B => 0x01,
            DeviceClass::C => 0x02,
        }
    }

    /// Parse a wire value
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(DeviceClass::A),
            0x01 => Some(DeviceClass::B),
            0x02 => Some(DeviceClass::C),
            _ => None,
        }
    }
}

/// OTAA root credentials
#[derive(Debug, Clone, Copy)]
pub struct OtaaCredentials {
    /// Join server identifier (AppEUI in 1.0)
    pub join_eui: EUI64,
    /// Device identifier
    pub dev_eui: EUI64,
    /// Network root key; `None` selects LoRaWAN 1.0 where AppKey serves both roles
    pub nwk_key: Option<AESKey>,
    /// Application root key
    pub app_key: AESKey,
}

impl OtaaCredentials {
    /// Create OTAA credentials
    pub fn new(join_eui: EUI64, dev_eui: EUI64, nwk_key: Option<AESKey>, app_key: AESKey) -> Self {
        Self {
            join_eui,
            dev_eui,
            nwk_key,
            app_key,
        }
    }

    /// Revision implied by the supplied keys
    pub fn revision(&self) -> Revision {
        if self.nwk_key.is_some() {
            Revision::V1_1
        } else {
            Revision::V1_0
        }
    }
}

/// ABP session credentials
#[derive(Debug, Clone, Copy)]
pub struct AbpCredentials {
    /// Device address
    pub dev_addr: DevAddr,
    /// Forwarding network integrity key (1.1 only)
    pub f_nwk_s_int_key: Option<AESKey>,
    /// Serving network integrity key (1.1 only)
    pub s_nwk_s_int_key: Option<AESKey>,
    /// Network encryption key; NwkSKey in 1.0
    pub nwk_s_enc_key: AESKey,
    /// Application session key
    pub app_s_key: AESKey,
}

impl AbpCredentials {
    /// LoRaWAN 1.0 credentials (NwkSKey + AppSKey)
    pub fn new_v1_0(dev_addr: DevAddr, nwk_s_key: AESKey, app_s_key: AESKey) -> Self {
        Self {
            dev_addr,
            f_nwk_s_int_key: None,
            s_nwk_s_int_key: None,
            nwk_s_enc_key: nwk_s_key,
            app_s_key,
        }
    }

    /// LoRaWAN 1.1 credentials
    pub fn new_v1_1(
        dev_addr: DevAddr,
        f_nwk_s_int_key: AESKey,
        s_nwk_s_int_key: AESKey,
        nwk_s_enc_key: AESKey,
        app_s_key: AESKey,
    ) -> Self {
        Self {
            dev_addr,
            f_nwk_s_int_key: Some(f_nwk_s_int_key),
            s_nwk_s_int_key: Some(s_nwk_s_int_key),
            nwk_s_enc_key,
            app_s_key,
        }
    }

    /// Revision implied by the supplied keys
    pub fn revision(&self) -> Revision {
        if self.f_nwk_s_int_key.is_some() && self.s_nwk_s_int_key.is_some() {
            Revision::V1_1
        } else {
            Revision::V1_0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eui_wire_order() {
        let eui = EUI64::new(0x0102_0304_0506_0708);
        assert_eq!(eui.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_key_debug_hides_material() {
        let key = AESKey::new([0xAA; 16]);
        assert_eq!(std::format!("{:?}", key), "AESKey(..)");
    }

    #[test]
    fn test_revision_from_credentials() {
        let otaa = OtaaCredentials::new(EUI64::new(1), EUI64::new(2), None, AESKey::new([1; 16]));
        assert_eq!(otaa.revision(), Revision::V1_0);

        let abp = AbpCredentials::new_v1_1(
            DevAddr::new(0x2601_1234),
            AESKey::new([1; 16]),
            AESKey::new([2; 16]),
            AESKey::new([3; 16]),
            AESKey::new([4; 16]),
        );
        assert_eq!(abp.revision(), Revision::V1_1);
        assert_eq!(abp.dev_addr.nwk_id(), 0x13);
    }

    #[test]
    fn test_mode_codes() {
        for mode in [ActivationMode::None, ActivationMode::Otaa, ActivationMode::Abp] {
            assert_eq!(ActivationMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(ActivationMode::from_code(0x1234), None);
    }
}
