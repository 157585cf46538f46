use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::SsmError;

/// Token mechanisms this engine issues. Values mirror CK_MECHANISM_TYPE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MechanismType {
    RsaPkcsKeyPairGen,
    RsaPkcs,
    Sha256RsaPkcs,
    DesKeyGen,
    DesEcb,
    DesCbc,
    DesCbcPad,
    Des3KeyGen,
    Des3Ecb,
    Des3Cbc,
    Des3CbcPad,
    Des3Cmac,
    AesKeyGen,
    AesEcb,
    AesCbc,
    AesCbcPad,
    AesGcm,
    DesEcbEncryptData,
    Des3EcbEncryptData,
    AesEcbEncryptData,
}

impl MechanismType {
    pub const ALL: [MechanismType; 20] = [
        MechanismType::RsaPkcsKeyPairGen,
        MechanismType::RsaPkcs,
        MechanismType::Sha256RsaPkcs,
        MechanismType::DesKeyGen,
        MechanismType::DesEcb,
        MechanismType::DesCbc,
        MechanismType::DesCbcPad,
        MechanismType::Des3KeyGen,
        MechanismType::Des3Ecb,
        MechanismType::Des3Cbc,
        MechanismType::Des3CbcPad,
        MechanismType::Des3Cmac,
        MechanismType::AesKeyGen,
        MechanismType::AesEcb,
        MechanismType::AesCbc,
        MechanismType::AesCbcPad,
        MechanismType::AesGcm,
        MechanismType::DesEcbEncryptData,
        MechanismType::Des3EcbEncryptData,
        MechanismType::AesEcbEncryptData,
    ];

    pub fn code(self) -> u64 {
        match self {
            MechanismType::RsaPkcsKeyPairGen => 0x0000,
            MechanismType::RsaPkcs => 0x0001,
            MechanismType::Sha256RsaPkcs => 0x0040,
            MechanismType::DesKeyGen => 0x0120,
            MechanismType::DesEcb => 0x0121,
            MechanismType::DesCbc => 0x0122,
            MechanismType::DesCbcPad => 0x0125,
            MechanismType::Des3KeyGen => 0x0131,
            MechanismType::Des3Ecb => 0x0132,
            MechanismType::Des3Cbc => 0x0133,
            MechanismType::Des3CbcPad => 0x0136,
            MechanismType::Des3Cmac => 0x0138,
            MechanismType::AesKeyGen => 0x1080,
            MechanismType::AesEcb => 0x1081,
            MechanismType::AesCbc => 0x1082,
            MechanismType::AesCbcPad => 0x1085,
            MechanismType::AesGcm => 0x1087,
            MechanismType::DesEcbEncryptData => 0x1100,
            MechanismType::Des3EcbEncryptData => 0x1102,
            MechanismType::AesEcbEncryptData => 0x1104,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|mechanism| mechanism.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            MechanismType::RsaPkcsKeyPairGen => "RSA_PKCS_KEY_PAIR_GEN",
            MechanismType::RsaPkcs => "RSA_PKCS",
            MechanismType::Sha256RsaPkcs => "SHA256_RSA_PKCS",
            MechanismType::DesKeyGen => "DES_KEY_GEN",
            MechanismType::DesEcb => "DES_ECB",
            MechanismType::DesCbc => "DES_CBC",
            MechanismType::DesCbcPad => "DES_CBC_PAD",
            MechanismType::Des3KeyGen => "DES3_KEY_GEN",
            MechanismType::Des3Ecb => "DES3_ECB",
            MechanismType::Des3Cbc => "DES3_CBC",
            MechanismType::Des3CbcPad => "DES3_CBC_PAD",
            MechanismType::Des3Cmac => "DES3_CMAC",
            MechanismType::AesKeyGen => "AES_KEY_GEN",
            MechanismType::AesEcb => "AES_ECB",
            MechanismType::AesCbc => "AES_CBC",
            MechanismType::AesCbcPad => "AES_CBC_PAD",
            MechanismType::AesGcm => "AES_GCM",
            MechanismType::DesEcbEncryptData => "DES_ECB_ENCRYPT_DATA",
            MechanismType::Des3EcbEncryptData => "DES3_ECB_ENCRYPT_DATA",
            MechanismType::AesEcbEncryptData => "AES_ECB_ENCRYPT_DATA",
        }
    }
}

impl fmt::Display for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GCM parameters: 96-bit IV recommended, tag length in bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcmParams {
    pub iv: Vec<u8>,
    pub aad: Vec<u8>,
    pub tag_bits: u32,
}

/// A mechanism together with its parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,
    RsaPkcs,
    Sha256RsaPkcs,
    DesKeyGen,
    Des3KeyGen,
    AesKeyGen,
    DesEcb,
    DesCbc([u8; 8]),
    DesCbcPad([u8; 8]),
    DesEcbEncryptData,
    Des3Ecb,
    Des3Cbc([u8; 8]),
    Des3CbcPad([u8; 8]),
    Des3EcbEncryptData,
    AesEcb,
    AesCbc([u8; 16]),
    AesCbcPad([u8; 16]),
    AesEcbEncryptData,
    AesGcm(GcmParams),
}

impl Mechanism {
    pub fn mechanism_type(&self) -> MechanismType {
        match self {
            Mechanism::RsaPkcsKeyPairGen => MechanismType::RsaPkcsKeyPairGen,
            Mechanism::RsaPkcs => MechanismType::RsaPkcs,
            Mechanism::Sha256RsaPkcs => MechanismType::Sha256RsaPkcs,
            Mechanism::DesKeyGen => MechanismType::DesKeyGen,
            Mechanism::Des3KeyGen => MechanismType::Des3KeyGen,
            Mechanism::AesKeyGen => MechanismType::AesKeyGen,
            Mechanism::DesEcb => MechanismType::DesEcb,
            Mechanism::DesCbc(_) => MechanismType::DesCbc,
            Mechanism::DesCbcPad(_) => MechanismType::DesCbcPad,
            Mechanism::DesEcbEncryptData => MechanismType::DesEcbEncryptData,
            Mechanism::Des3Ecb => MechanismType::Des3Ecb,
            Mechanism::Des3Cbc(_) => MechanismType::Des3Cbc,
            Mechanism::Des3CbcPad(_) => MechanismType::Des3CbcPad,
            Mechanism::Des3EcbEncryptData => MechanismType::Des3EcbEncryptData,
            Mechanism::AesEcb => MechanismType::AesEcb,
            Mechanism::AesCbc(_) => MechanismType::AesCbc,
            Mechanism::AesCbcPad(_) => MechanismType::AesCbcPad,
            Mechanism::AesEcbEncryptData => MechanismType::AesEcbEncryptData,
            Mechanism::AesGcm(_) => MechanismType::AesGcm,
        }
    }
}

/// Secret key families managed by the lifecycle manager. Values mirror CK_KEY_TYPE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Aes,
    Des,
    Des3,
}

impl KeyType {
    pub fn code(self) -> u64 {
        match self {
            KeyType::Des => 0x13,
            KeyType::Des3 => 0x15,
            KeyType::Aes => 0x1f,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x13 => Some(KeyType::Des),
            0x15 => Some(KeyType::Des3),
            0x1f => Some(KeyType::Aes),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Aes => "AES",
            KeyType::Des => "DES",
            KeyType::Des3 => "DES3",
        }
    }

    pub fn generation_mechanism(self) -> Mechanism {
        match self {
            KeyType::Aes => Mechanism::AesKeyGen,
            KeyType::Des => Mechanism::DesKeyGen,
            KeyType::Des3 => Mechanism::Des3KeyGen,
        }
    }

    /// Block size, which is also the IV length of the CBC modes.
    pub fn block_len(self) -> usize {
        match self {
            KeyType::Aes => 16,
            KeyType::Des | KeyType::Des3 => 8,
        }
    }

    pub fn default_bits(self) -> u32 {
        match self {
            KeyType::Aes => 256,
            KeyType::Des => 64,
            KeyType::Des3 => 192,
        }
    }

    /// Validate a requested generation size, filling in the default.
    pub fn resolve_bits(self, bits: Option<u32>) -> Result<u32, SsmError> {
        let bits = bits.filter(|bits| *bits != 0).unwrap_or(self.default_bits());
        let valid = match self {
            KeyType::Aes => matches!(bits, 128 | 192 | 256),
            KeyType::Des => bits == 64,
            KeyType::Des3 => bits == 192,
        };
        if valid {
            Ok(bits)
        } else {
            Err(SsmError::invalid(format!("{self} keys cannot be {bits} bits")))
        }
    }

    /// Validate the length of imported raw key bytes.
    pub fn check_key_len(self, len: usize) -> Result<(), SsmError> {
        let valid = match self {
            KeyType::Aes => matches!(len, 16 | 24 | 32),
            KeyType::Des => len == 8,
            KeyType::Des3 => matches!(len, 16 | 24),
        };
        if valid {
            Ok(())
        } else {
            Err(SsmError::invalid(format!(
                "{len} bytes is not a valid {self} key length"
            )))
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = SsmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "AES" => Ok(KeyType::Aes),
            "DES" => Ok(KeyType::Des),
            "DES3" | "3DES" | "TDES" => Ok(KeyType::Des3),
            other => Err(SsmError::invalid(format!("unknown key type {other}"))),
        }
    }
}
