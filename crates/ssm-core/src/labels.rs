//! Well-known key labels and the numeric algorithm codes callers use to pick them.

use crate::mechanism::KeyType;

pub const AUDIT_KEY_LABEL: &str = "SSM_AUDIT_KEY";
pub const JWT_KEY_LABEL: &str = "SSM_JWT_KEY";
pub const INTERNAL_AES_LABEL: &str = "SSM_INTERNAL_AES256";

pub const EXTERNAL_AES: &str = "K4_AES";
pub const EXTERNAL_DES: &str = "K4_DES";
pub const EXTERNAL_DES3: &str = "K4_DES3";

// Spelling matches labels already present on deployed tokens.
pub const INTERNAL_AES: &str = "KEY_ENCRIPTION_AES";
pub const INTERNAL_DES: &str = "KEY_ENCRIPTION_DES";
pub const INTERNAL_DES3: &str = "KEY_ENCRIPTION_DES3";

/// Labels callers outside the service may store or update keys under.
pub const EXTERNAL_LABELS: [&str; 3] = [EXTERNAL_AES, EXTERNAL_DES, EXTERNAL_DES3];
/// Labels for keys that protect the service's own users.
pub const INTERNAL_LABELS: [&str; 3] = [INTERNAL_AES, INTERNAL_DES, INTERNAL_DES3];

pub fn is_external_label(label: &str) -> bool {
    EXTERNAL_LABELS.contains(&label)
}

pub fn is_internal_label(label: &str) -> bool {
    INTERNAL_LABELS.contains(&label)
}

/// Key type implied by a whitelisted label.
pub fn key_type_for_label(label: &str) -> Option<KeyType> {
    match label {
        EXTERNAL_AES | INTERNAL_AES => Some(KeyType::Aes),
        EXTERNAL_DES | INTERNAL_DES => Some(KeyType::Des),
        EXTERNAL_DES3 | INTERNAL_DES3 => Some(KeyType::Des3),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlgorithmCode {
    pub code: u8,
    pub label: &'static str,
    pub key_type: KeyType,
    pub bits: u32,
}

const ALGORITHM_CODES: [AlgorithmCode; 8] = [
    AlgorithmCode { code: 1, label: EXTERNAL_AES, key_type: KeyType::Aes, bits: 256 },
    AlgorithmCode { code: 2, label: EXTERNAL_AES, key_type: KeyType::Aes, bits: 128 },
    AlgorithmCode { code: 3, label: EXTERNAL_DES, key_type: KeyType::Des, bits: 64 },
    AlgorithmCode { code: 4, label: EXTERNAL_DES3, key_type: KeyType::Des3, bits: 192 },
    AlgorithmCode { code: 5, label: INTERNAL_AES, key_type: KeyType::Aes, bits: 256 },
    AlgorithmCode { code: 6, label: INTERNAL_AES, key_type: KeyType::Aes, bits: 128 },
    AlgorithmCode { code: 7, label: INTERNAL_DES, key_type: KeyType::Des, bits: 64 },
    AlgorithmCode { code: 8, label: INTERNAL_DES3, key_type: KeyType::Des3, bits: 192 },
];

pub fn algorithm_code(code: u8) -> Option<AlgorithmCode> {
    ALGORITHM_CODES.into_iter().find(|entry| entry.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_labels() {
        let aes128 = algorithm_code(2).unwrap();
        assert_eq!(aes128.label, "K4_AES");
        assert_eq!(aes128.bits, 128);
        assert_eq!(algorithm_code(8).unwrap().label, "KEY_ENCRIPTION_DES3");
        assert!(algorithm_code(0).is_none());
        assert!(algorithm_code(9).is_none());
    }

    #[test]
    fn whitelists() {
        assert!(is_external_label("K4_DES"));
        assert!(!is_external_label("KEY_ENCRIPTION_DES"));
        assert!(is_internal_label("KEY_ENCRIPTION_AES"));
        assert_eq!(key_type_for_label("K4_DES3"), Some(KeyType::Des3));
        assert_eq!(key_type_for_label(AUDIT_KEY_LABEL), None);
    }
}
