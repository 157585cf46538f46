use crate::{error::SsmError, mechanism::MechanismType};
use std::collections::HashMap;
use zeroize::Zeroize;

/// Identifier for a PKCS#11 attribute (mirrors CK_ATTRIBUTE_TYPE numeric values).
pub type AttributeId = u32;

pub const CKA_CLASS: AttributeId = 0x0000;
pub const CKA_TOKEN: AttributeId = 0x0001;
pub const CKA_PRIVATE: AttributeId = 0x0002;
pub const CKA_LABEL: AttributeId = 0x0003;
pub const CKA_VALUE: AttributeId = 0x0011;
pub const CKA_KEY_TYPE: AttributeId = 0x0100;
pub const CKA_ID: AttributeId = 0x0102;
pub const CKA_SENSITIVE: AttributeId = 0x0103;
pub const CKA_ENCRYPT: AttributeId = 0x0104;
pub const CKA_DECRYPT: AttributeId = 0x0105;
pub const CKA_WRAP: AttributeId = 0x0106;
pub const CKA_UNWRAP: AttributeId = 0x0107;
pub const CKA_SIGN: AttributeId = 0x0108;
pub const CKA_VERIFY: AttributeId = 0x010A;
pub const CKA_MODULUS: AttributeId = 0x0120;
pub const CKA_MODULUS_BITS: AttributeId = 0x0121;
pub const CKA_PUBLIC_EXPONENT: AttributeId = 0x0122;
pub const CKA_VALUE_LEN: AttributeId = 0x0161;
pub const CKA_EXTRACTABLE: AttributeId = 0x0162;
pub const CKA_ALLOWED_MECHANISMS: AttributeId = 0x4000_0600;

/// CK_OBJECT_CLASS values.
pub const CKO_PUBLIC_KEY: u64 = 0x02;
pub const CKO_PRIVATE_KEY: u64 = 0x03;
pub const CKO_SECRET_KEY: u64 = 0x04;

/// CK_KEY_TYPE for RSA; the symmetric types live on [`crate::mechanism::KeyType`].
pub const CKK_RSA: u64 = 0x00;

/// Supported attribute value representations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Bool(bool),
    Uint(u64),
    Bytes(Vec<u8>),
    Mechanisms(Vec<MechanismType>),
}

/// Template used when creating objects or searching for them via attribute matching.
///
/// Byte values are zeroed when the template is dropped, since import templates carry raw key
/// material in `CKA_VALUE`.
#[derive(Clone, Debug, Default)]
pub struct AttributeTemplate {
    entries: Vec<(AttributeId, AttributeValue)>,
}

impl AttributeTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: AttributeId, value: AttributeValue) {
        self.entries.push((id, value));
    }

    pub fn with(mut self, id: AttributeId, value: AttributeValue) -> Self {
        self.push(id, value);
        self
    }

    pub fn with_bool(self, id: AttributeId, value: bool) -> Self {
        self.with(id, AttributeValue::Bool(value))
    }

    pub fn with_uint(self, id: AttributeId, value: u64) -> Self {
        self.with(id, AttributeValue::Uint(value))
    }

    pub fn with_bytes(self, id: AttributeId, value: impl Into<Vec<u8>>) -> Self {
        self.with(id, AttributeValue::Bytes(value.into()))
    }

    pub fn entries(&self) -> &[(AttributeId, AttributeValue)] {
        &self.entries
    }

    pub fn get(&self, id: AttributeId) -> Option<&AttributeValue> {
        self.entries
            .iter()
            .find_map(|(candidate, value)| (*candidate == id).then_some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for AttributeTemplate {
    fn drop(&mut self) {
        for (_, value) in &mut self.entries {
            if let AttributeValue::Bytes(bytes) = value {
                bytes.zeroize();
            }
        }
    }
}

/// Attributes held by (or read back from) a token object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeSet {
    entries: HashMap<AttributeId, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_template(template: &AttributeTemplate) -> Self {
        let mut set = Self::new();
        for (id, value) in template.entries() {
            set.insert(*id, value.clone());
        }
        set
    }

    pub fn insert(&mut self, id: AttributeId, value: AttributeValue) -> Option<AttributeValue> {
        self.entries.insert(id, value)
    }

    pub fn get(&self, id: AttributeId) -> Option<&AttributeValue> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: AttributeId) -> Option<AttributeValue> {
        self.entries.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeId, &AttributeValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bool(&self, id: AttributeId) -> Option<bool> {
        match self.get(id) {
            Some(AttributeValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn uint(&self, id: AttributeId) -> Option<u64> {
        match self.get(id) {
            Some(AttributeValue::Uint(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn bytes(&self, id: AttributeId) -> Option<&[u8]> {
        match self.get(id) {
            Some(AttributeValue::Bytes(value)) => Some(value),
            _ => None,
        }
    }

    pub fn label(&self) -> Option<String> {
        self.bytes(CKA_LABEL)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn mechanisms(&self) -> Option<&[MechanismType]> {
        match self.get(CKA_ALLOWED_MECHANISMS) {
            Some(AttributeValue::Mechanisms(value)) => Some(value),
            _ => None,
        }
    }

    /// Ensure all required attribute identifiers are present.
    pub fn validate_required(&self, required: &[AttributeId]) -> Result<(), SsmError> {
        for id in required {
            if !self.entries.contains_key(id) {
                return Err(SsmError::invalid(format!("missing attribute {id:#x}")));
            }
        }
        Ok(())
    }

    /// Returns true when all entries in the template match the set exactly.
    pub fn matches_template(&self, template: &AttributeTemplate) -> bool {
        template
            .entries()
            .iter()
            .all(|(id, value)| self.get(*id).is_some_and(|candidate| candidate == value))
    }
}

impl Drop for AttributeSet {
    fn drop(&mut self) {
        if let Some(AttributeValue::Bytes(value)) = self.entries.get_mut(&CKA_VALUE) {
            value.zeroize();
        }
    }
}
