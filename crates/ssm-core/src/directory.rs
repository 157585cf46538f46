//! Key lookup by (label, identifier).
//!
//! Object handles are only valid inside the session that produced them, so a [`KeyObject`]
//! borrows its [`Session`] and cannot outlive it. Every operation re-queries the token.

use crate::{
    attributes::*,
    backend::ObjectHandle,
    error::{SsmError, SsmResult},
    mechanism::KeyType,
    session::Session,
};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Logical description of a secret key, independent of any session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub label: String,
    pub id: u32,
    pub key_type: KeyType,
    pub bits: u32,
}

/// A secret key resolved within one session.
#[derive(Debug)]
pub struct KeyObject<'s> {
    session: &'s Session,
    handle: ObjectHandle,
    info: KeyInfo,
}

impl<'s> KeyObject<'s> {
    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn info(&self) -> &KeyInfo {
        &self.info
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn key_type(&self) -> KeyType {
        self.info.key_type
    }

    pub fn bits(&self) -> u32 {
        self.info.bits
    }
}

/// CKA_ID wire form: 4-byte big-endian.
pub fn encode_id(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Decode a big-endian CKA_ID of 1 to 8 bytes. Values beyond `u32` are rejected.
pub fn decode_id(raw: &[u8]) -> Option<u32> {
    if raw.is_empty() || raw.len() > 8 {
        return None;
    }
    let value = raw.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    u32::try_from(value).ok()
}

fn secret_key_template(label: &str) -> AttributeTemplate {
    AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_SECRET_KEY)
        .with_bytes(CKA_LABEL, label)
}

pub struct KeyDirectory<'s> {
    session: &'s Session,
}

impl<'s> KeyDirectory<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }

    /// First secret key under `label`, narrowed to `id` when given.
    pub fn find_key(&self, label: &str, id: Option<u32>) -> SsmResult<KeyObject<'s>> {
        let mut template = secret_key_template(label);
        if let Some(id) = id {
            template.push(CKA_ID, AttributeValue::Bytes(encode_id(id)));
        }
        let handles = self
            .session
            .find_objects(&template, None)
            .map_err(|err| SsmError::backend("C_FindObjects", err))?;
        for handle in handles {
            if let Some(key) = self.describe(handle)? {
                return Ok(key);
            }
        }
        Err(SsmError::NotFound(match id {
            Some(id) => format!("{label}/{id}"),
            None => label.to_string(),
        }))
    }

    /// Every secret key under `label`. An empty result is `NotFound`.
    pub fn find_keys_by_label(&self, label: &str) -> SsmResult<Vec<KeyObject<'s>>> {
        let keys = self.collect(&secret_key_template(label))?;
        if keys.is_empty() {
            return Err(SsmError::NotFound(label.to_string()));
        }
        Ok(keys)
    }

    /// Every secret key on the token grouped by label. An empty token yields an empty map.
    pub fn find_all_keys(&self) -> SsmResult<BTreeMap<String, Vec<KeyObject<'s>>>> {
        let template = AttributeTemplate::new().with_uint(CKA_CLASS, CKO_SECRET_KEY);
        let mut grouped: BTreeMap<String, Vec<KeyObject<'s>>> = BTreeMap::new();
        for key in self.collect(&template)? {
            grouped.entry(key.info.label.clone()).or_default().push(key);
        }
        Ok(grouped)
    }

    /// Any key under `label`, chosen uniformly.
    pub fn random_key_for_label(&self, label: &str) -> SsmResult<KeyObject<'s>> {
        let mut keys = self.find_keys_by_label(label)?;
        let pick = rand::thread_rng().gen_range(0..keys.len());
        Ok(keys.swap_remove(pick))
    }

    /// Highest identifier under `label` plus one, or 1 for a new label.
    pub fn next_identifier(&self, label: &str) -> SsmResult<u32> {
        match self.find_keys_by_label(label) {
            Ok(keys) => keys
                .iter()
                .map(KeyObject::id)
                .max()
                .unwrap_or(0)
                .checked_add(1)
                .ok_or_else(|| SsmError::invalid(format!("identifier space exhausted for {label}"))),
            Err(err) if err.is_not_found() => Ok(1),
            Err(err) => Err(err),
        }
    }

    fn collect(&self, template: &AttributeTemplate) -> SsmResult<Vec<KeyObject<'s>>> {
        let handles = self
            .session
            .find_objects(template, None)
            .map_err(|err| SsmError::backend("C_FindObjects", err))?;
        let mut keys = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(key) = self.describe(handle)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Read back the logical attributes; `None` for secret keys of a family we do not manage.
    fn describe(&self, handle: ObjectHandle) -> SsmResult<Option<KeyObject<'s>>> {
        let attrs = self
            .session
            .get_attributes(handle, &[CKA_LABEL, CKA_ID, CKA_KEY_TYPE, CKA_VALUE_LEN])
            .map_err(|err| SsmError::backend("C_GetAttributeValue", err))?;
        let Some(key_type) = attrs.uint(CKA_KEY_TYPE).and_then(KeyType::from_code) else {
            debug!(handle, "skipping secret key of unmanaged type");
            return Ok(None);
        };
        let bits = match key_type {
            KeyType::Aes => attrs.uint(CKA_VALUE_LEN).map_or(0, |len| len as u32 * 8),
            KeyType::Des => 64,
            KeyType::Des3 => 192,
        };
        let info = KeyInfo {
            label: attrs.label().unwrap_or_default(),
            id: attrs.bytes(CKA_ID).and_then(decode_id).unwrap_or(0),
            key_type,
            bits,
        };
        Ok(Some(KeyObject {
            session: self.session,
            handle,
            info,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mechanism::Mechanism, secret::SecretString, soft::SoftToken, token::TokenContext,
    };
    use std::sync::Arc;

    fn session() -> Session {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let ctx = TokenContext::open(token, 0, SecretString::new("1234")).unwrap();
        let handle = ctx.open_authenticated_session().unwrap();
        Session::new(handle, ctx)
    }

    fn put(session: &Session, label: &str, id: u32, key_type: KeyType) {
        let mut template = AttributeTemplate::new()
            .with_uint(CKA_CLASS, CKO_SECRET_KEY)
            .with_bytes(CKA_LABEL, label)
            .with_bytes(CKA_ID, encode_id(id))
            .with_bool(CKA_ENCRYPT, true);
        if key_type == KeyType::Aes {
            template.push(CKA_VALUE_LEN, AttributeValue::Uint(16));
        }
        session
            .generate_key(&key_type.generation_mechanism(), &template)
            .unwrap();
    }

    #[test]
    fn id_codec() {
        assert_eq!(encode_id(1), vec![0, 0, 0, 1]);
        assert_eq!(decode_id(&[0, 0, 1, 0]), Some(256));
        assert_eq!(decode_id(&[7]), Some(7));
        assert_eq!(decode_id(&[0, 0, 0, 0, 0, 0, 0, 9]), Some(9));
        assert_eq!(decode_id(&[1, 0, 0, 0, 0]), None);
        assert_eq!(decode_id(&[]), None);
    }

    #[test]
    fn find_key_by_label_and_id() {
        let session = session();
        put(&session, "K4_AES", 1, KeyType::Aes);
        put(&session, "K4_AES", 2, KeyType::Aes);
        let dir = KeyDirectory::new(&session);

        let key = dir.find_key("K4_AES", Some(2)).unwrap();
        assert_eq!(key.id(), 2);
        assert_eq!(key.bits(), 128);
        assert!(dir.find_key("K4_AES", None).is_ok());
        assert!(dir.find_key("K4_AES", Some(3)).unwrap_err().is_not_found());
        assert!(dir.find_key("missing", None).unwrap_err().is_not_found());
    }

    #[test]
    fn empty_label_is_not_found_but_empty_token_lists_nothing() {
        let session = session();
        let dir = KeyDirectory::new(&session);
        assert!(dir.find_keys_by_label("K4_DES").unwrap_err().is_not_found());
        assert!(dir.random_key_for_label("K4_DES").unwrap_err().is_not_found());
        assert!(dir.find_all_keys().unwrap().is_empty());
        assert_eq!(dir.next_identifier("K4_DES").unwrap(), 1);
    }

    #[test]
    fn grouping_and_allocation() {
        let session = session();
        put(&session, "K4_DES", 4, KeyType::Des);
        put(&session, "K4_DES", 9, KeyType::Des);
        put(&session, "K4_DES3", 1, KeyType::Des3);
        let dir = KeyDirectory::new(&session);

        let all = dir.find_all_keys().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["K4_DES"].len(), 2);
        assert_eq!(all["K4_DES3"][0].bits(), 192);
        assert_eq!(dir.next_identifier("K4_DES").unwrap(), 10);

        let picked = dir.random_key_for_label("K4_DES").unwrap();
        assert!([4, 9].contains(&picked.id()));
        assert_eq!(picked.key_type(), KeyType::Des);
    }

    #[test]
    fn rsa_keys_are_not_listed() {
        let session = session();
        let public = AttributeTemplate::new()
            .with_bytes(CKA_LABEL, "rsa")
            .with_uint(CKA_MODULUS_BITS, 1024);
        session
            .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &public, &AttributeTemplate::new())
            .unwrap();
        let dir = KeyDirectory::new(&session);
        assert!(dir.find_all_keys().unwrap().is_empty());
    }
}
