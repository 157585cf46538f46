//! Generate, import, replace and destroy secret keys.
//!
//! Writes hold the token's key-write reservation for their whole check-then-act sequence, so
//! two callers in this process cannot both allocate the same identifier or both create a key
//! at the same (label, identifier).

use crate::{
    attributes::*,
    directory::{encode_id, KeyDirectory, KeyObject},
    error::{SsmError, SsmResult},
    mechanism::{KeyType, MechanismType},
    secret::SecretBytes,
    session::Session,
};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Created,
    /// A key already existed at (label, identifier) and was returned unchanged.
    AlreadyExists,
}

#[derive(Debug)]
pub struct KeyOutcome<'s> {
    pub key: KeyObject<'s>,
    pub status: KeyStatus,
}

impl KeyOutcome<'_> {
    pub fn is_created(&self) -> bool {
        self.status == KeyStatus::Created
    }
}

/// Result of a delete-then-recreate update.
#[derive(Debug)]
pub enum UpdateOutcome<'s> {
    Updated(KeyObject<'s>),
    /// The old key was destroyed but the replacement could not be stored.
    DeletedNotRecreated { label: String, id: u32, error: SsmError },
    /// Nothing was changed on the token.
    FailedKeyIntact(SsmError),
}

impl<'s> UpdateOutcome<'s> {
    pub fn into_result(self) -> SsmResult<KeyObject<'s>> {
        match self {
            UpdateOutcome::Updated(key) => Ok(key),
            UpdateOutcome::DeletedNotRecreated { label, id, error } => {
                Err(SsmError::PartiallyApplied {
                    label,
                    id,
                    source: Box::new(error),
                })
            }
            UpdateOutcome::FailedKeyIntact(error) => Err(error),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteAllReport {
    pub found: usize,
    pub destroyed: usize,
}

impl DeleteAllReport {
    pub fn is_complete(&self) -> bool {
        self.found == self.destroyed
    }
}

fn allowed_mechanisms(key_type: KeyType) -> Option<Vec<MechanismType>> {
    match key_type {
        KeyType::Aes => None,
        KeyType::Des => Some(vec![
            MechanismType::DesCbc,
            MechanismType::DesCbcPad,
            MechanismType::DesEcb,
        ]),
        KeyType::Des3 => Some(vec![
            MechanismType::Des3Cbc,
            MechanismType::Des3CbcPad,
            MechanismType::Des3Ecb,
            MechanismType::Des3Cmac,
        ]),
    }
}

/// Attributes shared by generated and imported keys: token-resident, sensitive, usable for
/// encrypt/decrypt and wrap/unwrap, and limited to the family's modes where the family has a list.
fn key_template(key_type: KeyType, label: &str, id: u32) -> AttributeTemplate {
    let mut template = AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_SECRET_KEY)
        .with_uint(CKA_KEY_TYPE, key_type.code())
        .with_bytes(CKA_LABEL, label)
        .with_bytes(CKA_ID, encode_id(id))
        .with_bool(CKA_TOKEN, true)
        .with_bool(CKA_PRIVATE, true)
        .with_bool(CKA_SENSITIVE, true)
        .with_bool(CKA_EXTRACTABLE, false)
        .with_bool(CKA_ENCRYPT, true)
        .with_bool(CKA_DECRYPT, true)
        .with_bool(CKA_WRAP, true)
        .with_bool(CKA_UNWRAP, true);
    if let Some(allowed) = allowed_mechanisms(key_type) {
        template.push(CKA_ALLOWED_MECHANISMS, AttributeValue::Mechanisms(allowed));
    }
    template
}

fn generation_template(key_type: KeyType, label: &str, id: u32, bits: u32) -> AttributeTemplate {
    let mut template = key_template(key_type, label, id);
    if key_type == KeyType::Aes {
        template.push(CKA_VALUE_LEN, AttributeValue::Uint(u64::from(bits / 8)));
    }
    template
}

fn import_template(key_type: KeyType, label: &str, id: u32, key: &SecretBytes) -> AttributeTemplate {
    key_template(key_type, label, id).with_bytes(CKA_VALUE, key.expose())
}

pub struct KeyLifecycle<'s> {
    session: &'s Session,
    directory: KeyDirectory<'s>,
}

impl<'s> KeyLifecycle<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self {
            session,
            directory: KeyDirectory::new(session),
        }
    }

    pub fn directory(&self) -> &KeyDirectory<'s> {
        &self.directory
    }

    /// Generate a key in the token. `id` of `None` or 0 allocates the next identifier;
    /// `bits` of `None` uses the family default.
    pub fn generate(
        &self,
        key_type: KeyType,
        label: &str,
        id: Option<u32>,
        bits: Option<u32>,
    ) -> SsmResult<KeyOutcome<'s>> {
        let bits = key_type.resolve_bits(bits)?;
        let _reservation = self.session.token().reserve_key_writes();
        let id = self.resolve_id(label, id)?;
        if let Some(existing) = self.existing(label, id)? {
            return Ok(existing);
        }

        let mechanism = key_type.generation_mechanism();
        let template = generation_template(key_type, label, id, bits);
        self.session
            .generate_key(&mechanism, &template)
            .map_err(|err| SsmError::backend_with("C_GenerateKey", mechanism.mechanism_type(), err))?;
        let key = self.directory.find_key(label, Some(id))?;
        info!(label, id, %key_type, bits, "key generated");
        Ok(KeyOutcome {
            key,
            status: KeyStatus::Created,
        })
    }

    /// Import raw key bytes. `id` of 0 allocates the next identifier.
    pub fn store(
        &self,
        label: &str,
        key: &SecretBytes,
        id: u32,
        key_type: KeyType,
    ) -> SsmResult<KeyOutcome<'s>> {
        key_type.check_key_len(key.len())?;
        let _reservation = self.session.token().reserve_key_writes();
        let id = self.resolve_id(label, Some(id))?;
        if let Some(existing) = self.existing(label, id)? {
            return Ok(existing);
        }
        self.import(label, key, id, key_type)
    }

    /// Replace the key at (label, id) by deleting it and importing `key`.
    pub fn update(
        &self,
        label: &str,
        key: &SecretBytes,
        id: u32,
        key_type: KeyType,
    ) -> UpdateOutcome<'s> {
        if let Err(err) = key_type.check_key_len(key.len()) {
            return UpdateOutcome::FailedKeyIntact(err);
        }
        let _reservation = self.session.token().reserve_key_writes();
        let current = match self.directory.find_key(label, Some(id)) {
            Ok(current) => current,
            Err(err) => return UpdateOutcome::FailedKeyIntact(err),
        };
        if let Err(err) = self.session.destroy_object(current.handle()) {
            return UpdateOutcome::FailedKeyIntact(SsmError::backend("C_DestroyObject", err));
        }
        match self.import(label, key, id, key_type) {
            Ok(outcome) => UpdateOutcome::Updated(outcome.key),
            Err(err) => {
                error!(label, id, error = %err, "key deleted during update but not recreated");
                UpdateOutcome::DeletedNotRecreated {
                    label: label.to_string(),
                    id,
                    error: err,
                }
            }
        }
    }

    pub fn delete(&self, label: &str, id: u32) -> SsmResult<()> {
        let _reservation = self.session.token().reserve_key_writes();
        let key = self.directory.find_key(label, Some(id))?;
        self.session
            .destroy_object(key.handle())
            .map_err(|err| SsmError::backend("C_DestroyObject", err))?;
        info!(label, id, "key deleted");
        Ok(())
    }

    /// Destroy every secret key on the token. Failures are logged and skipped.
    pub fn delete_all(&self) -> SsmResult<DeleteAllReport> {
        let _reservation = self.session.token().reserve_key_writes();
        let template = AttributeTemplate::new().with_uint(CKA_CLASS, CKO_SECRET_KEY);
        let handles = self
            .session
            .find_objects(&template, None)
            .map_err(|err| SsmError::backend("C_FindObjects", err))?;
        let mut report = DeleteAllReport {
            found: handles.len(),
            destroyed: 0,
        };
        for handle in handles {
            match self.session.destroy_object(handle) {
                Ok(()) => report.destroyed += 1,
                Err(err) => warn!(handle, error = %err, "failed to destroy key"),
            }
        }
        info!(found = report.found, destroyed = report.destroyed, "bulk key deletion finished");
        Ok(report)
    }

    fn resolve_id(&self, label: &str, id: Option<u32>) -> SsmResult<u32> {
        match id.filter(|id| *id != 0) {
            Some(id) => Ok(id),
            None => self.directory.next_identifier(label),
        }
    }

    fn existing(&self, label: &str, id: u32) -> SsmResult<Option<KeyOutcome<'s>>> {
        match self.directory.find_key(label, Some(id)) {
            Ok(key) => {
                info!(label, id, "key already exists");
                Ok(Some(KeyOutcome {
                    key,
                    status: KeyStatus::AlreadyExists,
                }))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn import(
        &self,
        label: &str,
        key: &SecretBytes,
        id: u32,
        key_type: KeyType,
    ) -> SsmResult<KeyOutcome<'s>> {
        let template = import_template(key_type, label, id, key);
        self.session
            .create_object(&template)
            .map_err(|err| SsmError::backend("C_CreateObject", err))?;
        let key = self.directory.find_key(label, Some(id))?;
        info!(label, id, %key_type, "key stored");
        Ok(KeyOutcome {
            key,
            status: KeyStatus::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::ReturnValue, secret::SecretString, soft::SoftToken, token::TokenContext,
    };
    use std::sync::Arc;

    fn session() -> (Arc<SoftToken>, Session) {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let ctx = TokenContext::open(token.clone(), 0, SecretString::new("1234")).unwrap();
        let handle = ctx.open_authenticated_session().unwrap();
        (token, Session::new(handle, ctx))
    }

    #[test]
    fn generate_allocates_and_is_idempotent() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);

        let first = lifecycle.generate(KeyType::Aes, "internal-aes", Some(0), None).unwrap();
        assert!(first.is_created());
        assert_eq!(first.key.id(), 1);
        assert_eq!(first.key.bits(), 256);

        let again = lifecycle.generate(KeyType::Aes, "internal-aes", Some(1), None).unwrap();
        assert_eq!(again.status, KeyStatus::AlreadyExists);
        assert_eq!(again.key.id(), 1);
        assert_eq!(token.object_count(), 1);

        let second = lifecycle.generate(KeyType::Aes, "internal-aes", None, Some(128)).unwrap();
        assert_eq!(second.key.id(), 2);
        assert_eq!(second.key.bits(), 128);
    }

    #[test]
    fn invalid_size_is_rejected_before_token_calls() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        assert!(matches!(
            lifecycle.generate(KeyType::Aes, "K4_AES", None, Some(100)),
            Err(SsmError::InvalidRequest(_))
        ));
        assert!(lifecycle
            .store("K4_DES", &SecretBytes::copy_from(&[1; 7]), 1, KeyType::Des)
            .is_err());
        assert_eq!(token.object_count(), 0);
    }

    #[test]
    fn store_then_update_replaces_the_key() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        let stored = lifecycle
            .store("K4_DES3", &SecretBytes::copy_from(&[3; 16]), 5, KeyType::Des3)
            .unwrap();
        assert!(stored.is_created());
        assert_eq!(stored.key.bits(), 192);

        let updated = lifecycle
            .update("K4_DES3", &SecretBytes::copy_from(&[4; 24]), 5, KeyType::Des3)
            .into_result()
            .unwrap();
        assert_eq!(updated.id(), 5);
        assert_eq!(token.object_count(), 1);
    }

    #[test]
    fn update_reports_deleted_but_not_recreated() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        lifecycle
            .store("K4_AES", &SecretBytes::copy_from(&[1; 32]), 1, KeyType::Aes)
            .unwrap();

        token.inject_failure("C_CreateObject", ReturnValue::GeneralError);
        let outcome = lifecycle.update("K4_AES", &SecretBytes::copy_from(&[2; 32]), 1, KeyType::Aes);
        assert!(matches!(outcome, UpdateOutcome::DeletedNotRecreated { id: 1, .. }));
        assert!(matches!(
            outcome.into_result(),
            Err(SsmError::PartiallyApplied { .. })
        ));
        assert!(lifecycle.directory().find_key("K4_AES", Some(1)).unwrap_err().is_not_found());
    }

    #[test]
    fn update_failure_before_delete_keeps_the_key() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        lifecycle
            .store("K4_AES", &SecretBytes::copy_from(&[1; 16]), 1, KeyType::Aes)
            .unwrap();

        let bad_len = lifecycle.update("K4_AES", &SecretBytes::copy_from(&[2; 5]), 1, KeyType::Aes);
        assert!(matches!(bad_len, UpdateOutcome::FailedKeyIntact(_)));

        token.inject_failure("C_DestroyObject", ReturnValue::GeneralError);
        let refused = lifecycle.update("K4_AES", &SecretBytes::copy_from(&[2; 16]), 1, KeyType::Aes);
        assert!(matches!(refused, UpdateOutcome::FailedKeyIntact(_)));

        let missing = lifecycle.update("K4_AES", &SecretBytes::copy_from(&[2; 16]), 9, KeyType::Aes);
        assert!(matches!(missing, UpdateOutcome::FailedKeyIntact(SsmError::NotFound(_))));
        assert!(lifecycle.directory().find_key("K4_AES", Some(1)).is_ok());
    }

    #[test]
    fn delete_and_delete_all() {
        let (token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        lifecycle.generate(KeyType::Des, "K4_DES", None, None).unwrap();
        lifecycle.generate(KeyType::Des, "K4_DES", None, None).unwrap();
        lifecycle.generate(KeyType::Aes, "K4_AES", None, None).unwrap();

        lifecycle.delete("K4_DES", 1).unwrap();
        assert!(lifecycle.delete("K4_DES", 1).unwrap_err().is_not_found());

        let report = lifecycle.delete_all().unwrap();
        assert_eq!(report, DeleteAllReport { found: 2, destroyed: 2 });
        assert!(report.is_complete());
        assert_eq!(token.object_count(), 0);
    }

    #[test]
    fn des_keys_are_limited_to_des_modes() {
        let (_token, session) = session();
        let lifecycle = KeyLifecycle::new(&session);
        let key = lifecycle.generate(KeyType::Des, "K4_DES", None, None).unwrap().key;
        let attrs = session
            .get_attributes(key.handle(), &[CKA_ALLOWED_MECHANISMS, CKA_EXTRACTABLE])
            .unwrap();
        assert_eq!(
            attrs.mechanisms(),
            Some(&[MechanismType::DesCbc, MechanismType::DesCbcPad, MechanismType::DesEcb][..])
        );
        assert_eq!(attrs.bool(CKA_EXTRACTABLE), Some(false));
    }
}
