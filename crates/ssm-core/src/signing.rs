//! RSA signing keys for audit entries and issued tokens.
//!
//! Private keys never leave the token and are re-resolved by label for every signature; only
//! the public halves are kept in memory, for local verification.

use crate::{
    attributes::*,
    backend::ObjectHandle,
    error::{SsmError, SsmResult},
    labels::{AUDIT_KEY_LABEL, JWT_KEY_LABEL},
    mechanism::{Mechanism, MechanismType},
    session::Session,
};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

pub const RSA_MODULUS_BITS: u64 = 2048;
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SigningPurpose {
    Audit,
    TokenIssuance,
}

impl SigningPurpose {
    pub const ALL: [SigningPurpose; 2] = [SigningPurpose::Audit, SigningPurpose::TokenIssuance];

    pub fn label(self) -> &'static str {
        match self {
            SigningPurpose::Audit => AUDIT_KEY_LABEL,
            SigningPurpose::TokenIssuance => JWT_KEY_LABEL,
        }
    }
}

/// Public halves of the signing key pairs, loaded once at startup.
#[derive(Clone, Debug)]
pub struct SigningKeys {
    audit: RsaPublicKey,
    token_issuance: RsaPublicKey,
}

impl SigningKeys {
    /// Find each signing key pair by label, generating the missing ones.
    pub fn bootstrap(session: &Session) -> SsmResult<Self> {
        let _reservation = session.token().reserve_key_writes();
        Ok(Self {
            audit: ensure_key_pair(session, SigningPurpose::Audit)?,
            token_issuance: ensure_key_pair(session, SigningPurpose::TokenIssuance)?,
        })
    }

    pub fn public_key(&self, purpose: SigningPurpose) -> &RsaPublicKey {
        match purpose {
            SigningPurpose::Audit => &self.audit,
            SigningPurpose::TokenIssuance => &self.token_issuance,
        }
    }

    /// SHA-256 / PKCS#1 v1.5 signature in the token with the purpose's private key.
    pub fn sign(&self, session: &Session, purpose: SigningPurpose, data: &[u8]) -> SsmResult<Vec<u8>> {
        let private = find_private(session, purpose.label())?.ok_or_else(|| {
            SsmError::NotFound(format!("signing key {}", purpose.label()))
        })?;
        session
            .sign(&Mechanism::Sha256RsaPkcs, private, data)
            .map_err(|err| SsmError::backend_with("C_Sign", MechanismType::Sha256RsaPkcs, err))
    }

    /// Check a signature locally against the cached public key.
    pub fn verify(&self, purpose: SigningPurpose, data: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(data);
        self.public_key(purpose)
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }
}

fn find_one(session: &Session, template: &AttributeTemplate) -> SsmResult<Option<ObjectHandle>> {
    session
        .find_objects(template, Some(1))
        .map(|found| found.into_iter().next())
        .map_err(|err| SsmError::backend("C_FindObjects", err))
}

fn find_private(session: &Session, label: &str) -> SsmResult<Option<ObjectHandle>> {
    let template = AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_PRIVATE_KEY)
        .with_uint(CKA_KEY_TYPE, CKK_RSA)
        .with_bytes(CKA_LABEL, label)
        .with_bool(CKA_SIGN, true);
    find_one(session, &template)
}

fn find_public(session: &Session, label: &str) -> SsmResult<Option<ObjectHandle>> {
    let template = AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_PUBLIC_KEY)
        .with_uint(CKA_KEY_TYPE, CKK_RSA)
        .with_bytes(CKA_LABEL, label);
    find_one(session, &template)
}

fn read_public(session: &Session, object: ObjectHandle) -> SsmResult<RsaPublicKey> {
    let attrs = session
        .get_attributes(object, &[CKA_MODULUS, CKA_PUBLIC_EXPONENT])
        .map_err(|err| SsmError::backend("C_GetAttributeValue", err))?;
    let (Some(modulus), Some(exponent)) = (attrs.bytes(CKA_MODULUS), attrs.bytes(CKA_PUBLIC_EXPONENT))
    else {
        return Err(SsmError::unexpected("RSA key without modulus or exponent"));
    };
    RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from_bytes_be(exponent))
        .map_err(SsmError::unexpected)
}

fn ensure_key_pair(session: &Session, purpose: SigningPurpose) -> SsmResult<RsaPublicKey> {
    let label = purpose.label();
    if let Some(private) = find_private(session, label)? {
        let source = find_public(session, label)?.unwrap_or(private);
        info!(label, "signing key found");
        return read_public(session, source);
    }

    let public_template = AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_PUBLIC_KEY)
        .with_uint(CKA_KEY_TYPE, CKK_RSA)
        .with_bool(CKA_TOKEN, true)
        .with_bool(CKA_VERIFY, true)
        .with_bytes(CKA_LABEL, label)
        .with_uint(CKA_MODULUS_BITS, RSA_MODULUS_BITS)
        .with_bytes(CKA_PUBLIC_EXPONENT, RSA_PUBLIC_EXPONENT.to_vec());
    let private_template = AttributeTemplate::new()
        .with_uint(CKA_CLASS, CKO_PRIVATE_KEY)
        .with_uint(CKA_KEY_TYPE, CKK_RSA)
        .with_bool(CKA_TOKEN, true)
        .with_bool(CKA_PRIVATE, true)
        .with_bool(CKA_SENSITIVE, true)
        .with_bool(CKA_EXTRACTABLE, false)
        .with_bool(CKA_SIGN, true)
        .with_bytes(CKA_LABEL, label);
    let (public, _private) = session
        .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &public_template, &private_template)
        .map_err(|err| {
            SsmError::backend_with("C_GenerateKeyPair", MechanismType::RsaPkcsKeyPairGen, err)
        })?;
    info!(label, bits = RSA_MODULUS_BITS, "signing key pair generated");
    read_public(session, public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{secret::SecretString, soft::SoftToken, token::TokenContext};
    use rsa::traits::PublicKeyParts;
    use std::sync::Arc;

    #[test]
    fn bootstrap_generates_once_and_signs() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let ctx = TokenContext::open(token.clone(), 0, SecretString::new("1234")).unwrap();
        let session = Session::new(ctx.open_authenticated_session().unwrap(), ctx);

        let keys = SigningKeys::bootstrap(&session).unwrap();
        assert_eq!(token.object_count(), 4);
        assert_eq!(keys.public_key(SigningPurpose::Audit).size(), 256);

        let again = SigningKeys::bootstrap(&session).unwrap();
        assert_eq!(token.object_count(), 4);
        assert_eq!(
            again.public_key(SigningPurpose::TokenIssuance),
            keys.public_key(SigningPurpose::TokenIssuance)
        );

        let signature = keys.sign(&session, SigningPurpose::Audit, b"entry").unwrap();
        assert!(keys.verify(SigningPurpose::Audit, b"entry", &signature));
        assert!(!keys.verify(SigningPurpose::Audit, b"entry!", &signature));
        assert!(!keys.verify(SigningPurpose::TokenIssuance, b"entry", &signature));
    }
}
