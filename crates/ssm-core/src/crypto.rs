//! Symmetric encryption through the token.
//!
//! AES, DES and DES3 start with CBC-PAD and fall back through CBC, ECB and ECB-ENCRYPT-DATA, but
//! only when the token rejects the mechanism itself. Data errors end the call. AES-GCM has no
//! fallback and any decrypt failure is reported as [`SsmError::AuthenticationFailed`].
//!
//! Caller plaintext is wiped before these functions return, on every path.

use crate::{
    backend::BackendResult,
    directory::KeyObject,
    error::{SsmError, SsmResult},
    mechanism::{GcmParams, KeyType, Mechanism, MechanismType},
    secret::{Scrubbed, SecretBytes},
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::{debug, warn};

pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const GCM_TAG_BITS: u32 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    Aes,
    Des,
    Des3,
    AesGcm,
}

impl Algorithm {
    pub fn key_type(self) -> KeyType {
        match self {
            Algorithm::Aes | Algorithm::AesGcm => KeyType::Aes,
            Algorithm::Des => KeyType::Des,
            Algorithm::Des3 => KeyType::Des3,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            Algorithm::AesGcm => GCM_IV_LEN,
            other => other.key_type().block_len(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes => "AES",
            Algorithm::Des => "DES",
            Algorithm::Des3 => "DES3",
            Algorithm::AesGcm => "AES_GCM",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = SsmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "AES" => Ok(Algorithm::Aes),
            "DES" => Ok(Algorithm::Des),
            "DES3" | "3DES" => Ok(Algorithm::Des3),
            "AES_GCM" | "GCM" => Ok(Algorithm::AesGcm),
            other => Err(SsmError::MechanismUnsupported(other.to_string())),
        }
    }
}

/// Ciphertext plus the mechanism that produced it, needed to decrypt after a fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub data: Vec<u8>,
    pub mechanism: MechanismType,
}

/// Fresh random IV of the right length for `algorithm`.
pub fn generate_iv(algorithm: Algorithm) -> Vec<u8> {
    let mut iv = vec![0u8; algorithm.iv_len()];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn check_key(key: &KeyObject<'_>, algorithm: Algorithm) -> SsmResult<()> {
    if key.key_type() == algorithm.key_type() {
        Ok(())
    } else {
        Err(SsmError::invalid(format!(
            "{algorithm} cannot use {} key {}/{}",
            key.key_type(),
            key.label(),
            key.id()
        )))
    }
}

fn check_iv(algorithm: Algorithm, iv: &[u8]) -> SsmResult<()> {
    if iv.len() == algorithm.iv_len() {
        Ok(())
    } else {
        Err(SsmError::IvInvalid(format!(
            "{algorithm} needs a {}-byte IV, got {}",
            algorithm.iv_len(),
            iv.len()
        )))
    }
}

/// Mechanisms to try for a block cipher family, most preferred first.
fn fallback_chain(key_type: KeyType, iv: &[u8]) -> SsmResult<Vec<Mechanism>> {
    let invalid = |_| SsmError::IvInvalid(format!("{key_type} needs a {}-byte IV", key_type.block_len()));
    let chain = match key_type {
        KeyType::Aes => {
            let iv: [u8; 16] = iv.try_into().map_err(invalid)?;
            vec![
                Mechanism::AesCbcPad(iv),
                Mechanism::AesCbc(iv),
                Mechanism::AesEcb,
                Mechanism::AesEcbEncryptData,
            ]
        }
        KeyType::Des => {
            let iv: [u8; 8] = iv.try_into().map_err(invalid)?;
            vec![
                Mechanism::DesCbcPad(iv),
                Mechanism::DesCbc(iv),
                Mechanism::DesEcb,
                Mechanism::DesEcbEncryptData,
            ]
        }
        KeyType::Des3 => {
            let iv: [u8; 8] = iv.try_into().map_err(invalid)?;
            vec![
                Mechanism::Des3CbcPad(iv),
                Mechanism::Des3Cbc(iv),
                Mechanism::Des3Ecb,
                Mechanism::Des3EcbEncryptData,
            ]
        }
    };
    Ok(chain)
}

fn with_fallback<T>(
    key: &KeyObject<'_>,
    operation: &'static str,
    chain: Vec<Mechanism>,
    mut op: impl FnMut(&Mechanism) -> BackendResult<T>,
) -> SsmResult<(T, MechanismType)> {
    for mechanism in &chain {
        let mechanism_type = mechanism.mechanism_type();
        match op(mechanism) {
            Ok(value) => return Ok((value, mechanism_type)),
            Err(err) if err.is_mechanism_rejection() => {
                debug!(
                    label = key.label(),
                    id = key.id(),
                    mechanism = %mechanism_type,
                    error = %err,
                    "mechanism rejected, trying next mode"
                );
            }
            Err(err) => return Err(SsmError::backend_with(operation, mechanism_type, err)),
        }
    }
    Err(SsmError::MechanismUnsupported(format!(
        "token accepted no {} mode for {}/{}",
        key.key_type(),
        key.label(),
        key.id()
    )))
}

/// Encrypt `plaintext` under `key`. The buffer is zeroed before returning.
pub fn encrypt(
    key: &KeyObject<'_>,
    algorithm: Algorithm,
    iv: &[u8],
    plaintext: &mut [u8],
) -> SsmResult<Ciphertext> {
    if algorithm == Algorithm::AesGcm {
        return encrypt_gcm(key, iv, plaintext, None).map(|data| Ciphertext {
            data,
            mechanism: MechanismType::AesGcm,
        });
    }
    let plaintext = Scrubbed::new(plaintext);
    check_key(key, algorithm)?;
    check_iv(algorithm, iv)?;
    let chain = fallback_chain(algorithm.key_type(), iv)?;
    let session = key.session();
    let (data, mechanism) = with_fallback(key, "C_Encrypt", chain, |mechanism| {
        session.encrypt(mechanism, key.handle(), &plaintext)
    })?;
    debug!(label = key.label(), id = key.id(), %mechanism, "encrypted");
    Ok(Ciphertext { data, mechanism })
}

/// Decrypt, trying the same mode order as [`encrypt`].
pub fn decrypt(
    key: &KeyObject<'_>,
    algorithm: Algorithm,
    iv: &[u8],
    ciphertext: &[u8],
) -> SsmResult<SecretBytes> {
    if algorithm == Algorithm::AesGcm {
        return decrypt_gcm(key, iv, ciphertext, None);
    }
    check_key(key, algorithm)?;
    check_iv(algorithm, iv)?;
    let chain = fallback_chain(algorithm.key_type(), iv)?;
    let session = key.session();
    with_fallback(key, "C_Decrypt", chain, |mechanism| {
        session.decrypt(mechanism, key.handle(), ciphertext)
    })
    .map(|(plaintext, _)| plaintext)
}

/// Decrypt with exactly the mechanism recorded at encryption time.
pub fn decrypt_with(
    key: &KeyObject<'_>,
    mechanism: MechanismType,
    iv: &[u8],
    ciphertext: &[u8],
) -> SsmResult<SecretBytes> {
    if mechanism == MechanismType::AesGcm {
        return decrypt_gcm(key, iv, ciphertext, None);
    }
    let algorithm = match key.key_type() {
        KeyType::Aes => Algorithm::Aes,
        KeyType::Des => Algorithm::Des,
        KeyType::Des3 => Algorithm::Des3,
    };
    check_iv(algorithm, iv)?;
    let selected = fallback_chain(key.key_type(), iv)?
        .into_iter()
        .find(|candidate| candidate.mechanism_type() == mechanism)
        .ok_or_else(|| {
            SsmError::MechanismUnsupported(format!("{mechanism} with a {} key", key.key_type()))
        })?;
    key.session()
        .decrypt(&selected, key.handle(), ciphertext)
        .map_err(|err| SsmError::backend_with("C_Decrypt", mechanism, err))
}

fn gcm_mechanism(iv: &[u8], aad: Option<&[u8]>) -> Mechanism {
    Mechanism::AesGcm(GcmParams {
        iv: iv.to_vec(),
        aad: aad.map(<[u8]>::to_vec).unwrap_or_default(),
        tag_bits: GCM_TAG_BITS,
    })
}

/// AES-GCM encrypt; returns ciphertext with the 16-byte tag appended.
pub fn encrypt_gcm(
    key: &KeyObject<'_>,
    iv: &[u8],
    plaintext: &mut [u8],
    aad: Option<&[u8]>,
) -> SsmResult<Vec<u8>> {
    let plaintext = Scrubbed::new(plaintext);
    check_key(key, Algorithm::AesGcm)?;
    check_iv(Algorithm::AesGcm, iv)?;
    key.session()
        .encrypt(&gcm_mechanism(iv, aad), key.handle(), &plaintext)
        .map_err(|err| SsmError::backend_with("C_Encrypt", MechanismType::AesGcm, err))
}

/// AES-GCM decrypt of ciphertext-with-tag.
pub fn decrypt_gcm(
    key: &KeyObject<'_>,
    iv: &[u8],
    data: &[u8],
    aad: Option<&[u8]>,
) -> SsmResult<SecretBytes> {
    check_iv(Algorithm::AesGcm, iv)?;
    if data.len() < GCM_TAG_LEN {
        return Err(SsmError::IvInvalid(format!(
            "ciphertext of {} bytes is shorter than the {GCM_TAG_LEN}-byte tag",
            data.len()
        )));
    }
    check_key(key, Algorithm::AesGcm)?;
    key.session()
        .decrypt(&gcm_mechanism(iv, aad), key.handle(), data)
        .map_err(|err| {
            warn!(
                label = key.label(),
                id = key.id(),
                error = %err,
                "GCM decryption rejected, possible tampering"
            );
            SsmError::AuthenticationFailed
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::KeyLifecycle, secret::SecretString, session::Session, soft::SoftToken,
        token::TokenContext,
    };
    use std::sync::Arc;

    fn session(token: &Arc<SoftToken>) -> Session {
        let ctx = TokenContext::open(token.clone(), 0, SecretString::new("1234")).unwrap();
        let handle = ctx.open_authenticated_session().unwrap();
        Session::new(handle, ctx)
    }

    #[test]
    fn cbc_pad_round_trip_scrubs_plaintext() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let session = session(&token);
        let key = KeyLifecycle::new(&session)
            .generate(KeyType::Aes, "K4_AES", None, None)
            .unwrap()
            .key;
        let iv = generate_iv(Algorithm::Aes);
        let mut plaintext = b"Hello".to_vec();

        let sealed = encrypt(&key, Algorithm::Aes, &iv, &mut plaintext).unwrap();
        assert_eq!(sealed.mechanism, MechanismType::AesCbcPad);
        assert!(plaintext.iter().all(|b| *b == 0));

        let opened = decrypt(&key, Algorithm::Aes, &iv, &sealed.data).unwrap();
        assert_eq!(opened.expose(), b"Hello");
    }

    #[test]
    fn falls_back_on_mechanism_rejection_only() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        token.disable_mechanism(MechanismType::DesCbcPad);
        let session = session(&token);
        let key = KeyLifecycle::new(&session)
            .generate(KeyType::Des, "K4_DES", None, None)
            .unwrap()
            .key;
        let iv = generate_iv(Algorithm::Des);

        let mut aligned = [5u8; 16];
        let sealed = encrypt(&key, Algorithm::Des, &iv, &mut aligned).unwrap();
        assert_eq!(sealed.mechanism, MechanismType::DesCbc);
        let opened = decrypt_with(&key, sealed.mechanism, &iv, &sealed.data).unwrap();
        assert_eq!(opened.expose(), &[5u8; 16]);

        // CBC without padding refuses the data; that is not a reason to try ECB
        let mut unaligned = b"odd".to_vec();
        let err = encrypt(&key, Algorithm::Des, &iv, &mut unaligned).unwrap_err();
        assert!(matches!(
            err,
            SsmError::Backend {
                mechanism: Some(MechanismType::DesCbc),
                ..
            }
        ));
        assert!(unaligned.iter().all(|b| *b == 0));
    }

    #[test]
    fn exhausted_chain_is_mechanism_unsupported() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        for mechanism in [
            MechanismType::Des3CbcPad,
            MechanismType::Des3Cbc,
            MechanismType::Des3Ecb,
        ] {
            token.disable_mechanism(mechanism);
        }
        let session = session(&token);
        let key = KeyLifecycle::new(&session)
            .generate(KeyType::Des3, "K4_DES3", None, None)
            .unwrap()
            .key;
        let mut data = [1u8; 8];
        let err = encrypt(&key, Algorithm::Des3, &[0; 8], &mut data).unwrap_err();
        assert!(matches!(err, SsmError::MechanismUnsupported(_)));
    }

    #[test]
    fn iv_and_key_family_checked_first() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let session = session(&token);
        let key = KeyLifecycle::new(&session)
            .generate(KeyType::Aes, "K4_AES", None, None)
            .unwrap()
            .key;
        let mut data = b"secret".to_vec();
        assert!(matches!(
            encrypt(&key, Algorithm::Aes, &[0; 8], &mut data),
            Err(SsmError::IvInvalid(_))
        ));
        assert!(data.iter().all(|b| *b == 0));
        let mut data = b"secret".to_vec();
        assert!(matches!(
            encrypt(&key, Algorithm::Des, &[0; 8], &mut data),
            Err(SsmError::InvalidRequest(_))
        ));
    }

    #[test]
    fn gcm_round_trip_and_tamper_detection() {
        let token = Arc::new(SoftToken::new(0, "1234"));
        let session = session(&token);
        let key = KeyLifecycle::new(&session)
            .generate(KeyType::Aes, "K4_AES", None, Some(128))
            .unwrap()
            .key;
        let iv = generate_iv(Algorithm::AesGcm);
        let mut plaintext = b"card data".to_vec();
        let sealed = encrypt_gcm(&key, &iv, &mut plaintext, Some(b"ctx".as_slice())).unwrap();
        assert_eq!(sealed.len(), 9 + GCM_TAG_LEN);

        let opened = decrypt_gcm(&key, &iv, &sealed, Some(b"ctx".as_slice())).unwrap();
        assert_eq!(opened.expose(), b"card data");

        let mut flipped = sealed.clone();
        flipped[0] ^= 1;
        assert!(matches!(
            decrypt_gcm(&key, &iv, &flipped, Some(b"ctx".as_slice())),
            Err(SsmError::AuthenticationFailed)
        ));
        // The tag is the trailing GCM_TAG_LEN bytes.
        let mut bad_tag = sealed.clone();
        if let Some(last) = bad_tag.last_mut() {
            *last ^= 0x80;
        }
        assert_eq!(bad_tag[..9], sealed[..9]);
        assert!(matches!(
            decrypt_gcm(&key, &iv, &bad_tag, Some(b"ctx".as_slice())),
            Err(SsmError::AuthenticationFailed)
        ));
        assert!(matches!(
            decrypt_gcm(&key, &iv, &sealed, Some(b"other".as_slice())),
            Err(SsmError::AuthenticationFailed)
        ));
        assert!(matches!(
            decrypt_gcm(&key, &iv, &sealed[..15], None),
            Err(SsmError::IvInvalid(_))
        ));
    }

    #[test]
    fn algorithm_names() {
        assert_eq!("aes-gcm".parse::<Algorithm>().unwrap(), Algorithm::AesGcm);
        assert_eq!(Algorithm::Des3.iv_len(), 8);
        assert_eq!(
            serde_json::to_string(&Algorithm::AesGcm).unwrap(),
            "\"AES_GCM\""
        );
        assert!(matches!(
            "rc4".parse::<Algorithm>(),
            Err(SsmError::MechanismUnsupported(_))
        ));
    }
}
