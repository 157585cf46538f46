//! Secret-management core over PKCS#11 tokens: a bounded pool of authenticated sessions, key
//! lifecycle by (label, identifier), symmetric encryption with mechanism fallback, and in-token
//! RSA signing for audit entries and access tokens. Key material never leaves the token and
//! every plaintext buffer is wiped after use.
//!
//! [`SecretManager`] is the explicit context object that ties the components together; the
//! components can also be used directly on a [`Session`] taken from the pool.

pub mod attributes;
pub mod audit;
pub mod backend;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod jwt;
pub mod labels;
pub mod lifecycle;
pub mod mechanism;
pub mod pkcs11;
pub mod pool;
pub mod secret;
pub mod session;
pub mod signing;
pub mod soft;
pub mod token;

pub use attributes::{AttributeSet, AttributeTemplate, AttributeValue};
pub use audit::{
    generate_request_id, sign_audit_entry, verify_audit_entry, AuditAction, AuditEntry,
    AuditSink, Auditor, FileAuditSink, MemoryAuditSink,
};
pub use backend::{BackendError, ObjectHandle, ReturnValue, SessionHandle, SlotId, TokenBackend};
pub use config::{BackendKind, SsmConfig};
pub use crypto::{Algorithm, Ciphertext};
pub use directory::{KeyDirectory, KeyInfo, KeyObject};
pub use error::{SsmError, SsmResult};
pub use jwt::Claims;
pub use lifecycle::{DeleteAllReport, KeyLifecycle, KeyOutcome, KeyStatus, UpdateOutcome};
pub use mechanism::{KeyType, Mechanism, MechanismType};
pub use pkcs11::Pkcs11Backend;
pub use pool::{PoolStats, PooledSession, SessionPool};
pub use secret::{SecretBytes, SecretString};
pub use session::Session;
pub use signing::{SigningKeys, SigningPurpose};
pub use soft::SoftToken;
pub use token::TokenContext;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

/// Ciphertext record handed to persistence: everything needed to decrypt except the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Hex-encoded ciphertext (with the tag appended for AES-GCM).
    pub ciphertext: String,
    /// Hex-encoded IV.
    pub iv: String,
    pub label: String,
    pub id: u32,
    pub algorithm: Algorithm,
    pub mechanism: MechanismType,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub slot: SlotId,
    pub logged_in: bool,
    pub uptime_secs: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
    pub pool: PoolStats,
}

pub struct SecretManager {
    pool: SessionPool,
    signing: SigningKeys,
    auditor: Auditor,
}

impl SecretManager {
    /// Build the backend, sink and pool described by `config` and bootstrap the token.
    pub fn from_config(config: &SsmConfig) -> SsmResult<Self> {
        config.validate()?;
        let backend: Arc<dyn TokenBackend> = match config.token.backend {
            BackendKind::Soft => Arc::new(SoftToken::new(
                config.token.slot,
                config.token.pin.expose(),
            )),
            BackendKind::Pkcs11 => {
                let module = config
                    .token
                    .module_path
                    .as_ref()
                    .ok_or_else(|| SsmError::config("token.module_path is not set"))?;
                Arc::new(Pkcs11Backend::new(module))
            }
        };
        let sink: Box<dyn AuditSink> = match &config.audit.log_path {
            Some(path) => Box::new(FileAuditSink::new(path)?),
            None => Box::new(MemoryAuditSink::default()),
        };
        let token = TokenContext::open(backend, config.token.slot, config.token.pin.clone())?;
        let mut pool = SessionPool::new(token, config.pool.max_sessions)?;
        if let Some(timeout) = config.pool.acquire_timeout() {
            pool = pool.with_acquire_timeout(timeout);
        }
        Self::start(pool, sink)
    }

    /// Bootstrap signing keys and the internal AES-256 key over an existing pool.
    pub fn start(pool: SessionPool, sink: Box<dyn AuditSink>) -> SsmResult<Self> {
        let signing = {
            let session = pool.acquire()?;
            let signing = SigningKeys::bootstrap(&session)?;
            let internal = KeyLifecycle::new(&session).generate(
                KeyType::Aes,
                labels::INTERNAL_AES_LABEL,
                Some(1),
                Some(256),
            )?;
            if internal.is_created() {
                info!(label = labels::INTERNAL_AES_LABEL, "internal key created");
            }
            signing
        };
        info!(slot = pool.token().slot(), max_sessions = pool.max_size(), "secret manager started");
        Ok(Self {
            pool,
            signing,
            auditor: Auditor::new(sink),
        })
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn acquire(&self) -> SsmResult<PooledSession<'_>> {
        self.pool.acquire()
    }

    pub fn signing_keys(&self) -> &SigningKeys {
        &self.signing
    }

    /// Encrypt under `label`: the key at `id`, or a random key under the label when `id` is
    /// `None`. A fresh IV is generated and `plaintext` is wiped.
    pub fn encrypt(
        &self,
        label: &str,
        id: Option<u32>,
        algorithm: Algorithm,
        plaintext: &mut [u8],
    ) -> SsmResult<SealedSecret> {
        let plaintext = secret::Scrubbed::new(plaintext);
        let session = self.pool.acquire()?;
        let directory = KeyDirectory::new(&session);
        let key = match id {
            Some(id) => directory.find_key(label, Some(id))?,
            None => directory.random_key_for_label(label)?,
        };
        let iv = crypto::generate_iv(algorithm);
        let mut buffer = SecretBytes::copy_from(&plaintext);
        let sealed = crypto::encrypt(&key, algorithm, &iv, buffer.expose_mut())?;
        Ok(SealedSecret {
            ciphertext: hex::encode(sealed.data),
            iv: hex::encode(iv),
            label: key.label().to_string(),
            id: key.id(),
            algorithm,
            mechanism: sealed.mechanism,
        })
    }

    /// Decrypt a record produced by [`SecretManager::encrypt`] with the mechanism it recorded.
    pub fn decrypt(&self, sealed: &SealedSecret) -> SsmResult<SecretBytes> {
        let ciphertext = hex::decode(&sealed.ciphertext).map_err(SsmError::invalid)?;
        let iv = hex::decode(&sealed.iv).map_err(SsmError::invalid)?;
        let session = self.pool.acquire()?;
        let key = KeyDirectory::new(&session).find_key(&sealed.label, Some(sealed.id))?;
        if key.key_type() != sealed.algorithm.key_type() {
            return Err(SsmError::invalid(format!(
                "{} record points at {} key {}/{}",
                sealed.algorithm,
                key.key_type(),
                sealed.label,
                sealed.id
            )));
        }
        crypto::decrypt_with(&key, sealed.mechanism, &iv, &ciphertext)
    }

    pub fn sign_jwt(&self, claims: &Claims) -> SsmResult<String> {
        let session = self.pool.acquire()?;
        jwt::sign_jwt(&session, &self.signing, claims)
    }

    pub fn verify_jwt(&self, token: &str) -> SsmResult<Claims> {
        jwt::verify_jwt(&self.signing, token)
    }

    pub fn sign_audit_entry(&self, entry: &mut AuditEntry) -> SsmResult<()> {
        let session = self.pool.acquire()?;
        audit::sign_audit_entry(&session, &self.signing, entry)
    }

    /// Sign and persist `entry`. Never fails the caller.
    pub fn record_audit(&self, entry: AuditEntry) {
        match self.pool.acquire() {
            Ok(session) => self.auditor.record(&session, &self.signing, entry),
            Err(err) => tracing::error!(
                request_id = %entry.request_id,
                error = %err,
                "no session to sign audit entry"
            ),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Check out a session and report pool and login state.
    pub fn health(&self) -> SsmResult<HealthReport> {
        let token = self.pool.token();
        drop(self.pool.acquire()?);
        Ok(HealthReport {
            slot: token.slot(),
            logged_in: token.is_logged_in(),
            uptime_secs: (OffsetDateTime::now_utc() - token.created_at()).whole_seconds(),
            last_used: token.last_used(),
            pool: self.pool.stats(),
        })
    }

    /// Close every session, log out and finalize the backend.
    pub fn shutdown(&self) -> SsmResult<()> {
        self.pool.shutdown()
    }
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("token", self.pool.token())
            .field("pool", &self.pool.stats())
            .finish_non_exhaustive()
    }
}
