use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::{
    error::{SsmError, SsmResult},
    session::Session,
    signing::{SigningKeys, SigningPurpose},
};

/// One request as seen by the service boundary. `signature` covers every other field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub action: String,
    pub method: String,
    pub path: String,
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    pub status_code: u16,
    pub request_id: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub signature: String,
}

impl AuditEntry {
    /// Entry for a request starting now, with its action resolved and a fresh request id.
    pub fn new(method: &str, path: &str, ip: impl Into<String>) -> Self {
        Self {
            start_time: OffsetDateTime::now_utc(),
            action: AuditAction::resolve(method, path),
            method: method.to_string(),
            path: path.to_string(),
            ip: ip.into(),
            user_agent: String::new(),
            status_code: 0,
            request_id: generate_request_id(),
            duration_ms: 0,
            error: None,
            signature: String::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Record the outcome once the request has been served.
    pub fn finish(mut self, status_code: u16, elapsed: Duration, error: Option<String>) -> Self {
        self.status_code = status_code;
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.error = error;
        self
    }

    fn signing_payload(&self) -> SsmResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        serde_json::to_vec(&unsigned).map_err(SsmError::audit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    EncryptData,
    DecryptData,
    GenerateAesKey,
    GenerateDesKey,
    GenerateDes3Key,
    StoreKey,
    UpdateKey,
    DeleteKey,
    GetKey,
    GetKeys,
    GetAllKeys,
    HealthCheck,
    UserLogin,
}

impl AuditAction {
    pub fn from_request(method: &str, path: &str) -> Option<Self> {
        let action = match (method, path) {
            ("POST", "/crypto/encrypt") => Self::EncryptData,
            ("POST", "/crypto/decrypt") => Self::DecryptData,
            ("POST", "/crypto/generate-aes-key") => Self::GenerateAesKey,
            ("POST", "/crypto/generate-des-key") => Self::GenerateDesKey,
            ("POST", "/crypto/generate-des3-key") => Self::GenerateDes3Key,
            ("POST", "/crypto/store-key") => Self::StoreKey,
            ("PUT", "/crypto/store-key") => Self::UpdateKey,
            ("DELETE", "/crypto/store-key") => Self::DeleteKey,
            ("POST", "/crypto/get-data-key") => Self::GetKey,
            ("POST", "/crypto/get-data-keys") => Self::GetKeys,
            ("POST", "/crypto/get-all-keys") => Self::GetAllKeys,
            ("POST", "/crypto/health-check") => Self::HealthCheck,
            ("POST", "/login") => Self::UserLogin,
            _ => return None,
        };
        Some(action)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EncryptData => "ENCRYPT_DATA",
            Self::DecryptData => "DECRYPT_DATA",
            Self::GenerateAesKey => "GENERATE_AES_KEY",
            Self::GenerateDesKey => "GENERATE_DES_KEY",
            Self::GenerateDes3Key => "GENERATE_DES3_KEY",
            Self::StoreKey => "STORE_KEY",
            Self::UpdateKey => "UPDATE_KEY",
            Self::DeleteKey => "DELETE_KEY",
            Self::GetKey => "GET_KEY",
            Self::GetKeys => "GET_KEYS",
            Self::GetAllKeys => "GET_ALL_KEYS",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::UserLogin => "USER_LOGIN",
        }
    }

    /// Action name for a request; unmapped requests become `METHOD_path`.
    pub fn resolve(method: &str, path: &str) -> String {
        match Self::from_request(method, path) {
            Some(action) => action.as_str().to_string(),
            None => format!("{method}_{path}"),
        }
    }
}

/// `ssm-<host prefix>-<unix seconds>-<random hex>`.
pub fn generate_request_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let prefix: String = host.chars().take(8).collect();
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "ssm-{prefix}-{}-{}",
        OffsetDateTime::now_utc().unix_timestamp(),
        hex::encode(suffix)
    )
}

/// Clear the signature, sign the serialized entry with the audit key and store it base64-encoded.
pub fn sign_audit_entry(
    session: &Session,
    keys: &SigningKeys,
    entry: &mut AuditEntry,
) -> SsmResult<()> {
    entry.signature.clear();
    let payload = entry.signing_payload()?;
    let signature = keys.sign(session, SigningPurpose::Audit, &payload)?;
    entry.signature = STANDARD.encode(signature);
    Ok(())
}

pub fn verify_audit_entry(keys: &SigningKeys, entry: &AuditEntry) -> SsmResult<bool> {
    let Ok(signature) = STANDARD.decode(&entry.signature) else {
        return Ok(false);
    };
    let payload = entry.signing_payload()?;
    Ok(keys.verify(SigningPurpose::Audit, &payload, &signature))
}

/// Opaque persistence for signed entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> SsmResult<()>;
}

/// Append-only JSON-lines audit file.
pub struct FileAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> SsmResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(SsmError::audit)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last `limit` entries, newest first.
    pub fn tail(&self, limit: usize) -> SsmResult<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock();
        let reader = BufReader::new(File::open(&self.path).map_err(SsmError::audit)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(SsmError::audit)?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str::<AuditEntry>(&line).map_err(SsmError::audit)?);
        }
        let start = entries.len().saturating_sub(limit);
        let mut result: Vec<_> = entries.into_iter().skip(start).collect();
        result.reverse();
        Ok(result)
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &AuditEntry) -> SsmResult<()> {
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SsmError::audit)?;
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer(&mut writer, entry).map_err(SsmError::audit)?;
        writer.write_all(b"\n").map_err(SsmError::audit)?;
        writer.flush().map_err(SsmError::audit)?;
        file.sync_all().map_err(SsmError::audit)?;
        Ok(())
    }
}

/// In-memory sink, used when no audit file is configured.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> SsmResult<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Mirrors entries to the application log, signs them and hands them to a sink.
pub struct Auditor {
    sink: Box<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Box<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Best effort: signing or persistence failures are logged and the entry dropped.
    pub fn record(&self, session: &Session, keys: &SigningKeys, mut entry: AuditEntry) {
        log_entry(&entry);
        if let Err(err) = sign_audit_entry(session, keys, &mut entry) {
            error!(request_id = %entry.request_id, error = %err, "failed to sign audit entry");
            return;
        }
        if let Err(err) = self.sink.append(&entry) {
            error!(request_id = %entry.request_id, error = %err, "failed to persist audit entry");
        }
    }
}

fn log_entry(entry: &AuditEntry) {
    if entry.status_code >= 400 {
        warn!(
            target: "audit",
            action = %entry.action,
            method = %entry.method,
            path = %entry.path,
            ip = %entry.ip,
            status = entry.status_code,
            duration_ms = entry.duration_ms,
            request_id = %entry.request_id,
            error = entry.error.as_deref().unwrap_or(""),
            "request failed"
        );
    } else {
        info!(
            target: "audit",
            action = %entry.action,
            method = %entry.method,
            path = %entry.path,
            ip = %entry.ip,
            status = entry.status_code,
            duration_ms = entry.duration_ms,
            request_id = %entry.request_id,
            "request served"
        );
    }
}
