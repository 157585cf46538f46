use std::{sync::Arc, thread, time::Duration as StdDuration};

use ssm_core::{
    labels, verify_audit_entry, Algorithm, AuditEntry, Claims, FileAuditSink, KeyDirectory,
    KeyLifecycle, KeyType, MechanismType, SecretManager, SecretString, SessionPool, SoftToken,
    SsmConfig, SsmError, TokenContext,
};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

fn start_manager(dir: &TempDir) -> (Arc<SoftToken>, SecretManager) {
    let token = Arc::new(SoftToken::new(0, "1234"));
    let context = TokenContext::open(token.clone(), 0, SecretString::new("1234")).expect("context");
    let pool = SessionPool::new(context, 4).expect("pool");
    let sink = FileAuditSink::new(dir.path().join("audit.jsonl")).expect("sink");
    let manager = SecretManager::start(pool, Box::new(sink)).expect("start");
    (token, manager)
}

#[test]
fn startup_bootstraps_token_once() {
    let dir = TempDir::new().expect("tempdir");
    let (token, manager) = start_manager(&dir);
    // two RSA pairs plus the internal AES key
    assert_eq!(token.object_count(), 5);

    let session = manager.acquire().expect("session");
    let internal = KeyDirectory::new(&session)
        .find_key(labels::INTERNAL_AES_LABEL, Some(1))
        .expect("internal key");
    assert_eq!(internal.bits(), 256);
    drop(internal);
    drop(session);

    let again = SecretManager::start(
        SessionPool::new(manager.pool().token().clone(), 2).expect("pool"),
        Box::new(ssm_core::MemoryAuditSink::default()),
    )
    .expect("restart");
    assert_eq!(token.object_count(), 5);
    let keys = again.signing_keys();
    assert_eq!(
        keys.public_key(ssm_core::SigningPurpose::Audit),
        manager.signing_keys().public_key(ssm_core::SigningPurpose::Audit)
    );
}

#[test]
fn sealed_secrets_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let (_token, manager) = start_manager(&dir);
    {
        let session = manager.acquire().expect("session");
        let lifecycle = KeyLifecycle::new(&session);
        for _ in 0..3 {
            lifecycle
                .generate(KeyType::Des3, labels::EXTERNAL_DES3, None, None)
                .expect("generate");
        }
    }

    let mut plaintext = b"card holder data".to_vec();
    let sealed = manager
        .encrypt(labels::EXTERNAL_DES3, None, Algorithm::Des3, &mut plaintext)
        .expect("encrypt");
    assert!(plaintext.iter().all(|b| *b == 0));
    assert!((1..=3).contains(&sealed.id));
    assert_eq!(sealed.iv.len(), 16);
    assert_eq!(sealed.mechanism, MechanismType::Des3CbcPad);

    let json = serde_json::to_string(&sealed).expect("serialize");
    let restored: ssm_core::SealedSecret = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(manager.decrypt(&restored).expect("decrypt").expose(), b"card holder data");

    let mut plaintext = b"gcm payload".to_vec();
    let sealed = manager
        .encrypt(labels::INTERNAL_AES_LABEL, Some(1), Algorithm::AesGcm, &mut plaintext)
        .expect("encrypt gcm");
    assert_eq!(sealed.iv.len(), 24);
    assert_eq!(manager.decrypt(&sealed).expect("decrypt gcm").expose(), b"gcm payload");

    let mut tampered = sealed.clone();
    let mut bytes = hex::decode(&tampered.ciphertext).expect("hex");
    bytes[0] ^= 0x01;
    tampered.ciphertext = hex::encode(bytes);
    assert!(matches!(manager.decrypt(&tampered), Err(SsmError::AuthenticationFailed)));

    let mut missing = sealed;
    missing.id = 99;
    assert!(manager.decrypt(&missing).expect_err("missing").is_not_found());
}

#[test]
fn jwt_lifecycle() {
    let dir = TempDir::new().expect("tempdir");
    let (_token, manager) = start_manager(&dir);
    let now = OffsetDateTime::now_utc();

    let short = Claims::new("operator").expires_in(Duration::seconds(1));
    let token = manager.sign_jwt(&short).expect("sign");
    assert_eq!(manager.verify_jwt(&token).expect("fresh").sub, "operator");

    let early = Claims::new("operator").not_before(now + Duration::hours(1));
    let early_token = manager.sign_jwt(&early).expect("sign");
    assert!(matches!(manager.verify_jwt(&early_token), Err(SsmError::JwtNotYetValid)));

    thread::sleep(StdDuration::from_secs(2));
    assert!(matches!(manager.verify_jwt(&token), Err(SsmError::JwtExpired)));
}

#[test]
fn audit_entries_are_signed_and_persisted() {
    let dir = TempDir::new().expect("tempdir");
    let (_token, manager) = start_manager(&dir);

    let mut entry = AuditEntry::new("POST", "/crypto/encrypt", "192.0.2.10")
        .with_user_agent("curl/8")
        .finish(200, StdDuration::from_millis(7), None);
    manager.sign_audit_entry(&mut entry).expect("sign");
    assert!(verify_audit_entry(manager.signing_keys(), &entry).expect("verify"));

    manager.record_audit(
        AuditEntry::new("POST", "/crypto/health-check", "192.0.2.10").finish(
            503,
            StdDuration::from_millis(1),
            Some("token unavailable".into()),
        ),
    );
    let sink = FileAuditSink::new(dir.path().join("audit.jsonl")).expect("sink");
    let stored = sink.tail(1).expect("tail");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].action, "HEALTH_CHECK");
    assert!(verify_audit_entry(manager.signing_keys(), &stored[0]).expect("verify stored"));
}

#[test]
fn health_stats_and_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let (token, manager) = start_manager(&dir);

    let health = manager.health().expect("health");
    assert!(health.logged_in);
    assert!(health.uptime_secs >= 0);
    assert_eq!(health.pool.max_size, 4);
    assert_eq!(manager.stats().in_use, 0);

    manager.shutdown().expect("shutdown");
    assert_eq!(token.open_session_count(), 0);
    assert!(matches!(manager.health(), Err(SsmError::PoolClosed)));
}

#[test]
fn manager_from_soft_config() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("nested").join("audit.jsonl");
    let config = SsmConfig::from_toml(&format!(
        "[token]\nbackend = \"soft\"\nslot = 1\npin = \"5678\"\n\n[pool]\nmax_sessions = 2\n\n[audit]\nlog_path = {:?}\n",
        log.display().to_string()
    ))
    .expect("config");
    let manager = SecretManager::from_config(&config).expect("manager");
    assert_eq!(manager.stats().max_size, 2);
    assert_eq!(manager.pool().token().slot(), 1);

    manager.record_audit(
        AuditEntry::new("POST", "/login", "127.0.0.1").finish(200, StdDuration::ZERO, None),
    );
    assert!(log.exists());
}
