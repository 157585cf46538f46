use std::sync::Arc;

use ssm_core::{
    crypto::{self, Algorithm},
    KeyLifecycle, KeyStatus, KeyType, MechanismType, ReturnValue, SecretBytes, SecretString,
    Session, SessionPool, SoftToken, SsmError, TokenContext, UpdateOutcome,
};

fn setup_pool() -> (Arc<SoftToken>, SessionPool) {
    let token = Arc::new(SoftToken::new(0, "1234"));
    let context = TokenContext::open(token.clone(), 0, SecretString::new("1234")).expect("context");
    let pool = SessionPool::new(context, 4).expect("pool");
    (token, pool)
}

fn round_trip(session: &Session, label: &str, key_type: KeyType, algorithm: Algorithm) {
    let lifecycle = KeyLifecycle::new(session);
    let key = lifecycle
        .generate(key_type, label, None, None)
        .expect("generate")
        .key;
    for message in [&b""[..], b"x", b"exactly sixteen!", &[0x5a; 1000][..]] {
        let iv = crypto::generate_iv(algorithm);
        let mut plaintext = message.to_vec();
        let sealed = crypto::encrypt(&key, algorithm, &iv, &mut plaintext).expect("encrypt");
        assert!(plaintext.iter().all(|b| *b == 0), "plaintext buffer was not wiped");
        let recovered = crypto::decrypt(&key, algorithm, &iv, &sealed.data).expect("decrypt");
        assert_eq!(recovered.expose(), message, "{algorithm} round trip");
    }
}

#[test]
fn internal_aes_example_scenario() {
    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);

    let outcome = lifecycle
        .generate(KeyType::Aes, "internal-aes", Some(0), Some(256))
        .expect("generate");
    assert_eq!(outcome.status, KeyStatus::Created);
    assert_eq!(outcome.key.id(), 1);
    assert_eq!(outcome.key.bits(), 256);

    let iv = crypto::generate_iv(Algorithm::Aes);
    assert_eq!(iv.len(), 16);
    let mut plaintext = hex::decode("48656c6c6f").expect("hex");
    let sealed = crypto::encrypt(&outcome.key, Algorithm::Aes, &iv, &mut plaintext).expect("encrypt");
    assert!(!sealed.data.is_empty());
    assert_eq!(sealed.mechanism, MechanismType::AesCbcPad);

    let recovered = crypto::decrypt(&outcome.key, Algorithm::Aes, &iv, &sealed.data).expect("decrypt");
    assert_eq!(hex::encode(recovered.expose()), "48656c6c6f");
}

#[test]
fn every_family_round_trips() {
    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    round_trip(&session, "K4_AES", KeyType::Aes, Algorithm::Aes);
    round_trip(&session, "K4_DES", KeyType::Des, Algorithm::Des);
    round_trip(&session, "K4_DES3", KeyType::Des3, Algorithm::Des3);
    round_trip(&session, "K4_GCM", KeyType::Aes, Algorithm::AesGcm);

    let lifecycle = KeyLifecycle::new(&session);
    for bits in [128, 192] {
        let key = lifecycle
            .generate(KeyType::Aes, "sized", None, Some(bits))
            .expect("generate")
            .key;
        assert_eq!(key.bits(), bits);
        let iv = crypto::generate_iv(Algorithm::Aes);
        let mut data = b"payload".to_vec();
        let sealed = crypto::encrypt(&key, Algorithm::Aes, &iv, &mut data).expect("encrypt");
        let plain = crypto::decrypt(&key, Algorithm::Aes, &iv, &sealed.data).expect("decrypt");
        assert_eq!(plain.expose(), b"payload");
    }
}

#[test]
fn generation_is_idempotent_and_allocation_monotonic() {
    let (token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);

    let ids: Vec<u32> = (0..5)
        .map(|_| {
            lifecycle
                .generate(KeyType::Des3, "K4_DES3", None, None)
                .expect("generate")
                .key
                .id()
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let objects = token.object_count();
    let again = lifecycle
        .generate(KeyType::Des3, "K4_DES3", Some(3), None)
        .expect("generate existing");
    assert_eq!(again.status, KeyStatus::AlreadyExists);
    assert_eq!(again.key.id(), 3);
    assert_eq!(token.object_count(), objects);

    let stored = lifecycle
        .store("K4_DES3", &SecretBytes::copy_from(&[7u8; 24]), 2, KeyType::Des3)
        .expect("store existing");
    assert_eq!(stored.status, KeyStatus::AlreadyExists);
    assert_eq!(token.object_count(), objects);
}

#[test]
fn stored_key_decrypts_known_ciphertext() {
    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);

    let raw = SecretBytes::copy_from(&[0x11; 16]);
    let first = lifecycle
        .store("K4_AES", &raw, 0, KeyType::Aes)
        .expect("store");
    assert!(first.is_created());
    assert_eq!(first.key.id(), 1);
    assert_eq!(first.key.bits(), 128);

    let iv = [0u8; 16];
    let mut message = b"known answer".to_vec();
    let sealed = crypto::encrypt(&first.key, Algorithm::Aes, &iv, &mut message).expect("encrypt");
    drop(first);

    let second = lifecycle
        .store("K4_AES", &raw, 0, KeyType::Aes)
        .expect("store copy");
    assert_eq!(second.key.id(), 2);
    let plain = crypto::decrypt(&second.key, Algorithm::Aes, &iv, &sealed.data).expect("decrypt");
    assert_eq!(plain.expose(), b"known answer");

    let err = lifecycle
        .store("K4_AES", &SecretBytes::copy_from(&[1; 15]), 0, KeyType::Aes)
        .expect_err("bad length");
    assert!(matches!(err, SsmError::InvalidRequest(_)));
}

#[test]
fn update_replaces_key_material() {
    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);

    lifecycle
        .store("K4_DES", &SecretBytes::copy_from(&[0x01; 8]), 9, KeyType::Des)
        .expect("store");
    let replacement = SecretBytes::copy_from(&[0x23; 8]);
    let updated = lifecycle
        .update("K4_DES", &replacement, 9, KeyType::Des)
        .into_result()
        .expect("update");
    assert_eq!(updated.id(), 9);

    let twin = lifecycle
        .store("K4_DES", &replacement, 10, KeyType::Des)
        .expect("twin")
        .key;
    let iv = [9u8; 8];
    let mut data = b"des data".to_vec();
    let sealed = crypto::encrypt(&updated, Algorithm::Des, &iv, &mut data).expect("encrypt");
    let plain = crypto::decrypt(&twin, Algorithm::Des, &iv, &sealed.data).expect("decrypt");
    assert_eq!(plain.expose(), b"des data");
}

#[test]
fn update_failures_report_what_happened() {
    let (token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);
    let original = SecretBytes::copy_from(&[0x44; 32]);
    lifecycle
        .store("K4_AES", &original, 1, KeyType::Aes)
        .expect("store");

    match lifecycle.update("K4_AES", &SecretBytes::copy_from(&[1; 5]), 1, KeyType::Aes) {
        UpdateOutcome::FailedKeyIntact(SsmError::InvalidRequest(_)) => {}
        other => panic!("expected intact key, got {other:?}"),
    }
    match lifecycle.update("K4_AES", &original, 42, KeyType::Aes) {
        UpdateOutcome::FailedKeyIntact(err) => assert!(err.is_not_found()),
        other => panic!("expected not found, got {other:?}"),
    }
    assert!(lifecycle.directory().find_key("K4_AES", Some(1)).is_ok());

    token.inject_failure("C_CreateObject", ReturnValue::TemplateInconsistent);
    let outcome = lifecycle.update("K4_AES", &original, 1, KeyType::Aes);
    assert!(matches!(outcome, UpdateOutcome::DeletedNotRecreated { id: 1, .. }));
    let err = outcome.into_result().expect_err("partial");
    assert!(matches!(err, SsmError::PartiallyApplied { .. }));
    assert!(lifecycle
        .directory()
        .find_key("K4_AES", Some(1))
        .expect_err("gone")
        .is_not_found());
}

#[test]
fn delete_and_delete_all() {
    let (token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);
    for label in ["K4_AES", "K4_AES", "K4_DES", "KEY_ENCRIPTION_DES3"] {
        let key_type = ssm_core::labels::key_type_for_label(label).expect("known label");
        lifecycle
            .generate(key_type, label, None, None)
            .expect("generate");
    }

    lifecycle.delete("K4_AES", 2).expect("delete");
    assert!(lifecycle.delete("K4_AES", 2).expect_err("twice").is_not_found());
    assert_eq!(lifecycle.directory().find_all_keys().expect("list").len(), 3);

    token.inject_failure("C_DestroyObject", ReturnValue::GeneralError);
    let report = lifecycle.delete_all().expect("delete all");
    assert_eq!(report.found, 3);
    assert_eq!(report.destroyed, 2);
    assert!(!report.is_complete());

    let report = lifecycle.delete_all().expect("delete rest");
    assert!(report.is_complete());
    assert!(lifecycle.directory().find_all_keys().expect("list").is_empty());
}

#[test]
fn wrong_family_and_iv_are_rejected_before_the_token() {
    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);
    let des = lifecycle
        .generate(KeyType::Des, "K4_DES", None, None)
        .expect("generate")
        .key;

    let mut data = b"secret".to_vec();
    let err = crypto::encrypt(&des, Algorithm::Aes, &[0; 16], &mut data).expect_err("family");
    assert!(matches!(err, SsmError::InvalidRequest(_)));
    assert!(data.iter().all(|b| *b == 0));

    let mut data = b"secret".to_vec();
    let err = crypto::encrypt(&des, Algorithm::Des, &[0; 16], &mut data).expect_err("iv");
    assert!(matches!(err, SsmError::IvInvalid(_)));
    assert!("rot13".parse::<Algorithm>().is_err());
}

#[test]
fn stored_keys_carry_the_generated_key_restrictions() {
    use ssm_core::{attributes::*, Mechanism};

    let (_token, pool) = setup_pool();
    let session = pool.acquire().expect("session");
    let lifecycle = KeyLifecycle::new(&session);
    let generated = lifecycle
        .generate(KeyType::Des, "K4_DES", Some(1), None)
        .expect("generate")
        .key;
    let stored = lifecycle
        .store("K4_DES", &SecretBytes::copy_from(&[0x5b; 8]), 2, KeyType::Des)
        .expect("store")
        .key;

    let wanted = [
        CKA_ALLOWED_MECHANISMS,
        CKA_ENCRYPT,
        CKA_DECRYPT,
        CKA_WRAP,
        CKA_UNWRAP,
        CKA_SENSITIVE,
        CKA_EXTRACTABLE,
    ];
    let generated_attrs = session
        .get_attributes(generated.handle(), &wanted)
        .expect("generated attributes");
    let stored_attrs = session
        .get_attributes(stored.handle(), &wanted)
        .expect("stored attributes");
    assert_eq!(stored_attrs.mechanisms(), generated_attrs.mechanisms());
    for flag in [CKA_ENCRYPT, CKA_DECRYPT, CKA_WRAP, CKA_UNWRAP, CKA_SENSITIVE] {
        assert_eq!(stored_attrs.bool(flag), Some(true));
    }
    assert_eq!(stored_attrs.bool(CKA_EXTRACTABLE), Some(false));

    // AES-ECB is outside the DES list, so the token refuses it before looking at the key type.
    for key in [&generated, &stored] {
        let err = session
            .encrypt(&Mechanism::AesEcb, key.handle(), &[0u8; 16])
            .expect_err("mechanism outside the allowed list");
        assert_eq!(err.return_value(), Some(ReturnValue::MechanismInvalid));
    }

    let iv = [7u8; 8];
    let mut data = b"still usable".to_vec();
    let sealed = crypto::encrypt(&stored, Algorithm::Des, &iv, &mut data).expect("encrypt");
    let plain = crypto::decrypt(&stored, Algorithm::Des, &iv, &sealed.data).expect("decrypt");
    assert_eq!(plain.expose(), b"still usable");
}
