use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ssm_core::{
    crypto::{self, Algorithm},
    jwt, Claims, KeyDirectory, KeyLifecycle, KeyType, SecretString, SessionPool, SigningKeys,
    SoftToken, TokenContext,
};

fn pool() -> SessionPool {
    let token = Arc::new(SoftToken::new(0, "1234"));
    let context = TokenContext::open(token, 0, SecretString::new("1234")).unwrap();
    SessionPool::new(context, 2).unwrap()
}

fn bench_symmetric(c: &mut Criterion) {
    let pool = pool();
    let session = pool.acquire().unwrap();
    let lifecycle = KeyLifecycle::new(&session);
    for (label, key_type) in [("K4_AES", KeyType::Aes), ("K4_DES3", KeyType::Des3)] {
        lifecycle.generate(key_type, label, Some(1), None).unwrap();
    }
    let payload = b"Hello, World! This is a test message for benchmarking.";

    for (name, label, algorithm) in [
        ("aes_cbc_pad_encrypt", "K4_AES", Algorithm::Aes),
        ("aes_gcm_encrypt", "K4_AES", Algorithm::AesGcm),
        ("des3_cbc_pad_encrypt", "K4_DES3", Algorithm::Des3),
    ] {
        let iv = crypto::generate_iv(algorithm);
        c.bench_function(name, |b| {
            b.iter(|| {
                let key = KeyDirectory::new(&session).find_key(label, Some(1)).unwrap();
                let mut plaintext = payload.to_vec();
                crypto::encrypt(&key, algorithm, black_box(&iv), black_box(&mut plaintext)).unwrap()
            })
        });
    }
}

fn bench_pool_checkout(c: &mut Criterion) {
    let pool = pool();
    drop(pool.acquire().unwrap());
    c.bench_function("pool_checkout", |b| {
        b.iter(|| black_box(pool.acquire().unwrap().handle()))
    });
}

fn bench_jwt(c: &mut Criterion) {
    let pool = pool();
    let session = pool.acquire().unwrap();
    let keys = SigningKeys::bootstrap(&session).unwrap();
    let claims = Claims::new("bench");
    let token = jwt::sign_jwt(&session, &keys, &claims).unwrap();

    c.bench_function("jwt_sign", |b| {
        b.iter(|| jwt::sign_jwt(&session, &keys, black_box(&claims)).unwrap())
    });
    c.bench_function("jwt_verify", |b| {
        b.iter(|| jwt::verify_jwt(&keys, black_box(&token)).unwrap())
    });
}

criterion_group!(benches, bench_symmetric, bench_pool_checkout, bench_jwt);
criterion_main!(benches);
