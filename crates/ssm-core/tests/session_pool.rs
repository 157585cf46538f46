use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ssm_core::{
    crypto::{self, Algorithm},
    KeyDirectory, KeyLifecycle, KeyType, SecretString, SessionPool, SoftToken, SsmError,
    TokenContext,
};

fn setup_pool(max: usize) -> (Arc<SoftToken>, SessionPool) {
    let token = Arc::new(SoftToken::new(0, "1234"));
    let context = TokenContext::open(token.clone(), 0, SecretString::new("1234")).expect("context");
    let pool = SessionPool::new(context, max).expect("pool");
    (token, pool)
}

#[test]
fn live_sessions_never_exceed_the_bound() {
    let (token, pool) = setup_pool(3);
    {
        let session = pool.acquire().expect("session");
        KeyLifecycle::new(&session)
            .generate(KeyType::Aes, "K4_AES", Some(1), None)
            .expect("generate");
    }

    let peak = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    thread::scope(|scope| {
        for worker in 0..12 {
            let pool = &pool;
            let token = &token;
            let peak = &peak;
            let completed = &completed;
            scope.spawn(move || {
                for round in 0..10 {
                    let session = pool.acquire().expect("acquire");
                    let open = token.open_session_count();
                    peak.fetch_max(open, Ordering::SeqCst);
                    assert!(pool.stats().live <= 3);

                    let key = KeyDirectory::new(&session)
                        .find_key("K4_AES", Some(1))
                        .expect("key");
                    let iv = crypto::generate_iv(Algorithm::Aes);
                    let message = format!("worker {worker} round {round}");
                    let mut plaintext = message.clone().into_bytes();
                    let sealed =
                        crypto::encrypt(&key, Algorithm::Aes, &iv, &mut plaintext).expect("encrypt");
                    let plain =
                        crypto::decrypt(&key, Algorithm::Aes, &iv, &sealed.data).expect("decrypt");
                    assert_eq!(plain.expose(), message.as_bytes());
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 120);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert!(stats.live <= 3);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, stats.live);
    assert_eq!(token.open_session_count(), stats.live);
    assert_eq!(token.login_calls(), 1);
}

#[test]
fn exhausted_pool_times_out_then_recovers() {
    let (_token, pool) = setup_pool(1);
    let held = pool.acquire().expect("first");

    let err = pool
        .acquire_timeout(Duration::from_millis(50))
        .expect_err("exhausted");
    assert!(matches!(err, SsmError::PoolExhausted(_)));

    thread::scope(|scope| {
        let waiter = scope.spawn(|| pool.acquire_timeout(Duration::from_secs(5)).map(|s| s.handle()));
        thread::sleep(Duration::from_millis(50));
        let handle = held.handle();
        drop(held);
        assert_eq!(waiter.join().expect("join").expect("acquired"), handle);
    });
}

#[test]
fn reset_discards_outstanding_sessions() {
    let (token, pool) = setup_pool(2);
    let stale = pool.acquire().expect("stale");
    let idle = pool.acquire().expect("idle");
    drop(idle);

    pool.destroy_all().expect("reset");
    assert_eq!(token.open_session_count(), 0);
    assert!(!pool.token().is_logged_in());
    drop(stale);
    assert_eq!(pool.stats().live, 0);

    let fresh = pool.acquire().expect("fresh");
    assert!(pool.token().is_logged_in());
    assert_eq!(token.login_calls(), 2);
    drop(fresh);
    assert_eq!(pool.stats().available, 1);

    pool.shutdown().expect("shutdown");
    assert!(matches!(pool.acquire(), Err(SsmError::PoolClosed)));
}

#[test]
fn wrong_pin_leaves_nothing_open() {
    let token = Arc::new(SoftToken::new(0, "1234"));
    let context = TokenContext::open(token.clone(), 0, SecretString::new("0000")).expect("context");
    let pool = SessionPool::new(context, 2).expect("pool");

    let err = pool.acquire().expect_err("login");
    assert!(matches!(err, SsmError::Backend { operation: "C_Login", .. }), "{err}");
    assert_eq!(token.open_session_count(), 0);
    assert_eq!(pool.stats().live, 0);
}
