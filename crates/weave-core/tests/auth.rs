use std::rc::Rc;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use weave_core::auth::{AuthManager, SECRET_SIZE};
use weave_core::config::Config;
use weave_core::revocation::{AccessRevocationManager, RevocationEntry};
use weave_core::types::{AuthScope, RootClientTokenOwner, Timestamp, UserInfo};
use weave_harness::{FakeClock, FakeTaskRunner, MemoryConfigStore};

const SECRET: [u8; 32] = [
    69, 53, 17, 37, 80, 73, 2, 5, 79, 64, 41, 57, 12, 54, 65, 63, 72, 74, 93, 81, 20, 95, 89, 3,
    94, 92, 27, 21, 49, 90, 36, 6,
];
const SECRET2: [u8; 32] = [
    78, 40, 39, 68, 29, 19, 70, 86, 38, 61, 13, 55, 33, 32, 51, 52, 34, 43, 97, 48, 8, 56, 11, 99,
    50, 59, 24, 26, 31, 71, 76, 28,
];
const FINGERPRINT: [u8; 32] = [
    22, 47, 23, 77, 42, 98, 96, 25, 83, 16, 9, 14, 91, 44, 15, 75, 60, 62, 10, 18, 82, 35, 88, 100,
    30, 45, 7, 46, 67, 84, 58, 85,
];

fn clock_at(secs: u64) -> FakeClock {
    FakeClock::new(Timestamp::from_secs(secs))
}

fn auth() -> AuthManager {
    AuthManager::with_secret(
        SECRET.to_vec(),
        FINGERPRINT.to_vec(),
        Rc::new(clock_at(1_410_000_000)),
    )
}

fn auth_with_config() -> (Config, AuthManager) {
    let store = Rc::new(MemoryConfigStore::new());
    let clock = clock_at(1_410_000_000);
    let config = Config::new(store, Default::default());
    let auth = AuthManager::new(config.clone(), None, FINGERPRINT.to_vec(), Rc::new(clock));
    (config, auth)
}

#[test]
fn known_access_token_vectors() {
    let auth = auth();
    assert_eq!(
        BASE64_STANDARD.encode(auth.create_access_token(&UserInfo::new(AuthScope::None, 123))),
        "OUH2L2npY+Gzwjf9AnqigGSK3hxIVR+xX8/Cnu4DGf8wOjA6MTQxMDAwMDAwMA=="
    );
    assert_eq!(
        BASE64_STANDARD.encode(auth.create_access_token(&UserInfo::new(AuthScope::Viewer, 234))),
        "iZx0qgEHFF5lq+Q503GtgU0d6gLQ9TlLsU+DcFbZb2QxOjIzNDoxNDEwMDAwMDAw"
    );
}

#[test]
fn token_changes_with_time() {
    let clock = clock_at(1_410_000_000);
    let auth = AuthManager::with_secret(
        SECRET.to_vec(),
        FINGERPRINT.to_vec(),
        Rc::new(clock.clone()),
    );
    clock.advance(std::time::Duration::from_secs(11 * 24 * 3600));
    assert_eq!(
        BASE64_STANDARD.encode(auth.create_access_token(&UserInfo::new(AuthScope::User, 345))),
        "qAmlJykiPTnFljfOKSf3BUII9YZG8/ttzD76q+fII1YyOjM0NToxNDEwOTUwNDAw"
    );
}

#[test]
fn token_is_deterministic_per_second() {
    let auth = auth();
    let user = UserInfo::new(AuthScope::Viewer, 555);
    assert_eq!(auth.create_access_token(&user), auth.create_access_token(&user));
    assert_ne!(
        auth.create_access_token(&UserInfo::new(AuthScope::Viewer, 456)),
        auth.create_access_token(&UserInfo::new(AuthScope::Owner, 456))
    );
    assert_ne!(
        auth.create_access_token(&UserInfo::new(AuthScope::Owner, 456)),
        auth.create_access_token(&UserInfo::new(AuthScope::Owner, 789))
    );
}

#[test]
fn parse_round_trips_and_rejects_foreign_secrets() {
    let clock = Rc::new(clock_at(1_410_000_000));
    let auth = AuthManager::with_secret(SECRET.to_vec(), vec![], clock.clone());
    let other = AuthManager::with_secret(SECRET2.to_vec(), vec![], clock);

    let token = auth.create_access_token(&UserInfo::new(AuthScope::User, 5));
    let (user, issued_at) = auth.parse_access_token(&token).unwrap();
    assert_eq!(user.scope(), AuthScope::User);
    assert_eq!(user.user_id(), 5);
    assert_eq!(issued_at, Timestamp::from_secs(1_410_000_000));
    assert!(other.parse_access_token(&token).is_none());
}

#[test]
fn parse_rejects_truncated_tokens() {
    let auth = auth();
    let token = auth.create_access_token(&UserInfo::new(AuthScope::User, 5));
    assert!(auth.parse_access_token(&token[..20]).is_none());
    assert!(auth.parse_access_token(&token[..32]).is_none());
}

#[test]
fn root_token_validates_only_under_own_secret() {
    let clock = Rc::new(clock_at(1_410_000_000));
    let auth = AuthManager::with_secret(SECRET.to_vec(), vec![], clock.clone());
    let other = AuthManager::with_secret(SECRET2.to_vec(), vec![], clock);

    let token = auth.root_client_auth_token();
    assert!(auth.is_valid_auth_token(&token));
    assert!(!other.is_valid_auth_token(&token));
}

#[test]
fn claim_table() {
    use RootClientTokenOwner::{Client, Cloud, None as NoOwner};
    let cases = [
        (NoOwner, Client, true),
        (Client, Client, false),
        (Cloud, Client, false),
        (NoOwner, Cloud, true),
        (Client, Cloud, true),
        (Cloud, Cloud, true),
    ];
    for (current, claimer, expected) in cases {
        let (config, auth) = auth_with_config();
        let mut change = config.transaction();
        change.set_root_client_token_owner(current);
        change.commit();
        assert_eq!(
            auth.claim_root_client_auth_token(claimer).is_ok(),
            expected,
            "claim {claimer:?} over {current:?}"
        );
    }
}

#[test]
#[should_panic(expected = "cannot be claimed for 'none'")]
fn claiming_for_none_is_fatal() {
    let (_config, auth) = auth_with_config();
    let _ = auth.claim_root_client_auth_token(RootClientTokenOwner::None);
}

#[test]
fn normal_claim_flow() {
    let (config, auth) = auth_with_config();
    let token = auth
        .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
        .unwrap();
    assert!(!auth.is_valid_auth_token(&token));
    assert_eq!(
        config.settings().root_client_token_owner,
        RootClientTokenOwner::None
    );

    assert!(auth.confirm_client_auth_token(&token));
    assert!(auth.is_valid_auth_token(&token));
    assert_eq!(
        config.settings().root_client_token_owner,
        RootClientTokenOwner::Cloud
    );
    // The adopted secret is persisted.
    assert_eq!(config.settings().secret, auth.secret());
}

#[test]
fn double_confirm_succeeds() {
    let (_config, auth) = auth_with_config();
    let token = auth
        .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
        .unwrap();
    assert!(auth.confirm_client_auth_token(&token));
    assert!(auth.confirm_client_auth_token(&token));
}

#[test]
fn confirm_invalidates_other_pending_claims() {
    let (_config, auth) = auth_with_config();
    let token1 = auth
        .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
        .unwrap();
    let token2 = auth
        .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
        .unwrap();
    assert!(auth.confirm_client_auth_token(&token1));
    assert!(!auth.confirm_client_auth_token(&token2));
}

#[test]
fn claim_ring_overflow_evicts_oldest() {
    let (_config, auth) = auth_with_config();
    let first = auth
        .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
        .unwrap();
    let mut last = Vec::new();
    for _ in 0..100 {
        last = auth
            .claim_root_client_auth_token(RootClientTokenOwner::Cloud)
            .unwrap();
    }
    assert!(!auth.confirm_client_auth_token(&first));
    assert!(auth.confirm_client_auth_token(&last));
}

#[test]
fn short_stored_secret_is_replaced() {
    let store = Rc::new(MemoryConfigStore::new());
    let config = Config::new(store, Default::default());
    {
        let mut change = config.transaction();
        change.set_secret(vec![1, 2, 3]);
        change.commit();
    }
    let auth = AuthManager::new(
        config.clone(),
        None,
        vec![],
        Rc::new(clock_at(1_410_000_000)),
    );
    assert_eq!(auth.secret().len(), SECRET_SIZE);
    assert_eq!(config.settings().secret, auth.secret());
}

#[test]
fn revoked_tokens_fail_to_parse() {
    let store = Rc::new(MemoryConfigStore::new());
    let clock = clock_at(1_410_000_000);
    let runner = FakeTaskRunner::new(clock.clone());
    let revocation = AccessRevocationManager::new(
        store.clone(),
        Rc::new(runner.clone()),
        Rc::new(clock.clone()),
    );
    let config = Config::new(store, Default::default());
    let auth = AuthManager::new(
        config,
        Some(revocation.clone()),
        vec![],
        Rc::new(clock.clone()),
    );

    let token = auth.create_access_token(&UserInfo::new(AuthScope::User, 7));
    assert!(auth.parse_access_token(&token).is_some());

    revocation.block(
        RevocationEntry {
            user_id: 7u64.to_be_bytes().to_vec(),
            app_id: vec![],
            issued_before: clock.now(),
            expiration: clock.now() + std::time::Duration::from_secs(3600),
        },
        Box::new(|result| assert!(result.is_ok())),
    );
    runner.run();
    assert!(auth.parse_access_token(&token).is_none());

    // Tokens minted after the revocation watermark parse again.
    clock.advance(std::time::Duration::from_secs(10));
    let fresh = auth.create_access_token(&UserInfo::new(AuthScope::User, 7));
    assert!(auth.parse_access_token(&fresh).is_some());
}
