//! Consent store tests.
//!
//! Every racy transition is a conditional write: the second writer must see
//! `false` and the stored state must be the first writer's.

mod common;

use common::{pending_session, test_db, test_store};
use consent_engine::consent::device::{code_signature, user_code_signature};
use consent_engine::consent::store::{ConsentResponse, ConsentStore};
use consent_engine::entity::consent_preconfiguration;
use consent_engine::entity::device_code_session::{self, DeviceCodeStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

fn approval(now: OffsetDateTime) -> ConsentResponse {
    ConsentResponse {
        authorized: true,
        granted_scopes: "openid profile".into(),
        granted_audience: String::new(),
        granted_claims: String::new(),
        preconfiguration_id: None,
        responded_at: now,
    }
}

fn device_session(client_id: &str, now: OffsetDateTime) -> device_code_session::Model {
    device_code_session::Model {
        id: 0,
        client_id: client_id.into(),
        device_code_signature: code_signature(&Uuid::new_v4().to_string()),
        user_code_signature: user_code_signature(&Uuid::new_v4().to_string()[..8]),
        request_id: Uuid::new_v4().to_string(),
        challenge_id: None,
        status: DeviceCodeStatus::New.to_string(),
        active: true,
        revoked: false,
        subject: None,
        scopes: "openid".into(),
        audience: String::new(),
        form: format!("client_id={client_id}&scope=openid"),
        requested_at: now,
        expires_at: now + Duration::minutes(10),
    }
}

#[tokio::test]
async fn subject_is_bound_once() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();
    let session = pending_session("explicit-app", now);
    let challenge = Uuid::parse_str(&session.challenge_id).unwrap();
    store.save_consent_session(&session).await.unwrap();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    assert!(store.bind_consent_subject(challenge, first).await.unwrap());
    assert!(!store.bind_consent_subject(challenge, second).await.unwrap());

    let stored = store.load_consent_session(challenge).await.unwrap().unwrap();
    assert_eq!(stored.subject, Some(first.to_string()));
}

#[tokio::test]
async fn first_response_wins() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();
    let session = pending_session("explicit-app", now);
    let challenge = Uuid::parse_str(&session.challenge_id).unwrap();
    store.save_consent_session(&session).await.unwrap();

    assert!(store.respond_consent_session(challenge, &approval(now)).await.unwrap());
    assert!(
        !store
            .respond_consent_session(challenge, &ConsentResponse::rejected(now))
            .await
            .unwrap()
    );

    let stored = store.load_consent_session(challenge).await.unwrap().unwrap();
    assert!(stored.authorized);
    assert!(stored.responded_at.is_some());
    assert_eq!(stored.granted_scopes, "openid profile");
}

#[tokio::test]
async fn grant_requires_an_authorized_response() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();

    let pending = pending_session("explicit-app", now);
    let pending_id = Uuid::parse_str(&pending.challenge_id).unwrap();
    store.save_consent_session(&pending).await.unwrap();
    assert!(!store.grant_consent_session(pending_id, now).await.unwrap());

    let rejected = pending_session("explicit-app", now);
    let rejected_id = Uuid::parse_str(&rejected.challenge_id).unwrap();
    store.save_consent_session(&rejected).await.unwrap();
    store
        .respond_consent_session(rejected_id, &ConsentResponse::rejected(now))
        .await
        .unwrap();
    assert!(!store.grant_consent_session(rejected_id, now).await.unwrap());

    store.respond_consent_session(pending_id, &approval(now)).await.unwrap();
    assert!(store.grant_consent_session(pending_id, now).await.unwrap());
    assert!(!store.grant_consent_session(pending_id, now).await.unwrap());

    let stored = store.load_consent_session(pending_id).await.unwrap().unwrap();
    assert!(stored.granted && stored.authorized);
}

#[tokio::test]
async fn expired_sessions_are_never_responded_or_granted() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();

    let mut expired = pending_session("explicit-app", now - Duration::minutes(20));
    expired.expires_at = now - Duration::minutes(1);
    let expired_id = Uuid::parse_str(&expired.challenge_id).unwrap();
    store.save_consent_session(&expired).await.unwrap();

    assert!(!store.respond_consent_session(expired_id, &approval(now)).await.unwrap());
    let stored = store.load_consent_session(expired_id).await.unwrap().unwrap();
    assert!(stored.responded_at.is_none());
    assert!(!stored.authorized);

    // approved in time, but the grant comes too late
    let late = pending_session("explicit-app", now);
    let late_id = Uuid::parse_str(&late.challenge_id).unwrap();
    store.save_consent_session(&late).await.unwrap();
    assert!(store.respond_consent_session(late_id, &approval(now)).await.unwrap());
    let after_expiry = late.expires_at + Duration::seconds(1);
    assert!(!store.grant_consent_session(late_id, after_expiry).await.unwrap());

    let stored = store.load_consent_session(late_id).await.unwrap().unwrap();
    assert!(!stored.granted);
    assert!(stored.can_grant_at(now));
    assert!(!stored.can_grant_at(after_expiry));
}

#[tokio::test]
async fn subjects_are_stable_per_sector() {
    let store = test_store(test_db().await);

    let first = store.load_or_create_subject("", "john").await.unwrap();
    let again = store.load_or_create_subject("", "john").await.unwrap();
    let other_sector = store
        .load_or_create_subject("app.example.com", "john")
        .await
        .unwrap();
    let other_user = store.load_or_create_subject("", "jane").await.unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other_sector);
    assert_ne!(first, other_user);
    assert!(!first.is_nil());
}

#[tokio::test]
async fn device_sessions_pair_once() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();
    let device = device_session("tv", now);
    let id = store.save_device_session(&device).await.unwrap();

    let first = Uuid::new_v4();
    assert!(store.pair_device_session(id, first).await.unwrap());
    assert!(!store.pair_device_session(id, Uuid::new_v4()).await.unwrap());

    let loaded = store
        .load_device_session_by_user_code(&device.user_code_signature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.challenge_id, Some(first.to_string()));

    // approval needs the paired challenge
    let subject = Uuid::new_v4();
    assert!(!store.approve_device_session(id, Uuid::new_v4(), subject).await.unwrap());
    assert!(store.approve_device_session(id, first, subject).await.unwrap());

    // a decided session cannot be flipped
    assert!(!store.deny_device_session(id).await.unwrap());
    let loaded = store.load_device_session_by_challenge(first).await.unwrap().unwrap();
    assert_eq!(loaded.status(), DeviceCodeStatus::Approved);
    assert_eq!(loaded.subject, Some(subject.to_string()));
}

#[tokio::test]
async fn denied_devices_cannot_be_paired() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();
    let id = store
        .save_device_session(&device_session("tv", now))
        .await
        .unwrap();

    assert!(store.deny_device_session(id).await.unwrap());
    assert!(!store.pair_device_session(id, Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn revoked_and_expired_preconfigurations_are_not_found() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();
    let subject = Uuid::new_v4();
    let preconfiguration = |expires_at| consent_preconfiguration::Model {
        id: 0,
        client_id: "remembered-app".into(),
        subject: subject.to_string(),
        scopes: "openid profile".into(),
        audience: String::new(),
        granted_claims: String::new(),
        claims_signature: None,
        created_at: now - Duration::hours(2),
        expires_at,
        revoked: false,
    };

    let live = store
        .save_preconfiguration(&preconfiguration(Some(now + Duration::hours(1))))
        .await
        .unwrap();
    store
        .save_preconfiguration(&preconfiguration(Some(now - Duration::hours(1))))
        .await
        .unwrap();
    let forever = store
        .save_preconfiguration(&preconfiguration(None))
        .await
        .unwrap();

    let found: Vec<i32> = store
        .find_preconfigurations("remembered-app", subject, now)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&live) && found.contains(&forever));

    assert!(store.revoke_preconfiguration(live).await.unwrap());
    assert!(!store.revoke_preconfiguration(live).await.unwrap());
    let found = store
        .find_preconfigurations("remembered-app", subject, now)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, forever);

    assert!(
        store
            .find_preconfigurations("explicit-app", subject, now)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn purge_removes_only_expired_records() {
    let store = test_store(test_db().await);
    let now = OffsetDateTime::now_utc();

    let live = pending_session("explicit-app", now);
    let mut expired = pending_session("explicit-app", now - Duration::hours(1));
    expired.expires_at = now - Duration::minutes(1);
    store.save_consent_session(&live).await.unwrap();
    store.save_consent_session(&expired).await.unwrap();

    let mut old_device = device_session("tv", now - Duration::hours(1));
    old_device.expires_at = now - Duration::minutes(1);
    store.save_device_session(&old_device).await.unwrap();

    assert_eq!(store.purge_expired(now).await.unwrap(), 2);

    let live_id = Uuid::parse_str(&live.challenge_id).unwrap();
    let expired_id = Uuid::parse_str(&expired.challenge_id).unwrap();
    assert!(store.load_consent_session(live_id).await.unwrap().is_some());
    assert!(store.load_consent_session(expired_id).await.unwrap().is_none());
}
