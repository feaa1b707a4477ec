mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use tempfile::TempDir;

use doorbell_core::{AuthError, ManualClock};

use common::{authenticator, grant, interaction_required, start_time, FakeLogin};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_login() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::with_delay(Duration::from_millis(50)));
    let auth = authenticator(temp.path(), clock, login.clone());

    let callers = (0..8).map(|_| {
        let auth = auth.clone();
        tokio::spawn(async move { auth.get_credential().await })
    });
    let credentials: Vec<_> = join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(login.calls(), 1);
    assert_eq!(auth.login_count(), 1);
    assert!(credentials
        .iter()
        .all(|credential| credential.service_token == "token-1"));
}

#[tokio::test]
async fn cached_session_is_reused_until_it_expires() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::new());
    let auth = authenticator(temp.path(), clock.clone(), login.clone());

    let first = auth.get_credential().await.unwrap();
    clock.advance(ChronoDuration::hours(23));
    let again = auth.get_credential().await.unwrap();
    assert_eq!(first.service_token, again.service_token);
    assert_eq!(login.calls(), 1);

    clock.advance(ChronoDuration::hours(2));
    let renewed = auth.get_credential().await.unwrap();
    assert_eq!(renewed.service_token, "token-2");
    assert_eq!(renewed.issued_at, start_time() + ChronoDuration::hours(25));
    assert_eq!(login.calls(), 2);
}

#[tokio::test]
async fn session_file_survives_a_restart() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let first_login = Arc::new(FakeLogin::new());
    authenticator(temp.path(), clock.clone(), first_login.clone())
        .get_credential()
        .await
        .unwrap();

    let second_login = Arc::new(FakeLogin::new());
    let restarted = authenticator(temp.path(), clock, second_login.clone());
    let credential = restarted.get_credential().await.unwrap();
    assert_eq!(credential.service_token, "token-1");
    assert_eq!(second_login.calls(), 0);
}

#[tokio::test]
async fn invalid_credentials_are_not_retried() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::new());
    login.push(Err(AuthError::InvalidCredentials {
        username: "alice".into(),
        reason: "wrong password".into(),
    }));
    let auth = authenticator(temp.path(), clock, login.clone());

    let err = auth.get_credential().await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials { .. }));
    assert!(err.is_fatal());
    assert_eq!(login.calls(), 1);
    assert!(!temp.path().join("session.json").exists());
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::new());
    login.push(Err(AuthError::TransientNetwork("connection reset".into())));
    login.push(Err(AuthError::TransientNetwork("timed out".into())));
    login.push(Ok(grant("after-retries")));
    let auth = authenticator(temp.path(), clock, login.clone());

    let credential = auth.get_credential().await.unwrap();
    assert_eq!(credential.service_token, "after-retries");
    assert_eq!(login.calls(), 3);
}

#[tokio::test]
async fn qr_login_reports_interaction_required() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::new());
    login.push(Err(interaction_required()));
    let auth = authenticator(temp.path(), clock, login.clone());

    match auth.get_credential().await.unwrap_err() {
        AuthError::InteractionRequired { login_url, .. } => {
            assert_eq!(login_url.as_deref(), Some("https://account.test/qr/abc"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(login.calls(), 1);

    let credential = auth.get_credential().await.unwrap();
    assert_eq!(credential.service_token, "token-2");
}

#[tokio::test]
async fn rejected_session_forces_a_new_login() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let login = Arc::new(FakeLogin::new());
    let auth = authenticator(temp.path(), clock, login.clone());

    let stale = auth.get_credential().await.unwrap();
    auth.invalidate(&stale).unwrap();
    let fresh = auth.get_credential().await.unwrap();
    assert_ne!(stale.service_token, fresh.service_token);

    auth.invalidate(&stale).unwrap();
    assert_eq!(
        auth.get_credential().await.unwrap().service_token,
        fresh.service_token
    );
    assert_eq!(login.calls(), 2);

    let forced = auth.force_relogin().await.unwrap();
    assert_eq!(forced.service_token, "token-3");
}
