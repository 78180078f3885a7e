//! Auth module tests

use super::*;
use crate::config::{AuthConfig, UserConfig};
use crate::protocol::Transport;
use serde_json::json;

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user_plaintext(client_name: &str, password: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        client_name: client_name.to_string(),
        password: Some(password.to_string()),
        password_hash: None,
        role: role.map(|s| s.to_string()),
    }
}

fn make_user_hashed(client_name: &str, password_hash: &str) -> UserConfig {
    UserConfig {
        client_name: client_name.to_string(),
        password: None,
        password_hash: Some(password_hash.to_string()),
        role: None,
    }
}

fn remote() -> RemoteInfo {
    RemoteInfo::new("10.0.0.1:4000".parse().unwrap(), Transport::WebSocket)
}

#[tokio::test]
async fn test_auth_disabled_issues_token() {
    let auth = TokenAuthenticator::new(&make_auth_config(false, false, vec![]));

    let response = auth
        .validate_auth(&json!({"client_name": "alice"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.client_id, "alice");
    assert!(!response.token.is_empty());
}

#[tokio::test]
async fn test_missing_client_name_is_invalid_packet() {
    let auth = TokenAuthenticator::new(&make_auth_config(false, false, vec![]));

    let response = auth
        .validate_auth(&json!({"name": "alice"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::InvalidPacket);
    assert_eq!(response.message, "Invalid auth data, client_name is missing");
}

#[tokio::test]
async fn test_auth_enabled_rejects_unknown_client() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", None)],
    ));

    let response = auth
        .validate_auth(&json!({"client_name": "mallory", "password": "x"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NotAllowed);
}

#[tokio::test]
async fn test_auth_enabled_allows_anonymous_when_configured() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        true,
        vec![make_user_plaintext("admin", "secret", None)],
    ));

    let response = auth
        .validate_auth(&json!({"client_name": "guest"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::Ok);
}

#[tokio::test]
async fn test_auth_enabled_rejects_wrong_password() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        true,
        vec![make_user_plaintext("admin", "secret", None)],
    ));

    let response = auth
        .validate_auth(&json!({"client_name": "admin", "password": "wrong"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NotAllowed);
}

// Argon2 hash for "secret" generated with default params
const TEST_ARGON2_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$3QUugnyLZGsTrETNoga03Q$Tnmpw8w1t/PzI36MTps259IB7ntGAb4NA0KlYD9Yzlw";

#[tokio::test]
async fn test_password_hash_accepts_valid() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        false,
        vec![make_user_hashed("admin", TEST_ARGON2_HASH)],
    ));

    let response = auth
        .validate_auth(&json!({"client_name": "admin", "password": "secret"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::Ok);

    let response = auth
        .validate_auth(&json!({"client_name": "admin", "password": "wrong"}), &remote())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NotAllowed);
}

#[tokio::test]
async fn test_conn_requires_last_issued_token() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("alice", "pw", None)],
    ));

    let first = auth
        .validate_auth(&json!({"client_name": "alice", "password": "pw"}), &remote())
        .await
        .unwrap();
    let second = auth
        .validate_auth(&json!({"client_name": "alice", "password": "pw"}), &remote())
        .await
        .unwrap();

    let stale = auth
        .validate_conn("alice", &first.token, &remote())
        .await
        .unwrap();
    assert_eq!(stale, StatusCode::InvalidToken);

    let current = auth
        .validate_conn("alice", &second.token, &remote())
        .await
        .unwrap();
    assert_eq!(current, StatusCode::Ok);

    auth.revoke("alice");
    let revoked = auth
        .validate_conn("alice", &second.token, &remote())
        .await
        .unwrap();
    assert_eq!(revoked, StatusCode::InvalidToken);
}

#[tokio::test]
async fn test_conn_without_auth_enabled_always_ok() {
    let auth = TokenAuthenticator::new(&make_auth_config(false, false, vec![]));
    let status = auth.validate_conn("bob", "anything", &remote()).await.unwrap();
    assert_eq!(status, StatusCode::Ok);
}

#[test]
fn test_get_user_role() {
    let auth = TokenAuthenticator::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", Some("admin_role"))],
    ));

    assert!(auth.is_enabled());
    assert_eq!(auth.get_user_role("admin"), Some("admin_role"));
    assert_eq!(auth.get_user_role("unknown"), None);
}
