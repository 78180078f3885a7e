//! ACL module tests

use super::*;
use crate::config::{AclConfig, AclPermissions, AclRole, AuthConfig, UserConfig};
use crate::protocol::Transport;
use serde_json::json;
use test_case::test_case;

fn make_test_auth() -> Arc<TokenAuthenticator> {
    let user = |name: &str, role: &str| UserConfig {
        client_name: name.to_string(),
        password: Some(format!("{}_pass", name)),
        password_hash: None,
        role: Some(role.to_string()),
    };
    let auth_config = AuthConfig {
        enabled: true,
        allow_anonymous: true,
        users: vec![
            user("admin", "admin"),
            user("sensor", "device"),
            user("readonly", "reader"),
        ],
    };
    Arc::new(TokenAuthenticator::new(&auth_config))
}

fn make_test_acl_config() -> AclConfig {
    AclConfig {
        enabled: true,
        roles: vec![
            AclRole {
                name: "admin".to_string(),
                publish: vec!["*".to_string()],
                subscribe: vec!["*".to_string()],
            },
            AclRole {
                name: "device".to_string(),
                publish: vec!["sensors/%c/*".to_string()],
                subscribe: vec!["commands/%c".to_string()],
            },
            AclRole {
                name: "reader".to_string(),
                publish: vec![],
                subscribe: vec!["sensors/*".to_string()],
            },
        ],
        default: AclPermissions {
            publish: vec!["lobby".to_string()],
            subscribe: vec!["lobby".to_string()],
        },
        reserved: vec!["update".to_string()],
    }
}

fn remote() -> RemoteInfo {
    RemoteInfo::new("127.0.0.1:5555".parse().unwrap(), Transport::Socket)
}

async fn can_publish(acl: &ChannelAcl, client: &str, channel: &str) -> StatusCode {
    acl.validate_pub(client, channel, &json!({}), QoS::AtMostOnce, &remote())
        .await
        .unwrap()
}

async fn can_subscribe(acl: &ChannelAcl, client: &str, channel: &str) -> StatusCode {
    acl.validate_sub(client, channel, false, &remote())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_acl_disabled_allows_all() {
    let config = AclConfig {
        enabled: false,
        ..Default::default()
    };
    let acl = ChannelAcl::new(&config, make_test_auth());

    assert!(!acl.is_enabled());
    assert_eq!(can_publish(&acl, "anyone", "any/channel").await, StatusCode::Ok);
    assert_eq!(can_subscribe(&acl, "anyone", "any/channel").await, StatusCode::Ok);
}

#[tokio::test]
async fn test_reserved_channel_refused_even_when_disabled() {
    let config = AclConfig {
        enabled: false,
        reserved: vec!["update".to_string()],
        ..Default::default()
    };
    let acl = ChannelAcl::new(&config, make_test_auth());

    assert_eq!(can_publish(&acl, "alice", "update").await, StatusCode::NotAllowed);
    assert_eq!(can_subscribe(&acl, "alice", "update").await, StatusCode::NotAllowed);
    let unsub = acl.validate_unsub("alice", "update", &remote()).await.unwrap();
    assert_eq!(unsub, StatusCode::NotAllowed);

    // Prefix of a reserved channel is not reserved
    assert_eq!(can_publish(&acl, "alice", "updates").await, StatusCode::Ok);
}

#[test_case("admin", "any/channel/here", StatusCode::Ok ; "admin publishes anywhere")]
#[test_case("sensor", "sensors/sensor/temperature", StatusCode::Ok ; "device publishes own channel")]
#[test_case("sensor", "sensors/other/temperature", StatusCode::NotAllowed ; "device cannot publish other channel")]
#[test_case("readonly", "sensors/temp", StatusCode::NotAllowed ; "reader cannot publish")]
#[test_case("guest", "lobby", StatusCode::Ok ; "anonymous uses default publish")]
#[test_case("guest", "sensors/temp", StatusCode::NotAllowed ; "anonymous denied outside default")]
#[test_case("admin", "update", StatusCode::NotAllowed ; "reserved beats admin role")]
#[tokio::test]
async fn test_publish_permissions(client: &str, channel: &str, expected: StatusCode) {
    let acl = ChannelAcl::new(&make_test_acl_config(), make_test_auth());
    assert_eq!(can_publish(&acl, client, channel).await, expected);
}

#[test_case("readonly", "sensors/temp", StatusCode::Ok ; "reader subscribes sensors")]
#[test_case("readonly", "commands/readonly", StatusCode::NotAllowed ; "reader cannot subscribe commands")]
#[test_case("sensor", "commands/sensor", StatusCode::Ok ; "device subscribes own commands")]
#[test_case("sensor", "commands/other", StatusCode::NotAllowed ; "device cannot subscribe other commands")]
#[test_case("sensor", "lobby", StatusCode::Ok ; "role falls back to default")]
#[tokio::test]
async fn test_subscribe_permissions(client: &str, channel: &str, expected: StatusCode) {
    let acl = ChannelAcl::new(&make_test_acl_config(), make_test_auth());
    assert_eq!(can_subscribe(&acl, client, channel).await, expected);
}

#[tokio::test]
async fn test_unsubscribe_follows_subscribe_patterns() {
    let acl = ChannelAcl::new(&make_test_acl_config(), make_test_auth());

    let allowed = acl
        .validate_unsub("readonly", "sensors/temp", &remote())
        .await
        .unwrap();
    assert_eq!(allowed, StatusCode::Ok);

    let denied = acl
        .validate_unsub("readonly", "private", &remote())
        .await
        .unwrap();
    assert_eq!(denied, StatusCode::NotAllowed);
}

#[tokio::test]
async fn test_unknown_role_uses_defaults() {
    let auth = Arc::new(TokenAuthenticator::new(&AuthConfig {
        enabled: true,
        allow_anonymous: true,
        users: vec![UserConfig {
            client_name: "ghost".to_string(),
            password: Some("pw".to_string()),
            password_hash: None,
            role: Some("missing".to_string()),
        }],
    }));
    let acl = ChannelAcl::new(&make_test_acl_config(), auth);

    assert_eq!(can_publish(&acl, "ghost", "lobby").await, StatusCode::Ok);
    assert_eq!(can_publish(&acl, "ghost", "other").await, StatusCode::NotAllowed);
}
