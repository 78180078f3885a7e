//! Authentication Module
//!
//! Config-driven auth and conn validators. A successful `auth` issues a
//! fresh token for the client; `conn` is accepted only with the token most
//! recently issued to that client id. Passwords are checked against
//! plaintext or argon2 PHC entries of the configured user list.

use std::collections::HashMap;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{AuthResponse, AuthValidator, ConnectionValidator, HookResult, RemoteInfo};
use crate::protocol::StatusCode;

#[cfg(test)]
mod tests;

/// Token-issuing authenticator
pub struct TokenAuthenticator {
    /// Whether passwords are checked
    enabled: bool,
    /// Accept clients missing from the user list
    allow_anonymous: bool,
    /// Client name -> credentials and role
    users: HashMap<String, UserEntry>,
    /// Client id -> last issued token
    tokens: DashMap<String, String>,
}

enum Credential {
    Plain(String),
    /// argon2 PHC string
    Hash(String),
}

struct UserEntry {
    credential: Credential,
    role: Option<String>,
}

impl TokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .filter_map(|user| {
                let credential = match (&user.password, &user.password_hash) {
                    (_, Some(hash)) => Credential::Hash(hash.clone()),
                    (Some(password), None) => Credential::Plain(password.clone()),
                    (None, None) => return None,
                };
                Some((
                    user.client_name.clone(),
                    UserEntry {
                        credential,
                        role: user.role.clone(),
                    },
                ))
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
            tokens: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ACL role of a configured client
    pub fn get_user_role(&self, client_name: &str) -> Option<&str> {
        self.users.get(client_name).and_then(|u| u.role.as_deref())
    }

    /// Forget the token issued to `client_id`
    pub fn revoke(&self, client_id: &str) {
        self.tokens.remove(client_id);
    }

    fn verify_password(password: &str, credential: &Credential) -> bool {
        match credential {
            Credential::Plain(stored) => password == stored,
            Credential::Hash(hash) => match PasswordHash::new(hash) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("Unreadable password hash: {}", e);
                    false
                }
            },
        }
    }
}

#[async_trait]
impl AuthValidator for TokenAuthenticator {
    async fn validate_auth(&self, data: &Value, remote: &RemoteInfo) -> HookResult<AuthResponse> {
        let client_name = match data.get("client_name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.trim(),
            _ => {
                return Ok(AuthResponse::rejected(
                    StatusCode::InvalidPacket,
                    "Invalid auth data, client_name is missing",
                ))
            }
        };

        if self.enabled {
            match self.users.get(client_name) {
                Some(user) => {
                    let password = data.get("password").and_then(Value::as_str).unwrap_or("");
                    if !Self::verify_password(password, &user.credential) {
                        debug!("Wrong password for {} from {}", client_name, remote);
                        return Ok(AuthResponse::rejected(
                            StatusCode::NotAllowed,
                            "Invalid credentials",
                        ));
                    }
                }
                None if self.allow_anonymous => {}
                None => {
                    debug!("Unknown client {} from {}", client_name, remote);
                    return Ok(AuthResponse::rejected(
                        StatusCode::NotAllowed,
                        "Invalid credentials",
                    ));
                }
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(client_name.to_string(), token.clone());
        Ok(AuthResponse::ok(client_name, token))
    }
}

#[async_trait]
impl ConnectionValidator for TokenAuthenticator {
    async fn validate_conn(
        &self,
        client_id: &str,
        token: &str,
        _remote: &RemoteInfo,
    ) -> HookResult<StatusCode> {
        if !self.enabled {
            return Ok(StatusCode::Ok);
        }
        match self.tokens.get(client_id) {
            Some(issued) if issued.as_str() == token => Ok(StatusCode::Ok),
            _ => Ok(StatusCode::InvalidToken),
        }
    }
}
