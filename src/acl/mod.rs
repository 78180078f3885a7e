//! ACL (Access Control List) Module
//!
//! Channel authorization for sub, unsub and pub:
//! - Reserved channels, refused to every client
//! - Exact names or a trailing `*` prefix wildcard
//! - Variable substitution (%c = client_id)
//! - Role-based permissions, roles looked up by client name

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::auth::TokenAuthenticator;
use crate::config::AclConfig;
use crate::hooks::{
    HookResult, PublishValidator, RemoteInfo, SubscriptionValidator, UnsubscriptionValidator,
};
use crate::protocol::{QoS, StatusCode};

#[cfg(test)]
mod tests;

/// Channel ACL
pub struct ChannelAcl {
    /// Whether role patterns are enforced
    enabled: bool,
    /// Role definitions (name -> role)
    roles: HashMap<String, AclRoleEntry>,
    /// Default permissions for clients without a role (including anonymous)
    default_publish: Vec<String>,
    default_subscribe: Vec<String>,
    reserved: HashSet<String>,
    /// Role lookups
    auth: Arc<TokenAuthenticator>,
}

struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl AclRoleEntry {
    fn patterns(&self, access: Access) -> &[String] {
        match access {
            Access::Publish => &self.publish,
            Access::Subscribe => &self.subscribe,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Publish,
    Subscribe,
}

impl ChannelAcl {
    pub fn new(config: &AclConfig, auth: Arc<TokenAuthenticator>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default_publish: config.default.publish.clone(),
            default_subscribe: config.default.subscribe.clone(),
            reserved: config.reserved.iter().cloned().collect(),
            auth,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn matches_pattern(pattern: &str, channel: &str, client_id: &str) -> bool {
        let pattern = pattern.replace("%c", client_id);
        Self::channel_pattern_match(&pattern, channel)
    }

    /// `news*` matches every channel starting with `news`
    fn channel_pattern_match(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }

    fn check_patterns(patterns: &[String], channel: &str, client_id: &str) -> bool {
        patterns
            .iter()
            .any(|p| Self::matches_pattern(p, channel, client_id))
    }

    fn check(&self, client_id: &str, channel: &str, access: Access) -> StatusCode {
        if self.reserved.contains(channel) {
            debug!("{:?} on reserved channel {} by {}", access, channel, client_id);
            return StatusCode::NotAllowed;
        }
        if !self.enabled {
            return StatusCode::Ok;
        }

        if let Some(role) = self
            .auth
            .get_user_role(client_id)
            .and_then(|name| self.roles.get(name))
        {
            if Self::check_patterns(role.patterns(access), channel, client_id) {
                return StatusCode::Ok;
            }
        }

        let defaults = match access {
            Access::Publish => &self.default_publish,
            Access::Subscribe => &self.default_subscribe,
        };
        if Self::check_patterns(defaults, channel, client_id) {
            return StatusCode::Ok;
        }

        debug!("{:?} on {} denied for {}", access, channel, client_id);
        StatusCode::NotAllowed
    }
}

#[async_trait]
impl SubscriptionValidator for ChannelAcl {
    async fn validate_sub(
        &self,
        client_id: &str,
        channel: &str,
        _persistent: bool,
        _remote: &RemoteInfo,
    ) -> HookResult<StatusCode> {
        Ok(self.check(client_id, channel, Access::Subscribe))
    }
}

#[async_trait]
impl UnsubscriptionValidator for ChannelAcl {
    async fn validate_unsub(
        &self,
        client_id: &str,
        channel: &str,
        _remote: &RemoteInfo,
    ) -> HookResult<StatusCode> {
        Ok(self.check(client_id, channel, Access::Subscribe))
    }
}

#[async_trait]
impl PublishValidator for ChannelAcl {
    async fn validate_pub(
        &self,
        client_id: &str,
        channel: &str,
        _data: &Value,
        _qos: QoS,
        _remote: &RemoteInfo,
    ) -> HookResult<StatusCode> {
        Ok(self.check(client_id, channel, Access::Publish))
    }
}
