//! Bridge configuration loaded from environment variables.
//!
//! Every setting has a default matching the behaviour of a stock deployment,
//! so an empty environment yields a working configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use skylink_shared::constants::{PORTAL_QUEUE_CAPACITY, USER_EVENT_QUEUE_CAPACITY};
use skylink_shared::HomeUserId;
use skylink_store::Database;

use crate::error::Result;

/// Placeholder substituted by the username and display name templates.
const TEMPLATE_PLACEHOLDER: &str = "{{.}}";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server name of the home protocol deployment.
    /// Env: `SKYLINK_HOMESERVER_DOMAIN`
    pub homeserver_domain: String,

    /// Localpart of the bridge bot account.
    /// Env: `SKYLINK_BOT_LOCALPART`
    pub bot_localpart: String,

    /// Puppet localpart template, `{{.}}` is replaced by the escaped remote id.
    /// Env: `SKYLINK_USERNAME_TEMPLATE`
    pub username_template: String,

    /// Puppet display name template, `{{.}}` is replaced by the contact name.
    /// Env: `SKYLINK_DISPLAYNAME_TEMPLATE`
    pub displayname_template: String,

    /// Seconds to wait for an outbound send before warning the user.
    /// Env: `SKYLINK_CONNECTION_TIMEOUT`
    pub connection_timeout: u64,

    /// Probe the remote network on send timeout instead of warning right away.
    /// Env: `SKYLINK_FETCH_MESSAGE_ON_TIMEOUT`
    pub fetch_message_on_timeout: bool,

    /// Send read receipts as the bot once a message is bridged.
    /// Env: `SKYLINK_DELIVERY_RECEIPTS`
    pub delivery_receipts: bool,

    /// Seconds to wait for the conversation list after login.
    /// Env: `SKYLINK_CHAT_LIST_WAIT`
    pub chat_list_wait: u64,

    /// Seconds to wait for the post-login portal sync.
    /// Env: `SKYLINK_PORTAL_SYNC_WAIT`
    pub portal_sync_wait: u64,

    /// Conversations to create rooms for on login.
    /// Env: `SKYLINK_INITIAL_CHAT_SYNC`
    pub initial_chat_sync: usize,

    /// Messages replayed into a freshly created room.
    /// Env: `SKYLINK_INITIAL_HISTORY_FILL`
    pub initial_history_fill: usize,

    /// Conversations idle for longer than this (seconds) are not synced.
    /// Env: `SKYLINK_SYNC_CHAT_MAX_AGE`
    pub sync_chat_max_age: i64,

    /// Invite the user's own puppet into private chats before backfilling.
    /// Env: `SKYLINK_INVITE_OWN_PUPPET_FOR_BACKFILLING`
    pub invite_own_puppet_for_backfilling: bool,

    /// Give private chat rooms the contact's name and avatar.
    /// Env: `SKYLINK_PRIVATE_CHAT_PORTAL_META`
    pub private_chat_portal_meta: bool,

    /// Let any room member invite others.
    /// Env: `SKYLINK_ALLOW_USER_INVITE`
    pub allow_user_invite: bool,

    /// Create new rooms with encryption enabled.
    /// Env: `SKYLINK_ENCRYPTION_DEFAULT`
    pub encryption_default: bool,

    /// Milliseconds a producer may wait on a full portal queue before dropping.
    /// Env: `SKYLINK_ENQUEUE_TIMEOUT_MS`
    pub enqueue_timeout_ms: u64,

    /// Capacity of each connected user's remote event queue.
    /// Env: `SKYLINK_USER_EVENT_QUEUE`
    pub user_event_queue: usize,

    /// Capacity of each portal's inbound queue.
    /// Env: `SKYLINK_PORTAL_QUEUE`
    pub portal_queue: usize,

    /// Database file. Defaults to the platform data directory.
    /// Env: `SKYLINK_DATABASE_PATH`
    pub database_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_domain: "localhost".to_string(),
            bot_localpart: "skypebot".to_string(),
            username_template: "skype&{{.}}".to_string(),
            displayname_template: "{{.}} (Skype)".to_string(),
            connection_timeout: 20,
            fetch_message_on_timeout: false,
            delivery_receipts: false,
            chat_list_wait: 30,
            portal_sync_wait: 600,
            initial_chat_sync: 10,
            initial_history_fill: 20,
            sync_chat_max_age: 259_200,
            invite_own_puppet_for_backfilling: true,
            private_chat_portal_meta: false,
            allow_user_invite: false,
            encryption_default: false,
            enqueue_timeout_ms: 2_000,
            user_event_queue: USER_EVENT_QUEUE_CAPACITY,
            portal_queue: PORTAL_QUEUE_CAPACITY,
            database_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(domain) = lookup("SKYLINK_HOMESERVER_DOMAIN") {
            config.homeserver_domain = domain;
        }
        if let Some(localpart) = lookup("SKYLINK_BOT_LOCALPART") {
            config.bot_localpart = localpart;
        }
        if let Some(template) = lookup("SKYLINK_USERNAME_TEMPLATE") {
            if template.contains(TEMPLATE_PLACEHOLDER) {
                config.username_template = template;
            } else {
                tracing::warn!(
                    value = %template,
                    "SKYLINK_USERNAME_TEMPLATE lacks {{.}}, using default"
                );
            }
        }
        if let Some(template) = lookup("SKYLINK_DISPLAYNAME_TEMPLATE") {
            config.displayname_template = template;
        }

        parse_into(&lookup, "SKYLINK_CONNECTION_TIMEOUT", &mut config.connection_timeout);
        parse_flag(
            &lookup,
            "SKYLINK_FETCH_MESSAGE_ON_TIMEOUT",
            &mut config.fetch_message_on_timeout,
        );
        parse_flag(&lookup, "SKYLINK_DELIVERY_RECEIPTS", &mut config.delivery_receipts);
        parse_into(&lookup, "SKYLINK_CHAT_LIST_WAIT", &mut config.chat_list_wait);
        parse_into(&lookup, "SKYLINK_PORTAL_SYNC_WAIT", &mut config.portal_sync_wait);
        parse_into(&lookup, "SKYLINK_INITIAL_CHAT_SYNC", &mut config.initial_chat_sync);
        parse_into(&lookup, "SKYLINK_INITIAL_HISTORY_FILL", &mut config.initial_history_fill);
        parse_into(&lookup, "SKYLINK_SYNC_CHAT_MAX_AGE", &mut config.sync_chat_max_age);
        parse_flag(
            &lookup,
            "SKYLINK_INVITE_OWN_PUPPET_FOR_BACKFILLING",
            &mut config.invite_own_puppet_for_backfilling,
        );
        parse_flag(
            &lookup,
            "SKYLINK_PRIVATE_CHAT_PORTAL_META",
            &mut config.private_chat_portal_meta,
        );
        parse_flag(&lookup, "SKYLINK_ALLOW_USER_INVITE", &mut config.allow_user_invite);
        parse_flag(&lookup, "SKYLINK_ENCRYPTION_DEFAULT", &mut config.encryption_default);
        parse_into(&lookup, "SKYLINK_ENQUEUE_TIMEOUT_MS", &mut config.enqueue_timeout_ms);
        parse_into(&lookup, "SKYLINK_USER_EVENT_QUEUE", &mut config.user_event_queue);
        parse_into(&lookup, "SKYLINK_PORTAL_QUEUE", &mut config.portal_queue);

        if let Some(path) = lookup("SKYLINK_DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        // Queues with zero capacity would panic on creation.
        config.user_event_queue = config.user_event_queue.max(1);
        config.portal_queue = config.portal_queue.max(1);

        config
    }

    /// Open the configured database, or the one in the platform data
    /// directory when no path is set.
    pub fn open_store(&self) -> Result<Database> {
        let db = match &self.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(db)
    }

    pub fn bot_mxid(&self) -> HomeUserId {
        HomeUserId(format!("@{}:{}", self.bot_localpart, self.homeserver_domain))
    }

    pub fn format_username(&self, localpart: &str) -> String {
        self.username_template.replace(TEMPLATE_PLACEHOLDER, localpart)
    }

    pub fn format_displayname(&self, name: &str) -> String {
        self.displayname_template.replace(TEMPLATE_PLACEHOLDER, name)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn chat_list_wait(&self) -> Duration {
        Duration::from_secs(self.chat_list_wait)
    }

    pub fn portal_sync_wait(&self) -> Duration {
        Duration::from_secs(self.portal_sync_wait)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid value, using default");
            }
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(raw) = lookup(key) {
        *target = raw != "false" && raw != "0";
    }
}
