use serde::{Deserialize, Serialize};

use crate::constants::{GROUP_SUFFIX, USER_SUFFIX};
use crate::error::IdError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a contact or conversation on the remote network.
    RemoteId
);
string_id!(
    /// Home-protocol room id (`!opaque:server`).
    RoomId
);
string_id!(
    /// Home-protocol event id (`$opaque`).
    EventId
);
string_id!(
    /// Home-protocol user id (`@localpart:server`).
    HomeUserId
);

impl RemoteId {
    /// Remote user ids are normalised to carry the user suffix.
    pub fn user(raw: &str) -> Result<Self, IdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if raw.contains(USER_SUFFIX) {
            Ok(Self(raw.to_string()))
        } else {
            Ok(Self(format!("{raw}{USER_SUFFIX}")))
        }
    }

    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_SUFFIX)
    }

    /// The id as the remote network spells it on the wire, without the user suffix.
    pub fn bare(&self) -> &str {
        self.0.strip_suffix(USER_SUFFIX).unwrap_or(&self.0)
    }
}

impl HomeUserId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if !raw.starts_with('@') {
            return Err(IdError::MissingSigil(raw.to_string()));
        }
        if !raw[1..].contains(':') {
            return Err(IdError::MissingServer(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn localpart(&self) -> &str {
        let rest = self.0.strip_prefix('@').unwrap_or(&self.0);
        rest.split_once(':').map(|(local, _)| local).unwrap_or(rest)
    }

    pub fn server(&self) -> &str {
        self.0.split_once(':').map(|(_, server)| server).unwrap_or("")
    }
}

/// Identifies one portal: a remote conversation as seen by one receiver.
///
/// Groups are shared by every user, so their receiver is the conversation
/// itself. Private chats are keyed per owning user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortalKey {
    pub jid: RemoteId,
    pub receiver: RemoteId,
}

impl PortalKey {
    pub fn new(jid: &str, receiver: &str) -> Self {
        let receiver = if jid.ends_with(GROUP_SUFFIX) {
            jid
        } else {
            receiver
        };
        let jid = jid.replacen(USER_SUFFIX, "", 1);
        Self {
            jid: RemoteId(jid),
            receiver: RemoteId(receiver.to_string()),
        }
    }

    /// Rebuild a key from stored columns without normalisation.
    pub fn from_parts(jid: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            jid: RemoteId(jid.into()),
            receiver: RemoteId(receiver.into()),
        }
    }

    pub fn is_private_chat(&self) -> bool {
        self.jid != self.receiver
    }

    /// Remote id of the other party of a private chat.
    pub fn private_chat_partner(&self) -> Option<RemoteId> {
        if !self.is_private_chat() {
            return None;
        }
        RemoteId::user(self.jid.as_str()).ok()
    }
}

impl std::fmt::Display for PortalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.receiver == self.jid {
            write!(f, "{}", self.jid)
        } else {
            write!(f, "{}-{}", self.jid, self.receiver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_ignores_receiver() {
        let group = "19:abcdef@thread.skype";
        for receiver in ["8:live:alice@s.skype.net", "", "anything", group] {
            let key = PortalKey::new(group, receiver);
            assert_eq!(key.receiver.as_str(), group);
            assert_eq!(key.jid.as_str(), group);
            assert!(!key.is_private_chat());
            assert_eq!(key.to_string(), group);
        }
    }

    #[test]
    fn private_key_strips_user_suffix() {
        let key = PortalKey::new("8:live:bob@s.skype.net", "8:live:alice@s.skype.net");
        assert_eq!(key.jid.as_str(), "8:live:bob");
        assert_eq!(key.receiver.as_str(), "8:live:alice@s.skype.net");
        assert!(key.is_private_chat());
        assert_eq!(key.to_string(), "8:live:bob-8:live:alice@s.skype.net");
        assert_eq!(
            key.private_chat_partner().unwrap().as_str(),
            "8:live:bob@s.skype.net"
        );
    }

    #[test]
    fn remote_user_normalisation() {
        assert_eq!(
            RemoteId::user(" 8:bob ").unwrap().as_str(),
            "8:bob@s.skype.net"
        );
        assert_eq!(
            RemoteId::user("8:bob@s.skype.net").unwrap().bare(),
            "8:bob"
        );
        assert_eq!(RemoteId::user("  "), Err(IdError::Empty));
    }

    #[test]
    fn home_user_id_parts() {
        let id = HomeUserId::parse("@alice:example.org").unwrap();
        assert_eq!(id.localpart(), "alice");
        assert_eq!(id.server(), "example.org");
        assert!(HomeUserId::parse("alice:example.org").is_err());
        assert!(HomeUserId::parse("@alice").is_err());
    }
}
