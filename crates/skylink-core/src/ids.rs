//! Deterministic mapping between remote contact ids and puppet home ids.

use skylink_shared::constants::USER_SUFFIX;
use skylink_shared::{HomeUserId, RemoteId};

use crate::config::BridgeConfig;

const LIVE_PREFIX_ESCAPED: &str = "8-live-";
const LIVE_PREFIX: &str = "8:live:";
const PLAIN_PREFIX_ESCAPED: &str = "8-";
const PLAIN_PREFIX: &str = "8:";

/// Formats and parses puppet home ids from the configured username template.
///
/// Pure and cheap to clone; no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuppetIdMapper {
    prefix: String,
    suffix: String,
    domain: String,
    displayname_template: String,
}

impl PuppetIdMapper {
    pub fn new(config: &BridgeConfig) -> Self {
        let (prefix, suffix) = config
            .username_template
            .split_once("{{.}}")
            .unwrap_or((config.username_template.as_str(), ""));
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            domain: config.homeserver_domain.clone(),
            displayname_template: config.displayname_template.clone(),
        }
    }

    /// `8:live:bob@s.skype.net` becomes `@skype&8-live-bob:domain`.
    pub fn puppet_mxid(&self, jid: &RemoteId) -> HomeUserId {
        let localpart = jid.bare().replace(':', "-");
        HomeUserId(format!(
            "@{}{}{}:{}",
            self.prefix, localpart, self.suffix, self.domain
        ))
    }

    /// Reverse of [`puppet_mxid`](Self::puppet_mxid). `None` for non-puppets.
    pub fn parse_puppet_mxid(&self, mxid: &HomeUserId) -> Option<RemoteId> {
        let rest = mxid.as_str().strip_prefix('@')?;
        let (localpart, server) = rest.split_once(':')?;
        if server != self.domain {
            return None;
        }
        let escaped = localpart
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if escaped.is_empty() {
            return None;
        }

        let restored = if let Some(tail) = escaped.strip_prefix(LIVE_PREFIX_ESCAPED) {
            format!("{LIVE_PREFIX}{tail}")
        } else if let Some(tail) = escaped.strip_prefix(PLAIN_PREFIX_ESCAPED) {
            format!("{PLAIN_PREFIX}{tail}")
        } else {
            escaped.to_string()
        };
        Some(RemoteId(format!("{restored}{USER_SUFFIX}")))
    }

    pub fn is_puppet(&self, mxid: &HomeUserId) -> bool {
        self.parse_puppet_mxid(mxid).is_some()
    }

    pub fn displayname(&self, name: &str) -> String {
        self.displayname_template.replace("{{.}}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PuppetIdMapper {
        let config = BridgeConfig {
            homeserver_domain: "example.org".into(),
            ..BridgeConfig::default()
        };
        PuppetIdMapper::new(&config)
    }

    #[test]
    fn formats_puppet_ids() {
        let mapper = mapper();
        let mxid = mapper.puppet_mxid(&RemoteId::from("8:live:bob@s.skype.net"));
        assert_eq!(mxid.as_str(), "@skype&8-live-bob:example.org");
    }

    #[test]
    fn parses_back_to_remote_ids() {
        let mapper = mapper();
        for jid in ["8:live:bob@s.skype.net", "8:carol@s.skype.net"] {
            let mxid = mapper.puppet_mxid(&RemoteId::from(jid));
            assert_eq!(mapper.parse_puppet_mxid(&mxid).unwrap().as_str(), jid);
        }
    }

    #[test]
    fn rejects_non_puppets() {
        let mapper = mapper();
        for raw in [
            "@alice:example.org",
            "@skype&8-bob:other.org",
            "@skype&:example.org",
            "skype&8-bob:example.org",
        ] {
            assert!(!mapper.is_puppet(&HomeUserId::from(raw)), "{raw}");
        }
    }

    #[test]
    fn template_with_suffix() {
        let config = BridgeConfig {
            homeserver_domain: "example.org".into(),
            username_template: "sk_{{.}}_p".into(),
            ..BridgeConfig::default()
        };
        let mapper = PuppetIdMapper::new(&config);
        let mxid = mapper.puppet_mxid(&RemoteId::from("8:dave@s.skype.net"));
        assert_eq!(mxid.as_str(), "@sk_8-dave_p:example.org");
        assert_eq!(
            mapper.parse_puppet_mxid(&mxid).unwrap().as_str(),
            "8:dave@s.skype.net"
        );
        assert_eq!(mapper.displayname("Dave"), "Dave (Skype)");
    }
}
