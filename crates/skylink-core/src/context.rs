use std::sync::{Arc, Weak};

use skylink_shared::HomeUserId;
use skylink_store::Database;
use tokio::sync::Mutex;

use crate::config::BridgeConfig;
use crate::converter::ContentConverter;
use crate::error::{BridgeError, Result};
use crate::home::HomeClient;
use crate::ids::PuppetIdMapper;
use crate::registry::IdentityRegistry;
use crate::remote::RemoteConnector;

/// Everything the bridge objects share.
///
/// Users, puppets and portals keep a [`Weak`] handle to this so the registry
/// that owns them does not form a reference cycle with it.
pub struct BridgeContext {
    pub config: BridgeConfig,
    /// Losing the store is fatal; errors from it are propagated, never retried.
    pub store: Mutex<Database>,
    pub home: Arc<dyn HomeClient>,
    pub remote: Arc<dyn RemoteConnector>,
    pub converter: Arc<dyn ContentConverter>,
    pub ids: PuppetIdMapper,
    pub registry: IdentityRegistry,
    bot: HomeUserId,
}

impl BridgeContext {
    pub fn new(
        config: BridgeConfig,
        store: Database,
        home: Arc<dyn HomeClient>,
        remote: Arc<dyn RemoteConnector>,
        converter: Arc<dyn ContentConverter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ids: PuppetIdMapper::new(&config),
            bot: config.bot_mxid(),
            config,
            store: Mutex::new(store),
            home,
            remote,
            converter,
            registry: IdentityRegistry::new(weak.clone()),
        })
    }

    pub fn bot_mxid(&self) -> &HomeUserId {
        &self.bot
    }

    /// Puppets and the bot are the bridge's own accounts.
    pub fn is_bridge_account(&self, mxid: &HomeUserId) -> bool {
        mxid == &self.bot || self.ids.is_puppet(mxid)
    }
}

pub(crate) fn upgrade(ctx: &Weak<BridgeContext>) -> Result<Arc<BridgeContext>> {
    ctx.upgrade().ok_or(BridgeError::Shutdown)
}
