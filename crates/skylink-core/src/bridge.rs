//! The bridge facade handed to whatever drives it: a home-protocol event
//! source and a command processor.

use std::sync::Arc;

use skylink_shared::{HomeUserId, RoomId};
use skylink_store::{Database, PortalRecord};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::converter::{ContentConverter, SkypeConverter};
use crate::error::Result;
use crate::home::{HomeClient, HomeEvent};
use crate::ids::PuppetIdMapper;
use crate::remote::{LoginCredentials, RemoteConnector};
use crate::user::User;

pub struct Bridge {
    ctx: Arc<BridgeContext>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        store: Database,
        home: Arc<dyn HomeClient>,
        remote: Arc<dyn RemoteConnector>,
    ) -> Self {
        let converter = Arc::new(SkypeConverter::new(PuppetIdMapper::new(&config)));
        Self::with_converter(config, store, home, remote, converter)
    }

    pub fn with_converter(
        config: BridgeConfig,
        store: Database,
        home: Arc<dyn HomeClient>,
        remote: Arc<dyn RemoteConnector>,
        converter: Arc<dyn ContentConverter>,
    ) -> Self {
        Self {
            ctx: BridgeContext::new(config, store, home, remote, converter),
        }
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    /// Load double puppets and reconnect every user with a stored login.
    pub async fn start(&self) -> Result<()> {
        let custom = self.ctx.registry.load_custom_puppets().await?;
        let records = self.ctx.store.lock().await.logged_in_users()?;
        info!(users = records.len(), custom_puppets = custom, "Starting bridge");

        for record in records {
            let user = self.ctx.registry.user(&record.mxid).await?;
            if let Err(err) = user.connect().await {
                warn!(user = %record.mxid, error = %err, "Failed to reconnect user on startup");
            }
        }
        Ok(())
    }

    pub async fn user(&self, mxid: &HomeUserId) -> Result<Arc<User>> {
        self.ctx.registry.user(mxid).await
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn login(
        &self,
        mxid: &HomeUserId,
        credentials: LoginCredentials,
    ) -> Result<Arc<User>> {
        let user = self.user(mxid).await?;
        user.login(credentials).await?;
        Ok(user)
    }

    pub async fn logout(&self, mxid: &HomeUserId) -> Result<()> {
        self.user(mxid).await?.logout().await
    }

    pub async fn reconnect(&self, mxid: &HomeUserId) -> Result<()> {
        self.user(mxid).await?.reconnect().await
    }

    pub async fn sync(&self, mxid: &HomeUserId, create_all: bool) -> Result<usize> {
        self.user(mxid).await?.sync_all(create_all).await
    }

    /// Portals the user is recorded as a member of.
    pub async fn portals(&self, mxid: &HomeUserId) -> Result<Vec<PortalRecord>> {
        let user = self.user(mxid).await?;
        let Some(jid) = user.jid().await else {
            return Ok(Vec::new());
        };
        let db = self.ctx.store.lock().await;
        let mut portals = Vec::new();
        for key in db.user_portal_keys(&jid)? {
            if let Some(record) = db.find_portal(&key)? {
                portals.push(record);
            }
        }
        Ok(portals)
    }

    pub async fn set_management_room(&self, mxid: &HomeUserId, room: RoomId) -> Result<()> {
        self.user(mxid).await?.set_management_room(room).await
    }

    pub async fn management_room(&self, mxid: &HomeUserId) -> Result<RoomId> {
        self.user(mxid).await?.ensure_management_room().await
    }

    // -----------------------------------------------------------------------
    // Home events
    // -----------------------------------------------------------------------

    /// Route an event from a portal room to its portal.
    pub async fn handle_home_event(&self, event: HomeEvent) -> Result<()> {
        if self.ctx.is_bridge_account(event.sender()) {
            return Ok(());
        }
        let Some(portal) = self.ctx.registry.portal_by_mxid(event.room()).await? else {
            debug!(room = %event.room(), "Event in a room that is not a portal");
            return Ok(());
        };
        let user = self.user(event.sender()).await?;

        match event {
            HomeEvent::Message(message) => portal.handle_home_message(&user, message).await,
            HomeEvent::Redaction { room, redacts, .. } => {
                portal.handle_home_redaction(&user, &room, &redacts).await
            }
            HomeEvent::Leave { .. } => portal.handle_home_leave(&user).await,
            HomeEvent::Kick { target, .. } => portal.handle_home_kick(&user, &target).await,
            HomeEvent::Invite { target, .. } => portal.handle_home_invite(&user, &target).await,
        }
    }
}
