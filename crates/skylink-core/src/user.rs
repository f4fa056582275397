//! Bridge users: home accounts linked to a remote login, and the task that
//! routes their remote events.

use std::sync::{Arc, Weak};

use skylink_shared::constants::{IGNORED_CONVERSATIONS, POWER_LEVEL_BOT, TYPING_TIMEOUT_SECS};
use skylink_shared::{HomeUserId, PortalKey, RemoteId, RoomId};
use skylink_store::UserRecord;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{upgrade, BridgeContext};
use crate::error::{BridgeError, Result};
use crate::home::{CreateRoomRequest, HomeMessage, Intent, PowerLevels};
use crate::portal::{Portal, PortalMessage};
use crate::remote::{ChatUpdate, ChatUpdateKind, RemoteClient, RemoteEvent};

/// Where a user's remote session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    Connecting,
    Connected,
    /// The remote network reported the session as gone; relogin pending.
    Expired,
}

pub(crate) struct Connection {
    pub client: Arc<dyn RemoteClient>,
    /// Cancelled when the connection is replaced or torn down.
    pub cancel: CancellationToken,
}

pub struct User {
    ctx: Weak<BridgeContext>,
    mxid: HomeUserId,
    pub(crate) record: Mutex<UserRecord>,
    pub(crate) connection: Mutex<Option<Connection>>,
    state: watch::Sender<SessionState>,
    /// Held during the post-login sync and while routing inbound messages.
    pub(crate) sync_lock: Arc<Mutex<()>>,
    mgmt_lock: Mutex<()>,
}

impl User {
    pub(crate) fn new(ctx: &Weak<BridgeContext>, record: UserRecord) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::LoggedOut);
        Arc::new(Self {
            ctx: ctx.clone(),
            mxid: record.mxid.clone(),
            record: Mutex::new(record),
            connection: Mutex::new(None),
            state,
            sync_lock: Arc::new(Mutex::new(())),
            mgmt_lock: Mutex::new(()),
        })
    }

    pub fn mxid(&self) -> &HomeUserId {
        &self.mxid
    }

    /// Remote id of the logged-in account.
    pub async fn jid(&self) -> Option<RemoteId> {
        self.record.lock().await.jid.clone()
    }

    pub async fn record(&self) -> UserRecord {
        self.record.lock().await.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(user = %self.mxid, from = ?previous, to = ?state, "Session state changed");
        }
    }

    pub(crate) fn ctx(&self) -> Result<Arc<BridgeContext>> {
        upgrade(&self.ctx)
    }

    pub async fn client(&self) -> Option<Arc<dyn RemoteClient>> {
        self.connection.lock().await.as_ref().map(|c| c.client.clone())
    }

    pub(crate) async fn require_client(&self) -> Result<Arc<dyn RemoteClient>> {
        self.client().await.ok_or(BridgeError::NotConnected)
    }

    /// Token for work that must stop when this connection goes away.
    pub(crate) async fn child_token(&self) -> Option<CancellationToken> {
        self.connection.lock().await.as_ref().map(|c| c.cancel.child_token())
    }

    pub async fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected && self.connection.lock().await.is_some()
    }

    /// Portal key of a remote conversation as seen by this user.
    pub async fn portal_key(&self, conversation: &str) -> Result<PortalKey> {
        let jid = self.jid().await.ok_or(BridgeError::NotLoggedIn)?;
        Ok(PortalKey::new(conversation, jid.as_str()))
    }

    pub(crate) async fn save(&self) -> Result<()> {
        let ctx = self.ctx()?;
        let record = self.record.lock().await;
        ctx.store.lock().await.update_user(&record)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Management room
    // -----------------------------------------------------------------------

    pub async fn management_room(&self) -> Option<RoomId> {
        self.record.lock().await.management_room.clone()
    }

    /// Make `room` this user's management room, taking it from whoever had it.
    pub async fn set_management_room(&self, room: RoomId) -> Result<()> {
        let ctx = self.ctx()?;
        let released = ctx.store.lock().await.release_management_room(&room, &self.mxid)?;
        if released > 0 {
            for other in ctx.registry.loaded_users().await {
                if other.mxid == self.mxid {
                    continue;
                }
                let mut record = other.record.lock().await;
                if record.management_room.as_ref() == Some(&room) {
                    record.management_room = None;
                }
            }
        }

        let mut record = self.record.lock().await;
        record.management_room = Some(room.clone());
        ctx.store.lock().await.update_user(&record)?;
        info!(user = %self.mxid, room = %room, released, "Set management room");
        Ok(())
    }

    /// The management room, created as a direct chat with the bot if missing.
    pub async fn ensure_management_room(&self) -> Result<RoomId> {
        let _guard = self.mgmt_lock.lock().await;
        if let Some(room) = self.management_room().await {
            return Ok(room);
        }

        let ctx = self.ctx()?;
        let mut power_levels = PowerLevels::default();
        power_levels.ensure_user_level(ctx.bot_mxid(), POWER_LEVEL_BOT);
        let room = ctx
            .home
            .create_room(CreateRoomRequest {
                creator: Intent::Bot,
                name: None,
                topic: None,
                invite: vec![self.mxid.clone()],
                is_direct: true,
                power_levels,
                initial_state: Vec::new(),
            })
            .await?;
        self.set_management_room(room.clone()).await?;
        Ok(room)
    }

    /// Tell the user something through the management room, best effort.
    pub async fn notify(&self, text: &str) {
        let result = async {
            let ctx = self.ctx()?;
            let room = self.ensure_management_room().await?;
            ctx.home
                .send_message(&Intent::Bot, &room, &HomeMessage::notice(text), None)
                .await
        }
        .await;
        if let Err(err) = result {
            warn!(user = %self.mxid, error = %err, "Failed to notify user");
        }
    }

    // -----------------------------------------------------------------------
    // Remote event routing
    // -----------------------------------------------------------------------

    /// Drain the connection's event queue until it closes or is cancelled.
    pub(crate) async fn run_events(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RemoteEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.handle_event(event).await {
                warn!(user = %self.mxid, error = %err, "Failed to handle remote event");
            }
        }
        debug!(user = %self.mxid, "Remote event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: RemoteEvent) -> Result<()> {
        let ctx = self.ctx()?;
        match event {
            RemoteEvent::Message(message) => {
                if IGNORED_CONVERSATIONS.contains(&message.conversation.as_str()) {
                    return Ok(());
                }
                let _guard = self.sync_lock.lock().await;
                let key = self.portal_key(&message.conversation).await?;
                let portal = ctx.registry.portal(&key).await?;
                portal
                    .enqueue(PortalMessage {
                        source: self.clone(),
                        message,
                    })
                    .await;
            }
            RemoteEvent::Typing { conversation, sender, typing } => {
                if self.jid().await.as_ref() == Some(&sender) {
                    return Ok(());
                }
                let Some(portal) = self.existing_portal(&conversation).await? else {
                    return Ok(());
                };
                let Some(room) = portal.mxid().await else {
                    return Ok(());
                };
                let intent = ctx.registry.puppet(&sender).await?.intent_for(portal.key()).await;
                let timeout = if typing { TYPING_TIMEOUT_SECS as u64 * 1000 } else { 0 };
                ctx.home.set_typing(&intent, &room, typing, timeout).await?;
            }
            RemoteEvent::Presence { sender, online } => {
                let puppet = ctx.registry.puppet(&sender).await?;
                ctx.home.set_presence(&puppet.default_intent(), online).await?;
            }
            RemoteEvent::ChatUpdate(update) => self.handle_chat_update(update).await?,
            RemoteEvent::ContactAvatar { contact, url } => {
                let client = self.require_client().await?;
                ctx.registry
                    .puppet(&contact)
                    .await?
                    .update_avatar(client.as_ref(), &url)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_chat_update(self: &Arc<Self>, update: ChatUpdate) -> Result<()> {
        let ctx = self.ctx()?;
        let ChatUpdate { conversation, initiator, kind } = update;

        if let ChatUpdateKind::MembersAdded(members) = &kind {
            let key = self.portal_key(&conversation).await?;
            let portal = ctx.registry.portal(&key).await?;
            let room = match portal.mxid().await {
                Some(room) => room,
                None => return portal.create_room(self, None).await.map(|_| ()),
            };
            for member in members {
                let puppet = ctx.registry.puppet(member).await?;
                ctx.home.ensure_joined(&puppet.default_intent(), &room).await?;
            }
            return Ok(());
        }

        let Some(portal) = self.existing_portal(&conversation).await? else {
            debug!(user = %self.mxid, conversation, "Chat update for unknown conversation");
            return Ok(());
        };
        let intent = if initiator.is_empty() {
            None
        } else {
            Some(ctx.registry.puppet(&initiator).await?.intent_for(portal.key()).await)
        };

        match kind {
            ChatUpdateKind::Topic(name) => {
                portal.update_name(&name, intent).await?;
            }
            ChatUpdateKind::Picture(url) => {
                portal.update_avatar(self, &url, intent).await?;
            }
            ChatUpdateKind::MembersRemoved(members) => {
                if let Some(room) = portal.mxid().await {
                    for member in members {
                        let puppet = ctx.registry.puppet(&member).await?;
                        ctx.home.leave(&puppet.default_intent(), &room).await?;
                    }
                }
            }
            ChatUpdateKind::ThreadDeleted => {
                portal.delete().await?;
                portal.cleanup(false).await?;
            }
            ChatUpdateKind::MembersAdded(_) => {}
        }
        Ok(())
    }

    /// The portal of a conversation, only if one was ever created for it.
    async fn existing_portal(&self, conversation: &str) -> Result<Option<Arc<Portal>>> {
        let ctx = self.ctx()?;
        let key = self.portal_key(conversation).await?;
        if let Some(portal) = ctx.registry.loaded_portal(&key).await {
            return Ok(Some(portal));
        }
        let stored = ctx.store.lock().await.find_portal(&key)?;
        match stored {
            Some(_) => Ok(Some(ctx.registry.portal(&key).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{now, text_message, Harness, BOB_JID, GROUP};

    #[tokio::test]
    async fn management_room_moves_between_users() {
        let harness = Harness::new().await;
        let ctx = harness.ctx();
        let alice = ctx.registry.user(&"@alice:example.org".into()).await.unwrap();
        let carol = ctx.registry.user(&"@carol:example.org".into()).await.unwrap();
        let room = RoomId::from("!mgmt:example.org");

        alice.set_management_room(room.clone()).await.unwrap();
        carol.set_management_room(room.clone()).await.unwrap();

        assert_eq!(alice.management_room().await, None);
        assert_eq!(carol.management_room().await, Some(room));
        let stored = ctx.store.lock().await.find_user_by_mxid(alice.mxid()).unwrap().unwrap();
        assert_eq!(stored.management_room, None);
    }

    #[tokio::test]
    async fn management_room_is_created_once() {
        let harness = Harness::new().await;
        let user = harness.ctx().registry.user(&"@dave:example.org".into()).await.unwrap();

        let (first, second) =
            tokio::join!(user.ensure_management_room(), user.ensure_management_room());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(harness.home.rooms_created(), 1);
        assert!(harness.home.last_create_request().unwrap().is_direct);
    }

    #[tokio::test]
    async fn events_are_routed_to_portals() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();

        let call = text_message("x1", "", "48:calllogs", BOB_JID, now(), "call");
        harness.remote.push(RemoteEvent::Message(call));
        harness.remote.push(RemoteEvent::Typing {
            conversation: GROUP.into(),
            sender: BOB_JID.into(),
            typing: true,
        });
        harness
            .remote
            .push(RemoteEvent::Message(text_message("r1", "", GROUP, BOB_JID, now(), "routed")));
        harness.wait_for_messages(&room, 1).await;

        assert_eq!(harness.home.messages_in(&room)[0].message.body, "routed");
        let ignored = user.portal_key("48:calllogs").await.unwrap();
        assert!(harness.ctx().registry.loaded_portal(&ignored).await.is_none());
        let typing = harness.home.typing();
        let bob = Intent::Ghost("@skype&8-bob:example.org".into());
        assert_eq!(typing, vec![(bob, room, true, 15_000)]);
    }

    #[tokio::test]
    async fn thread_deleted_removes_portal() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();

        harness.remote.push(RemoteEvent::ChatUpdate(ChatUpdate {
            conversation: GROUP.into(),
            initiator: BOB_JID.into(),
            kind: ChatUpdateKind::ThreadDeleted,
        }));

        harness
            .eventually(|| harness.home.leaves().contains(&(Intent::Bot, room.clone())))
            .await;
        assert!(harness.ctx().store.lock().await.find_portal(portal.key()).unwrap().is_none());
    }
}
