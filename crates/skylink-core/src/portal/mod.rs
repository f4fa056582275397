//! Portals: one remote conversation bridged into one home room.
//!
//! Every portal owns a bounded inbound queue drained by a single consumer
//! task, so messages of one conversation reach the room in the order they
//! were enqueued while other portals proceed independently.

mod dedup;
mod inbound;
mod outbound;
mod room;

use std::sync::{Arc, Weak};

use skylink_shared::constants::{MAX_MESSAGE_AGE_TO_CREATE_PORTAL_SECS, RECENTLY_HANDLED_LEN};
use skylink_shared::{EventId, PortalKey, RoomId};
use skylink_store::{MessageRecord, PortalRecord};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info_span, warn, Instrument};

pub use dedup::RecentlyHandled;
use dedup::HandledState;

use crate::context::{upgrade, BridgeContext};
use crate::error::{BridgeError, Result};
use crate::home::{HomeMessage, Intent};
use crate::remote::RemoteMessage;
use crate::user::User;

/// A remote message on its way into a portal, with the user whose connection
/// delivered it.
pub struct PortalMessage {
    pub source: Arc<User>,
    pub message: RemoteMessage,
}

pub struct Portal {
    ctx: Weak<BridgeContext>,
    key: PortalKey,
    record: Mutex<PortalRecord>,
    queue: mpsc::Sender<PortalMessage>,
    /// Serializes room creation and history replay against live messages.
    room_lock: Mutex<()>,
    handled: Mutex<HandledState>,
}

impl Portal {
    /// Build a portal and start its consumer task.
    pub(crate) fn spawn(ctx: &Arc<BridgeContext>, record: PortalRecord) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ctx.config.portal_queue);
        let portal = Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            key: record.key.clone(),
            record: Mutex::new(record),
            queue: tx,
            room_lock: Mutex::new(()),
            handled: Mutex::new(HandledState::new(RECENTLY_HANDLED_LEN)),
        });

        let span = info_span!("portal", key = %portal.key);
        tokio::spawn(consume(Arc::downgrade(&portal), rx).instrument(span));
        portal
    }

    pub fn key(&self) -> &PortalKey {
        &self.key
    }

    pub fn is_private_chat(&self) -> bool {
        self.key.is_private_chat()
    }

    pub async fn record(&self) -> PortalRecord {
        self.record.lock().await.clone()
    }

    pub async fn mxid(&self) -> Option<RoomId> {
        self.record.lock().await.mxid.clone()
    }

    pub(crate) fn ctx(&self) -> Result<Arc<BridgeContext>> {
        upgrade(&self.ctx)
    }

    pub(crate) async fn require_room(&self) -> Result<RoomId> {
        self.mxid()
            .await
            .ok_or_else(|| BridgeError::Home(format!("portal {} has no room", self.key)))
    }

    /// Queue a remote message for the consumer.
    ///
    /// Waits for space up to the configured enqueue timeout, then drops the
    /// message. Returns whether it was queued.
    pub async fn enqueue(&self, item: PortalMessage) -> bool {
        let timeout = match self.ctx() {
            Ok(ctx) => ctx.config.enqueue_timeout(),
            Err(_) => return false,
        };
        match self.queue.send_timeout(item, timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(item)) => {
                warn!(
                    portal = %self.key,
                    message = %item.message.client_message_id,
                    "Portal queue is full, dropping message"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(portal = %self.key, "Portal queue closed, dropping message");
                false
            }
        }
    }

    /// Intent the bridge acts with when no specific sender applies: the other
    /// party's ghost in private chats, the bot in groups.
    pub(crate) async fn main_intent(&self) -> Result<Intent> {
        match self.key.private_chat_partner() {
            Some(partner) => {
                let ctx = self.ctx()?;
                Ok(ctx.registry.puppet(&partner).await?.default_intent())
            }
            None => Ok(Intent::Bot),
        }
    }

    pub(crate) async fn send_notice(&self, room: &RoomId, text: &str) -> Result<EventId> {
        let ctx = self.ctx()?;
        let intent = self.main_intent().await?;
        ctx.home
            .send_message(&intent, room, &HomeMessage::notice(text), None)
            .await
    }

    /// Send as `intent`, refreshing an expired double-puppet token once.
    pub(crate) async fn send_with_refresh(
        &self,
        intent: &Intent,
        room: &RoomId,
        content: &HomeMessage,
        timestamp_ms: Option<i64>,
    ) -> Result<EventId> {
        let ctx = self.ctx()?;
        match ctx.home.send_message(intent, room, content, timestamp_ms).await {
            Err(BridgeError::AuthExpired) => {
                let Intent::Custom { mxid, .. } = intent else {
                    return Err(BridgeError::AuthExpired);
                };
                let puppet = ctx
                    .registry
                    .puppet_by_custom_mxid(mxid)
                    .await?
                    .ok_or(BridgeError::AuthExpired)?;
                let fresh = puppet.refresh_custom_token().await?;
                ctx.home.send_message(&fresh, room, content, timestamp_ms).await
            }
            other => other,
        }
    }

    /// Persist a bridged message and remember its id.
    pub(crate) async fn mark_handled(&self, record: MessageRecord) -> Result<()> {
        let ctx = self.ctx()?;
        ctx.store.lock().await.insert_message(&record)?;
        self.handled.lock().await.recent.push(record.jid.clone());

        if ctx.config.delivery_receipts {
            if let Some(room) = self.mxid().await {
                if let Err(err) = ctx.home.mark_read(&Intent::Bot, &room, &record.mxid).await {
                    debug!(portal = %self.key, error = %err, "Failed to send delivery receipt");
                }
            }
        }
        debug!(portal = %self.key, message = %record.jid, event = %record.mxid, "Handled message");
        Ok(())
    }

    async fn process(self: &Arc<Self>, item: PortalMessage) {
        let PortalMessage { source, message } = item;

        if self.mxid().await.is_none() {
            let now = chrono::Utc::now().timestamp();
            if message.timestamp + MAX_MESSAGE_AGE_TO_CREATE_PORTAL_SECS < now {
                debug!(
                    portal = %self.key,
                    message = %message.client_message_id,
                    "Not creating portal room for stale message"
                );
                return;
            }
            if let Err(err) = self.create_room(&source, None).await {
                error!(portal = %self.key, error = %err, "Failed to create portal room");
                return;
            }
        }

        let _guard = self.room_lock.lock().await;
        let message_id = message.client_message_id.clone();
        match self.handle_remote_message(&source, message).await {
            Ok(()) => {}
            Err(BridgeError::DuplicateMessage) => {
                debug!(portal = %self.key, message = %message_id, "Skipping duplicate message");
            }
            Err(BridgeError::UnknownContentType(kind)) => {
                warn!(
                    portal = %self.key,
                    message = %message_id,
                    kind = %kind,
                    "Dropping message of unknown type"
                );
            }
            Err(err) => {
                error!(
                    portal = %self.key,
                    message = %message_id,
                    error = %err,
                    "Failed to handle message"
                );
            }
        }
    }
}

async fn consume(portal: Weak<Portal>, mut rx: mpsc::Receiver<PortalMessage>) {
    while let Some(item) = rx.recv().await {
        let Some(portal) = portal.upgrade() else {
            break;
        };
        portal.process(item).await;
    }
    debug!("Portal consumer stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{now, text_message, Harness, BOB_JID, GROUP};

    #[tokio::test]
    async fn full_queue_drops_after_enqueue_timeout() {
        let harness = Harness::with_config(|config| {
            config.portal_queue = 1;
            config.enqueue_timeout_ms = 200;
        })
        .await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        let ts = now();
        let item = |cmid: &str, body: &str| PortalMessage {
            source: user.clone(),
            message: text_message(cmid, "", GROUP, BOB_JID, ts, body),
        };

        let held = portal.room_lock.lock().await;
        assert!(portal.enqueue(item("1", "one")).await);
        assert!(portal.enqueue(item("2", "two")).await);
        assert!(!portal.enqueue(item("3", "three")).await);
        drop(held);

        harness.wait_for_messages(&room, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let bodies: Vec<String> =
            harness.home.messages_in(&room).into_iter().map(|m| m.message.body).collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }
}
