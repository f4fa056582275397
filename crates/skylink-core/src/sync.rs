//! Contact and conversation sync after login.

use std::cmp::Reverse;
use std::sync::Arc;

use skylink_shared::constants::IGNORED_CONVERSATIONS;
use skylink_store::UserPortalRecord;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::puppet::contact_name;
use crate::remote::{RemoteClient, RemoteContact, RemoteConversation};
use crate::user::User;

impl User {
    /// Create or refresh a puppet for every contact.
    pub async fn sync_puppets(
        &self,
        client: &dyn RemoteClient,
        contacts: &[RemoteContact],
    ) -> Result<usize> {
        let ctx = self.ctx()?;
        let mut updated = 0;
        for contact in contacts {
            let puppet = ctx.registry.puppet(&contact.id).await?;
            match puppet.update_from_contact(client, contact).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(err) => {
                    let (name, _) = contact_name(contact);
                    warn!(
                        user = %self.mxid(),
                        contact = %contact.id,
                        name,
                        error = %err,
                        "Failed to sync puppet"
                    );
                }
            }
        }
        debug!(user = %self.mxid(), contacts = contacts.len(), updated, "Synced puppets");
        Ok(updated)
    }

    /// Bridge the user's recent conversations.
    pub async fn sync_portals(
        self: &Arc<Self>,
        conversations: Vec<RemoteConversation>,
        create_all: bool,
    ) -> Result<usize> {
        let _guard = self.sync_lock.lock().await;
        let since = self.record.lock().await.last_connection;
        self.sync_portals_locked(conversations, create_all, since).await
    }

    /// Conversations are taken newest first. Rooms are created for the first
    /// `initial_chat_sync` of them, for every one active since `since`, or for
    /// all with `create_all`; existing rooms are backfilled. Nothing older
    /// than `sync_chat_max_age` is touched.
    async fn sync_portals_locked(
        self: &Arc<Self>,
        conversations: Vec<RemoteConversation>,
        create_all: bool,
        since: i64,
    ) -> Result<usize> {
        let ctx = self.ctx()?;
        let jid = self.jid().await.ok_or(BridgeError::NotLoggedIn)?;

        let mut chats: Vec<(RemoteConversation, i64)> = conversations
            .into_iter()
            .filter(|c| !IGNORED_CONVERSATIONS.contains(&c.id.as_str()) && !c.left)
            .filter_map(|c| c.last_message_ts.map(|ts| (c, ts)))
            .collect();
        chats.sort_by_key(|(_, ts)| Reverse(*ts));

        let mut portals = Vec::with_capacity(chats.len());
        let mut memberships = Vec::with_capacity(chats.len());
        for (chat, ts) in &chats {
            let key = self.portal_key(&chat.id).await?;
            portals.push((ctx.registry.portal(&key).await?, *ts));
            memberships.push(UserPortalRecord {
                user_jid: jid.clone(),
                portal: key,
                in_community: false,
            });
        }
        ctx.store.lock().await.set_user_portals(&jid, &memberships)?;

        let now = chrono::Utc::now().timestamp();
        let mut synced = 0;
        for (index, (portal, ts)) in portals.into_iter().enumerate() {
            if ts + ctx.config.sync_chat_max_age < now {
                break;
            }
            let active_since_connect = since > 0 && ts >= since;
            let result = if portal.mxid().await.is_some() {
                portal.backfill(self).await.map(|_| ())
            } else if create_all || index < ctx.config.initial_chat_sync || active_since_connect {
                portal.create_room(self, None).await.map(|_| ())
            } else {
                continue;
            };
            match result {
                Ok(()) => synced += 1,
                Err(err) => warn!(
                    user = %self.mxid(),
                    portal = %portal.key(),
                    error = %err,
                    "Failed to sync portal"
                ),
            }
        }
        info!(user = %self.mxid(), synced, "Finished syncing portals");
        Ok(synced)
    }

    /// Full resync: contacts, then conversations.
    pub async fn sync_all(self: &Arc<Self>, create_all: bool) -> Result<usize> {
        let client = self.require_client().await?;
        let contacts = client.contacts().await?;
        self.sync_puppets(client.as_ref(), &contacts).await?;
        let conversations = client.conversations().await?;
        self.sync_portals(conversations, create_all).await
    }

    /// Runs once per established connection while holding the sync lock, so
    /// inbound messages wait until the initial sync is done or gives up.
    /// `since` is the connection time recorded before this one.
    pub(crate) async fn post_login(self: Arc<Self>, _sync_guard: OwnedMutexGuard<()>, since: i64) {
        let (ctx, client) = match (self.ctx(), self.client().await) {
            (Ok(ctx), Some(client)) => (ctx, client),
            _ => return,
        };

        match client.contacts().await {
            Ok(contacts) => {
                if let Err(err) = self.sync_puppets(client.as_ref(), &contacts).await {
                    warn!(user = %self.mxid(), error = %err, "Failed to sync contacts");
                }
            }
            Err(err) => warn!(user = %self.mxid(), error = %err, "Failed to fetch contacts"),
        }

        let listed =
            tokio::time::timeout(ctx.config.chat_list_wait(), client.conversations()).await;
        let conversations = match listed {
            Ok(Ok(conversations)) => conversations,
            Ok(Err(err)) => {
                warn!(user = %self.mxid(), error = %err, "Failed to fetch chat list");
                return;
            }
            Err(_) => {
                warn!(user = %self.mxid(), "Timed out waiting for chat list");
                return;
            }
        };

        let user = self.clone();
        let sync = tokio::spawn(async move {
            user.sync_portals_locked(conversations, false, since).await
        });
        match tokio::time::timeout(ctx.config.portal_sync_wait(), sync).await {
            Ok(Ok(Ok(_))) => debug!(user = %self.mxid(), "Post-login sync complete"),
            Ok(Ok(Err(err))) => warn!(user = %self.mxid(), error = %err, "Post-login sync failed"),
            Ok(Err(err)) => warn!(user = %self.mxid(), error = %err, "Post-login sync task failed"),
            Err(_) => warn!(
                user = %self.mxid(),
                "Timed out waiting for portal sync, resuming message processing"
            ),
        }
    }
}
