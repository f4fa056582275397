//! Room lifecycle of a portal: creation, metadata, membership, history and
//! teardown.

use std::sync::Arc;

use serde_json::json;
use skylink_shared::constants::{
    BRIDGE_INFO_EVENT, BRIDGE_INFO_EVENT_LEGACY, POWER_LEVEL_ADMIN, POWER_LEVEL_BOT,
    POWER_LEVEL_INVITE, POWER_LEVEL_OWNER, POWER_LEVEL_SUPERADMIN, PRIVATE_CHAT_TOPIC, PROTOCOL_ID,
    PROTOCOL_NAME, PROTOCOL_URL,
};
use skylink_shared::RoomId;
use skylink_store::UserPortalRecord;
use tracing::{debug, info, warn};

use super::Portal;
use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::home::{CreateRoomRequest, Intent, PowerLevels, StateEvent};
use crate::remote::{GroupInfo, GroupRole, RemoteMedia};
use crate::user::User;

const POWER_LEVELS_EVENT: &str = "m.room.power_levels";

impl Portal {
    /// Create the home room if it does not exist yet and return its id.
    ///
    /// Concurrent callers are serialized; everyone after the first gets the
    /// room the first one created.
    pub async fn create_room(
        self: &Arc<Self>,
        user: &Arc<User>,
        info: Option<GroupInfo>,
    ) -> Result<RoomId> {
        let _guard = self.room_lock.lock().await;
        self.create_room_locked(user, info).await
    }

    async fn create_room_locked(
        self: &Arc<Self>,
        user: &Arc<User>,
        info: Option<GroupInfo>,
    ) -> Result<RoomId> {
        if let Some(room) = self.mxid().await {
            return Ok(room);
        }
        let ctx = self.ctx()?;
        let creator = self.main_intent().await?;

        let mut levels = PowerLevels {
            invite: if ctx.config.allow_user_invite { 0 } else { POWER_LEVEL_INVITE },
            ..PowerLevels::default()
        };
        levels.ensure_user_level(ctx.bot_mxid(), POWER_LEVEL_BOT);
        levels.ensure_user_level(&creator.user_id(ctx.bot_mxid()), POWER_LEVEL_BOT);

        let mut record = self.record().await;
        let mut group = None;
        if self.is_private_chat() {
            if ctx.config.private_chat_portal_meta {
                if let Some(partner) = self.key.private_chat_partner() {
                    let puppet = ctx.registry.puppet(&partner).await?.record().await;
                    record.name = puppet.displayname;
                    record.avatar = puppet.avatar;
                    record.avatar_url = puppet.avatar_url;
                }
            }
            record.topic = PRIVATE_CHAT_TOPIC.to_string();
        } else {
            levels.ensure_user_level(user.mxid(), POWER_LEVEL_OWNER);
            let info = match info {
                Some(info) => info,
                None => user.require_client().await?.group_info(self.key.jid.as_str()).await?,
            };
            record.name = info.name.clone();
            record.topic = info.topic.clone();
            for participant in &info.participants {
                let level = role_level(participant.role);
                if level > 0 {
                    levels.ensure_user_level(&ctx.ids.puppet_mxid(&participant.id), level);
                }
            }
            group = Some(info);
        }
        record.encrypted = ctx.config.encryption_default;

        let mut initial_state = self.bridge_info(&ctx);
        if record.encrypted {
            initial_state.push(StateEvent {
                event_type: "m.room.encryption".to_string(),
                state_key: String::new(),
                content: json!({ "algorithm": "m.megolm.v1.aes-sha2" }),
            });
        }
        if !record.avatar_url.is_empty() {
            initial_state.push(StateEvent {
                event_type: "m.room.avatar".to_string(),
                state_key: String::new(),
                content: json!({ "url": record.avatar_url }),
            });
        }

        let room = ctx
            .home
            .create_room(CreateRoomRequest {
                creator,
                name: Some(record.name.clone()).filter(|n| !n.is_empty()),
                topic: Some(record.topic.clone()).filter(|t| !t.is_empty()),
                invite: vec![user.mxid().clone()],
                is_direct: self.is_private_chat(),
                power_levels: levels,
                initial_state,
            })
            .await?;

        let room = {
            let mut current = self.record.lock().await;
            let stored = ctx.store.lock().await.find_portal(&self.key)?.and_then(|r| r.mxid);
            match stored {
                Some(existing) if existing != room => {
                    let race = BridgeError::RoomCreateRace(room.clone());
                    warn!(
                        portal = %self.key,
                        kept = %existing,
                        error = %race,
                        "Keeping previously stored room"
                    );
                    current.mxid = Some(existing.clone());
                    existing
                }
                _ => {
                    record.mxid = Some(room.clone());
                    ctx.store.lock().await.update_portal(&record)?;
                    *current = record;
                    room
                }
            }
        };
        info!(portal = %self.key, room = %room, "Created portal room");
        ctx.registry.register_portal_mxid(room.clone(), self).await;

        if let Some(info) = group.as_ref() {
            if let Err(err) = self.sync_participants(user, info).await {
                warn!(portal = %self.key, error = %err, "Failed to sync participants");
            }
        }
        if let Some(jid) = user.jid().await {
            ctx.store.lock().await.add_user_portal(&UserPortalRecord {
                user_jid: jid,
                portal: self.key.clone(),
                in_community: false,
            })?;
        }
        if let Err(err) = self.backfill_locked(user, Some(ctx.config.initial_history_fill)).await {
            warn!(portal = %self.key, error = %err, "Failed to fill initial history");
        }
        Ok(room)
    }

    fn bridge_info(&self, ctx: &BridgeContext) -> Vec<StateEvent> {
        let state_key = format!("net.maunium.skype://skype/{}", self.key.jid);
        let content = json!({
            "bridgebot": ctx.bot_mxid().as_str(),
            "creator": ctx.bot_mxid().as_str(),
            "protocol": {
                "id": PROTOCOL_ID,
                "displayname": PROTOCOL_NAME,
                "external_url": PROTOCOL_URL,
            },
            "channel": { "id": self.key.jid.as_str() },
        });
        [BRIDGE_INFO_EVENT, BRIDGE_INFO_EVENT_LEGACY]
            .into_iter()
            .map(|event_type| StateEvent {
                event_type: event_type.to_string(),
                state_key: state_key.clone(),
                content: content.clone(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub async fn update_name(&self, name: &str, intent: Option<Intent>) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut record = self.record.lock().await;
        if record.name == name {
            return Ok(false);
        }
        if let Some(room) = record.mxid.clone() {
            let intent = match intent {
                Some(intent) => intent,
                None => self.main_intent().await?,
            };
            ctx.home
                .set_state(&intent, &room, "m.room.name", "", json!({ "name": name }))
                .await?;
        }
        record.name = name.to_string();
        ctx.store.lock().await.update_portal(&record)?;
        debug!(portal = %self.key, name, "Updated portal name");
        Ok(true)
    }

    pub async fn update_topic(&self, topic: &str, intent: Option<Intent>) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut record = self.record.lock().await;
        if record.topic == topic {
            return Ok(false);
        }
        if let Some(room) = record.mxid.clone() {
            let intent = match intent {
                Some(intent) => intent,
                None => self.main_intent().await?,
            };
            ctx.home
                .set_state(&intent, &room, "m.room.topic", "", json!({ "topic": topic }))
                .await?;
        }
        record.topic = topic.to_string();
        ctx.store.lock().await.update_portal(&record)?;
        Ok(true)
    }

    /// Mirror the conversation picture. An empty URL clears it.
    pub async fn update_avatar(
        &self,
        user: &User,
        url: &str,
        intent: Option<Intent>,
    ) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut record = self.record.lock().await;
        if record.avatar == url {
            return Ok(false);
        }

        let content_uri = if url.is_empty() {
            String::new()
        } else {
            let media = RemoteMedia {
                url: url.to_string(),
                file_name: "avatar".to_string(),
                mimetype: "image/jpeg".to_string(),
            };
            let data = user.require_client().await?.download_media(&media).await?;
            ctx.home.upload(data, &media.mimetype).await?
        };
        if let Some(room) = record.mxid.clone() {
            let intent = match intent {
                Some(intent) => intent,
                None => self.main_intent().await?,
            };
            ctx.home
                .set_state(&intent, &room, "m.room.avatar", "", json!({ "url": content_uri }))
                .await?;
        }
        record.avatar = url.to_string();
        record.avatar_url = content_uri;
        ctx.store.lock().await.update_portal(&record)?;
        Ok(true)
    }

    /// Refresh name, topic and members from the remote group.
    pub async fn update_metadata(&self, user: &Arc<User>) -> Result<bool> {
        if self.is_private_chat() {
            return Ok(false);
        }
        let info = user.require_client().await?.group_info(self.key.jid.as_str()).await?;
        let mut changed = self.update_name(&info.name, None).await?;
        changed |= self.update_topic(&info.topic, None).await?;
        if let Some(url) = info.avatar_url.as_deref() {
            changed |= self.update_avatar(user, url, None).await?;
        }
        self.sync_participants(user, &info).await?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Join every member's puppet and mirror admin roles as power levels.
    pub async fn sync_participants(&self, user: &User, info: &GroupInfo) -> Result<()> {
        let ctx = self.ctx()?;
        let room = self.require_room().await?;

        let current = ctx.home.get_state(&room, POWER_LEVELS_EVENT, "").await?;
        let mut levels: PowerLevels = match current {
            Some(content) => {
                serde_json::from_value(content).map_err(|e| BridgeError::Home(e.to_string()))?
            }
            None => PowerLevels::default(),
        };
        let mut changed = false;

        for participant in &info.participants {
            let puppet = ctx.registry.puppet(&participant.id).await?;
            if let Err(err) = ctx.home.ensure_joined(&puppet.default_intent(), &room).await {
                warn!(
                    portal = %self.key,
                    puppet = %participant.id,
                    error = %err,
                    "Failed to join puppet"
                );
            }
            changed |= levels.ensure_user_level(puppet.mxid(), role_level(participant.role));

            if let Some(member) = ctx.registry.user_by_jid(&participant.id).await? {
                if member.mxid() != user.mxid() {
                    if let Err(err) = ctx.home.invite(&Intent::Bot, &room, member.mxid()).await {
                        debug!(
                            portal = %self.key,
                            user = %member.mxid(),
                            error = %err,
                            "Failed to invite user"
                        );
                    }
                }
            }
        }

        if changed {
            let content =
                serde_json::to_value(&levels).map_err(|e| BridgeError::Home(e.to_string()))?;
            ctx.home
                .set_state(&Intent::Bot, &room, POWER_LEVELS_EVENT, "", content)
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Replay messages newer than the last bridged one.
    pub async fn backfill(&self, user: &Arc<User>) -> Result<usize> {
        let _guard = self.room_lock.lock().await;
        self.backfill_locked(user, None).await
    }

    async fn backfill_locked(&self, user: &Arc<User>, limit: Option<usize>) -> Result<usize> {
        let ctx = self.ctx()?;
        if limit == Some(0) {
            return Ok(0);
        }
        let since = ctx
            .store
            .lock()
            .await
            .last_message_in_chat(&self.key)?
            .map(|row| row.timestamp)
            .unwrap_or(0);

        let client = user.require_client().await?;
        let mut messages = client.history(self.key.jid.as_str(), since, limit).await?;
        if messages.is_empty() {
            return Ok(0);
        }
        messages.sort_by_key(|m| m.timestamp);

        if self.is_private_chat() && ctx.config.invite_own_puppet_for_backfilling {
            if let (Some(room), Some(own)) = (self.mxid().await, user.jid().await) {
                let puppet = ctx.registry.puppet(&own).await?;
                let intent = self.main_intent().await?;
                if let Err(err) = ctx.home.invite(&intent, &room, puppet.mxid()).await {
                    debug!(
                        portal = %self.key,
                        error = %err,
                        "Failed to invite own puppet for backfilling"
                    );
                }
            }
        }

        let mut bridged = 0;
        for message in messages {
            match self.handle_remote_message(user, message).await {
                Ok(()) => bridged += 1,
                Err(BridgeError::DuplicateMessage) => {}
                Err(err) => warn!(portal = %self.key, error = %err, "Failed to backfill message"),
            }
        }
        debug!(portal = %self.key, since, bridged, "Backfilled history");
        Ok(bridged)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Remove bridge accounts, and unless `puppets_only` real users, from the room.
    pub async fn cleanup(&self, puppets_only: bool) -> Result<()> {
        let ctx = self.ctx()?;
        let Some(room) = self.mxid().await else {
            return Ok(());
        };

        if self.is_private_chat() {
            let main = self.main_intent().await?;
            if let Err(err) = ctx.home.leave(&main, &room).await {
                warn!(portal = %self.key, error = %err, "Failed to leave private chat");
            }
            return Ok(());
        }

        for member in ctx.home.joined_members(&room).await? {
            if member == *ctx.bot_mxid() {
                continue;
            }
            if ctx.ids.is_puppet(&member) {
                if let Err(err) = ctx.home.leave(&Intent::Ghost(member.clone()), &room).await {
                    debug!(
                        portal = %self.key,
                        puppet = %member,
                        error = %err,
                        "Failed to leave as puppet"
                    );
                }
            } else if !puppets_only {
                let kicked = ctx.home.kick(&Intent::Bot, &room, &member, "Deleting portal").await;
                if let Err(err) = kicked {
                    debug!(portal = %self.key, user = %member, error = %err, "Failed to kick user");
                }
            }
        }
        if let Err(err) = ctx.home.leave(&Intent::Bot, &room).await {
            warn!(portal = %self.key, error = %err, "Failed to leave portal room");
        }
        Ok(())
    }

    /// Tear the portal down when no real user is left in its room.
    pub async fn cleanup_if_empty(self: &Arc<Self>) -> Result<bool> {
        let ctx = self.ctx()?;
        let Some(room) = self.mxid().await else {
            return Ok(false);
        };
        let members = ctx.home.joined_members(&room).await?;
        if members.iter().any(|m| !ctx.is_bridge_account(m)) {
            return Ok(false);
        }
        info!(portal = %self.key, "Cleaning up empty portal");
        self.delete().await?;
        self.cleanup(false).await?;
        Ok(true)
    }

    /// Forget the portal in the store and in the registry.
    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        let ctx = self.ctx()?;
        let mxid = self.mxid().await;
        ctx.store.lock().await.delete_portal(&self.key)?;
        ctx.registry.unregister_portal(&self.key, mxid.as_ref()).await;
        info!(portal = %self.key, "Deleted portal");
        Ok(())
    }
}

fn role_level(role: GroupRole) -> i64 {
    match role {
        GroupRole::SuperAdmin => POWER_LEVEL_SUPERADMIN,
        GroupRole::Admin => POWER_LEVEL_ADMIN,
        GroupRole::Member => 0,
    }
}
