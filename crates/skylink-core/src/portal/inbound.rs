//! Remote to home: deduplication and per-kind handling of inbound messages.

use std::sync::Arc;

use skylink_shared::constants::OUT_OF_ORDER_TOLERANCE_SECS;
use skylink_shared::{MediaKind, RemoteMessageKind, RoomId};
use skylink_store::MessageRecord;
use tracing::{debug, warn};

use super::Portal;
use crate::context::BridgeContext;
use crate::converter::codec::{self, Token};
use crate::converter::{plain_body, HomeMarkup, QuoteTarget, RoomContext};
use crate::error::{BridgeError, Result};
use crate::home::{HomeMessage, Intent, Relation};
use crate::remote::RemoteMessage;
use crate::user::User;

pub(crate) const MEDIA_FAILURE_NOTICE: &str = "⚠ Failed to bridge media";

/// Id a message is deduplicated by. Edits get their own id so they do not
/// collide with the message they edit.
pub(crate) fn dedup_key(message: &RemoteMessage) -> String {
    let base = if message.client_message_id.is_empty() {
        message.id.as_str()
    } else {
        message.client_message_id.as_str()
    };
    match message.edited_id.as_deref() {
        Some(edited) if !edited.is_empty() => format!("{edited}{}", message.id),
        _ => base.to_string(),
    }
}

impl Portal {
    /// Bridge one remote message. Called with the room lock held.
    pub(crate) async fn handle_remote_message(
        &self,
        source: &Arc<User>,
        message: RemoteMessage,
    ) -> Result<()> {
        let kind = match message.kind()? {
            RemoteMessageKind::Revoke => return self.handle_revoke(source, &message).await,
            kind => kind,
        };

        let dedup_id = dedup_key(&message);
        let Some(intent) = self.start_handling(source, &message, &dedup_id).await? else {
            debug!(portal = %self.key, message = %dedup_id, "Dropping message without a sender");
            return Ok(());
        };

        let ctx = self.ctx()?;
        let room = self.require_room().await?;
        let content = match kind {
            RemoteMessageKind::Text => self.text_content(&ctx, &message, &room).await?,
            RemoteMessageKind::Media(media) => {
                self.media_content(&ctx, source, &message, media).await?
            }
            RemoteMessageKind::Contact => HomeMessage::text(contact_body(&message.content)),
            RemoteMessageKind::Location => location_content(&message.content),
            RemoteMessageKind::Revoke => unreachable!("revokes return before conversion"),
        };

        let event = self
            .send_with_refresh(&intent, &room, &content, Some(message.timestamp * 1000))
            .await?;

        let sender = if message.sender.is_empty() && message.from_me {
            source.jid().await.unwrap_or_default()
        } else {
            message.sender.clone()
        };
        self.mark_handled(MessageRecord {
            chat: self.key.clone(),
            jid: dedup_id,
            id: message.id,
            mxid: event,
            sender,
            timestamp: message.timestamp,
            content: message.content,
        })
        .await
    }

    /// Ordering and duplicate checks, then sender resolution.
    ///
    /// `Ok(None)` means the message has nobody to send it as.
    async fn start_handling(
        &self,
        source: &Arc<User>,
        message: &RemoteMessage,
        dedup_id: &str,
    ) -> Result<Option<Intent>> {
        let ctx = self.ctx()?;
        {
            let handled = self.handled.lock().await;
            if handled.last_message_ts > message.timestamp + OUT_OF_ORDER_TOLERANCE_SECS {
                debug!(
                    portal = %self.key,
                    message = %dedup_id,
                    ts = message.timestamp,
                    last = handled.last_message_ts,
                    "Skipping out-of-order message"
                );
                return Err(BridgeError::DuplicateMessage);
            }
            if handled.recent.contains(dedup_id) {
                return Err(BridgeError::DuplicateMessage);
            }
        }

        {
            let db = ctx.store.lock().await;
            if let Some(existing) = db.find_message(&self.key, dedup_id)? {
                if existing.id.is_empty() && !message.id.is_empty() {
                    db.backfill_message_id(&self.key, dedup_id, &message.id)?;
                    debug!(
                        portal = %self.key,
                        message = %dedup_id,
                        id = %message.id,
                        "Backfilled canonical message id"
                    );
                }
                return Err(BridgeError::DuplicateMessage);
            }
        }

        {
            let mut handled = self.handled.lock().await;
            handled.last_message_ts = handled.last_message_ts.max(message.timestamp);
        }

        if message.from_me {
            let own = source.jid().await.ok_or(BridgeError::NotLoggedIn)?;
            let puppet = ctx.registry.puppet(&own).await?;
            let intent = puppet.intent_for(&self.key).await;
            if self.is_private_chat() && !intent.is_custom() {
                if let Some(room) = self.mxid().await {
                    let main = self.main_intent().await?;
                    if let Err(err) = ctx.home.invite(&main, &room, puppet.mxid()).await {
                        debug!(portal = %self.key, error = %err, "Failed to invite own puppet");
                    }
                }
            }
            return Ok(Some(intent));
        }

        if self.is_private_chat() {
            return Ok(Some(self.main_intent().await?));
        }
        if message.sender.is_empty() {
            return Ok(None);
        }
        let puppet = ctx.registry.puppet(&message.sender).await?;
        Ok(Some(puppet.intent_for(&self.key).await))
    }

    async fn text_content(
        &self,
        ctx: &BridgeContext,
        message: &RemoteMessage,
        room: &RoomId,
    ) -> Result<HomeMessage> {
        let room_ctx = RoomContext::new(self.key.clone(), Some(room.clone()));
        let markup = ctx.converter.to_home(&message.content, &room_ctx);
        let target = self.quote_target(ctx, &markup, room).await?;
        let mut content = markup.into_message(target);

        if let Some(original) = message.edited_id.as_deref().filter(|id| !id.is_empty()) {
            match self.find_message(ctx, original).await? {
                Some(row) => content = content.with_relation(Relation::Replace(row.mxid)),
                None => debug!(
                    portal = %self.key,
                    original,
                    "Edit target unknown, bridging as new message"
                ),
            }
        }
        Ok(content)
    }

    /// Quotes of messages bridged into this room become replies.
    async fn quote_target(
        &self,
        ctx: &BridgeContext,
        markup: &HomeMarkup,
        room: &RoomId,
    ) -> Result<QuoteTarget> {
        let Some(quote) = markup.quote.as_ref().filter(|q| q.in_conversation) else {
            return Ok(QuoteTarget::Detached);
        };
        match self.find_message(ctx, &quote.message_id).await? {
            Some(row) => Ok(QuoteTarget::Reply {
                room: room.clone(),
                event: row.mxid,
                sender: ctx.ids.puppet_mxid(&row.sender),
            }),
            None => Ok(QuoteTarget::Detached),
        }
    }

    async fn media_content(
        &self,
        ctx: &BridgeContext,
        source: &Arc<User>,
        message: &RemoteMessage,
        kind: MediaKind,
    ) -> Result<HomeMessage> {
        let media = message.media.as_ref().ok_or_else(|| {
            BridgeError::UnknownContentType(format!("{} without attachment", message.message_type))
        })?;
        let client = source.require_client().await?;

        match client.download_media(media).await {
            Ok(data) => {
                let size = data.len() as u64;
                let url = ctx.home.upload(data, &media.mimetype).await?;
                Ok(HomeMessage::media(
                    kind,
                    media.file_name.clone(),
                    url,
                    media.mimetype.clone(),
                    size,
                ))
            }
            Err(err) => {
                let err = BridgeError::DownloadFailure(err.to_string());
                warn!(
                    portal = %self.key,
                    message = %message.client_message_id,
                    error = %err,
                    "Failed to bridge media"
                );
                Ok(HomeMessage::notice(MEDIA_FAILURE_NOTICE))
            }
        }
    }

    /// Redact exactly the event bridged for the revoked message, then forget the row.
    async fn handle_revoke(&self, source: &Arc<User>, message: &RemoteMessage) -> Result<()> {
        let ctx = self.ctx()?;
        let target = message.revoked_id().unwrap_or_default();
        let Some(row) = self.find_message(&ctx, target).await? else {
            debug!(portal = %self.key, target, "Revoked message is unknown");
            return Ok(());
        };
        let room = self.require_room().await?;

        let intent = if message.from_me {
            let own = source.jid().await.ok_or(BridgeError::NotLoggedIn)?;
            let puppet = ctx.registry.puppet(&own).await?;
            if self.is_private_chat() {
                puppet.custom_intent().await
            } else {
                Some(puppet.intent_for(&self.key).await)
            }
        } else if !message.sender.is_empty() {
            let puppet = ctx.registry.puppet(&message.sender).await?;
            Some(puppet.intent_for(&self.key).await)
        } else {
            None
        };
        let intent = match intent {
            Some(intent) => intent,
            None => self.main_intent().await?,
        };

        match ctx.home.redact(&intent, &room, &row.mxid).await {
            Ok(()) => {}
            Err(BridgeError::Forbidden(reason)) => {
                debug!(
                    portal = %self.key,
                    reason,
                    "Redacting as sender forbidden, retrying as main intent"
                );
                let main = self.main_intent().await?;
                ctx.home.redact(&main, &room, &row.mxid).await?;
            }
            Err(err) => return Err(err),
        }

        ctx.store.lock().await.delete_message(&self.key, &row.jid)?;
        debug!(portal = %self.key, target, event = %row.mxid, "Redacted revoked message");
        Ok(())
    }

    /// Look a message up by client id, falling back to its canonical id.
    async fn find_message(&self, ctx: &BridgeContext, id: &str) -> Result<Option<MessageRecord>> {
        let db = ctx.store.lock().await;
        if let Some(row) = db.find_message(&self.key, id)? {
            return Ok(Some(row));
        }
        Ok(db.find_message_by_remote_id(&self.key, id)?)
    }
}

/// `<contacts><c t="s" s="8:live:carol" f="Carol"/></contacts>`
fn contact_body(content: &str) -> String {
    let shared: Vec<String> = codec::tokenize(content)
        .into_iter()
        .filter_map(|token| match token {
            Token::Open { name, attrs, .. } if name == "c" => {
                let id = Token::attr(&attrs, "s").unwrap_or_default();
                match Token::attr(&attrs, "f").filter(|f| !f.is_empty()) {
                    Some(name) => Some(format!("{name} ({id})")),
                    None => Some(id.to_string()),
                }
            }
            _ => None,
        })
        .collect();

    if shared.is_empty() {
        plain_body(content)
    } else {
        format!("Shared contact: {}", shared.join(", "))
    }
}

/// Coordinates arrive in microdegrees.
fn location_content(content: &str) -> HomeMessage {
    let location = codec::tokenize(content).into_iter().find_map(|token| match token {
        Token::Open { name, attrs, .. } if name == "location" => Some(attrs),
        _ => None,
    });
    let Some(attrs) = location else {
        return HomeMessage::text(plain_body(content));
    };

    let coordinate = |key: &str| {
        Token::attr(&attrs, key)
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(|micro| micro as f64 / 1_000_000.0)
    };
    match (coordinate("latitude"), coordinate("longitude")) {
        (Some(lat), Some(lon)) => {
            let body = Token::attr(&attrs, "address")
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Location: {lat:.6}, {lon:.6}"));
            HomeMessage::location(body, format!("geo:{lat:.6},{lon:.6}"))
        }
        _ => HomeMessage::text(plain_body(content)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use skylink_shared::{PortalKey, RemoteId};

    use super::*;
    use crate::home::MsgType;
    use crate::portal::PortalMessage;
    use crate::remote::RemoteMedia;
    use crate::testing::{now, text_message, Harness, BOB_JID, GROUP};

    #[test]
    fn edits_get_their_own_dedup_key() {
        let mut message = text_message("123", "m1", GROUP, BOB_JID, 10, "hi");
        assert_eq!(dedup_key(&message), "123");
        message.client_message_id.clear();
        assert_eq!(dedup_key(&message), "m1");
        message.edited_id = Some("123".into());
        message.id = "m2".into();
        assert_eq!(dedup_key(&message), "123m2");
    }

    #[test]
    fn contacts_and_locations() {
        let contacts = r#"<contacts><c t="s" s="8:live:carol" f="Carol"/><c t="s" s="8:dan"/></contacts>"#;
        assert_eq!(contact_body(contacts), "Shared contact: Carol (8:live:carol), 8:dan");
        let location = location_content(
            r#"<location isUserLocation="0" latitude="52520008" longitude="13404954" address="Berlin"><a href="https://maps">Berlin</a></location>"#,
        );
        assert_eq!(location.msgtype, MsgType::Location);
        assert_eq!(location.body, "Berlin");
        assert_eq!(location.geo_uri.as_deref(), Some("geo:52.520008,13.404954"));
        assert_eq!(location_content("somewhere").msgtype, MsgType::Text);
    }

    #[tokio::test]
    async fn redelivery_produces_one_event_and_one_row() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        let ts = now();

        for _ in 0..3 {
            let message = text_message("123", "m1", GROUP, BOB_JID, ts, "hello");
            assert!(portal.enqueue(PortalMessage { source: user.clone(), message }).await);
        }
        let last = text_message("124", "m2", GROUP, BOB_JID, ts, "after");
        portal.enqueue(PortalMessage { source: user.clone(), message: last }).await;
        harness.wait_for_messages(&room, 2).await;

        let bodies: Vec<String> =
            harness.home.messages_in(&room).into_iter().map(|m| m.message.body).collect();
        assert_eq!(bodies, vec!["hello", "after"]);
        let db = harness.ctx().store.lock().await;
        assert_eq!(db.count_messages_in_chat(portal.key()).unwrap(), 2);
        let row = db.find_message(portal.key(), "123").unwrap().unwrap();
        assert_eq!(row.id, "m1");
    }

    #[tokio::test]
    async fn echo_backfills_canonical_id_without_new_event() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();

        harness
            .ctx()
            .store
            .lock()
            .await
            .insert_message(&MessageRecord {
                chat: portal.key().clone(),
                jid: "555".into(),
                id: String::new(),
                mxid: "$sent".into(),
                sender: RemoteId::from(crate::testing::ALICE_JID),
                timestamp: now(),
                content: "from home".into(),
            })
            .unwrap();

        let mut echo =
            text_message("555", "m9", GROUP, crate::testing::ALICE_JID, now(), "from home");
        echo.from_me = true;
        portal.process(PortalMessage { source: user.clone(), message: echo }).await;

        assert!(harness.home.messages_in(&room).is_empty());
        let row = harness
            .ctx()
            .store
            .lock()
            .await
            .find_message(portal.key(), "555")
            .unwrap()
            .unwrap();
        assert_eq!(row.id, "m9");
    }

    #[tokio::test]
    async fn slow_media_does_not_reorder_messages() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        harness.remote.set_download_delay(Duration::from_millis(200));

        let mut media = text_message("1", "", GROUP, BOB_JID, now(), "");
        media.message_type = "RichText/UriObject".into();
        media.media = Some(RemoteMedia {
            url: "https://remote/pic".into(),
            file_name: "pic.jpg".into(),
            mimetype: "image/jpeg".into(),
        });
        let text = text_message("2", "", GROUP, BOB_JID, now(), "second");

        portal.enqueue(PortalMessage { source: user.clone(), message: media }).await;
        portal.enqueue(PortalMessage { source: user.clone(), message: text }).await;
        harness.wait_for_messages(&room, 2).await;

        let sent = harness.home.messages_in(&room);
        assert_eq!(sent[0].message.msgtype, MsgType::Media(MediaKind::Image));
        assert_eq!(sent[0].message.body, "pic.jpg");
        assert_eq!(sent[1].message.body, "second");
    }

    #[tokio::test]
    async fn failed_download_posts_notice_and_counts_as_handled() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        harness.remote.fail_downloads();

        let mut media = text_message("7", "", GROUP, BOB_JID, now(), "");
        media.message_type = "RichText/Media_GenericFile".into();
        media.media = Some(RemoteMedia {
            url: "https://remote/doc".into(),
            file_name: "doc.pdf".into(),
            mimetype: "application/pdf".into(),
        });
        portal.process(PortalMessage { source: user.clone(), message: media.clone() }).await;
        portal.process(PortalMessage { source: user.clone(), message: media }).await;

        let sent = harness.home.messages_in(&room);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.msgtype, MsgType::Notice);
        assert_eq!(sent[0].message.body, MEDIA_FAILURE_NOTICE);
        assert_eq!(sent[0].intent, Intent::Ghost("@skype&8-bob:example.org".into()));
    }

    #[tokio::test]
    async fn stale_message_creates_nothing() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let key = PortalKey::new(GROUP, "");
        let portal = harness.ctx().registry.portal(&key).await.unwrap();

        let stale = text_message("1", "m1", GROUP, BOB_JID, now() - 600, "old news");
        portal.process(PortalMessage { source: user.clone(), message: stale }).await;

        assert_eq!(harness.home.rooms_created(), 0);
        assert!(portal.mxid().await.is_none());
        assert_eq!(harness.ctx().store.lock().await.count_messages_in_chat(&key).unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_create_one_room() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let key = PortalKey::new(GROUP, "");
        let portal = harness.ctx().registry.portal(&key).await.unwrap();
        let ts = now();

        join_all((0..50).map(|i| {
            let message = text_message(&format!("c{i}"), "", GROUP, BOB_JID, ts, "race");
            portal.process(PortalMessage { source: user.clone(), message })
        }))
        .await;

        assert_eq!(harness.home.rooms_created(), 1);
        let room = portal.mxid().await.unwrap();
        assert_eq!(harness.home.messages_in(&room).len(), 50);
        assert_eq!(harness.ctx().store.lock().await.count_messages_in_chat(&key).unwrap(), 50);
    }

    #[tokio::test]
    async fn revoke_redacts_only_its_target() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        let ts = now();

        for (cmid, body) in [("a1", "first"), ("a2", "second")] {
            let message = text_message(cmid, "", GROUP, BOB_JID, ts, body);
            portal.process(PortalMessage { source: user.clone(), message }).await;
        }
        let sent = harness.home.messages_in(&room);
        let (first, second) = (sent[0].event.clone(), sent[1].event.clone());

        let mut revoke = text_message("", "", GROUP, BOB_JID, ts, "");
        revoke.edited_id = Some("a1".into());
        portal.process(PortalMessage { source: user.clone(), message: revoke }).await;

        let redactions = harness.home.redactions();
        assert_eq!(redactions.len(), 1);
        assert_eq!(redactions[0].2, first);
        assert_ne!(redactions[0].2, second);

        let db = harness.ctx().store.lock().await;
        assert!(db.find_message(portal.key(), "a1").unwrap().is_none());
        assert!(db.find_message(portal.key(), "a2").unwrap().is_some());
    }

    #[tokio::test]
    async fn forbidden_redaction_falls_back_to_main_intent() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let ts = now();

        let message = text_message("b1", "", GROUP, BOB_JID, ts, "oops");
        portal.process(PortalMessage { source: user.clone(), message }).await;
        harness.home.forbid_redactions_by("@skype&8-bob:example.org");

        let mut revoke = text_message("", "", GROUP, BOB_JID, ts, "");
        revoke.edited_id = Some("b1".into());
        portal.process(PortalMessage { source: user.clone(), message: revoke }).await;

        let redactions = harness.home.redactions();
        assert_eq!(redactions.len(), 1);
        assert_eq!(redactions[0].0, Intent::Bot);
    }

    #[tokio::test]
    async fn out_of_order_and_unknown_messages_are_skipped() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        let ts = now();

        let mut unknown = text_message("u1", "", GROUP, BOB_JID, ts, "ring");
        unknown.message_type = "Event/Call".into();
        let newer = text_message("n1", "", GROUP, BOB_JID, ts, "newer");
        let older = text_message("o1", "", GROUP, BOB_JID, ts - 5, "older");
        for message in [unknown, newer, older] {
            portal.enqueue(PortalMessage { source: user.clone(), message }).await;
        }
        let marker = text_message("z1", "", GROUP, BOB_JID, ts, "marker");
        portal.enqueue(PortalMessage { source: user.clone(), message: marker }).await;
        harness.wait_for_messages(&room, 2).await;

        let bodies: Vec<String> =
            harness.home.messages_in(&room).into_iter().map(|m| m.message.body).collect();
        assert_eq!(bodies, vec!["newer", "marker"]);
    }

    #[tokio::test]
    async fn quotes_and_edits_relate_to_earlier_events() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();
        let ts = now();

        let original = text_message("q1", "m1", GROUP, BOB_JID, ts, "question");
        portal.process(PortalMessage { source: user.clone(), message: original }).await;
        let original_event = harness.home.messages_in(&room)[0].event.clone();

        let reply = text_message(
            "q2",
            "m2",
            GROUP,
            BOB_JID,
            ts,
            &format!(
                r#"<quote author="8:bob" authorname="Bob" timestamp="{ts}" conversation="{GROUP}" messageid="m1">question</quote>answer"#
            ),
        );
        portal.process(PortalMessage { source: user.clone(), message: reply }).await;

        let mut edit = text_message("q1", "m3", GROUP, BOB_JID, ts, r#"question!<e_m ts="1"/>"#);
        edit.edited_id = Some("q1".into());
        portal.process(PortalMessage { source: user.clone(), message: edit }).await;

        let sent = harness.home.messages_in(&room);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].message.relates_to, Some(Relation::Reply(original_event.clone())));
        assert_eq!(sent[2].message.relates_to, Some(Relation::Replace(original_event)));
        assert_eq!(sent[2].message.body, "question!");
    }
}
