//! Home to remote: messages, redactions and membership changes made by real
//! users in portal rooms.

use std::future::Future;
use std::sync::Arc;

use skylink_shared::{EventId, HomeUserId, RoomId};
use skylink_store::MessageRecord;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::context::BridgeContext;
use crate::converter::{plain_body, QuoteSource, RoomContext};
use crate::error::{BridgeError, Result};
use crate::home::{HomeMessageEvent, MsgType};
use super::Portal;
use crate::remote::{OutboundContent, OutboundMessage, RemoteClient};
use crate::user::User;

const NOT_BRIDGED_WARNING: &str = "⚠ Your message may not have been bridged";
const NOT_CONNECTED_NOTICE: &str =
    "⚠ You are not connected to Skype, your message was not bridged";

impl Portal {
    /// Send a real user's room message to the remote conversation.
    pub async fn handle_home_message(
        self: &Arc<Self>,
        sender: &Arc<User>,
        event: HomeMessageEvent,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let jid = sender.jid().await.ok_or(BridgeError::NotLoggedIn)?;
        if self.is_private_chat() && self.key.receiver != jid {
            debug!(
                portal = %self.key,
                user = %sender.mxid(),
                "Ignoring message from non-owner in private chat"
            );
            return Ok(());
        }
        if ctx.store.lock().await.find_message_by_mxid(&event.event_id)?.is_some() {
            return Ok(());
        }
        if !sender.is_connected().await {
            if let Err(err) = self.send_notice(&event.room, NOT_CONNECTED_NOTICE).await {
                warn!(portal = %self.key, error = %err, "Failed to send notice");
            }
            return Err(BridgeError::NotConnected);
        }

        let mut room_ctx = RoomContext::new(self.key.clone(), Some(event.room.clone()));
        if let Some(target) = event.content.reply_to() {
            room_ctx.reply = self.quote_source(&ctx, target).await?;
        }

        let content = match event.content.msgtype {
            MsgType::Media(kind) => {
                let url = event.content.url.as_deref().ok_or_else(|| {
                    BridgeError::UnknownContentType(format!("{} without url", kind.msgtype()))
                })?;
                OutboundContent::Media {
                    kind,
                    file_name: event.content.body.clone(),
                    mimetype: event
                        .content
                        .mimetype
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    data: ctx.home.download(url).await?,
                }
            }
            MsgType::Text | MsgType::Notice | MsgType::Emote | MsgType::Location => {
                OutboundContent::Text(ctx.converter.to_remote(&event.content, &room_ctx))
            }
        };

        let client_message_id = rand::random::<u64>().to_string();
        let stored_content = match &content {
            OutboundContent::Text(text) => text.clone(),
            OutboundContent::Media { file_name, .. } => file_name.clone(),
        };
        // Recorded before sending so the remote echo is recognised as a duplicate.
        ctx.store.lock().await.insert_message(&MessageRecord {
            chat: self.key.clone(),
            jid: client_message_id.clone(),
            id: String::new(),
            mxid: event.event_id.clone(),
            sender: jid,
            timestamp: chrono::Utc::now().timestamp(),
            content: stored_content,
        })?;

        let message = OutboundMessage {
            conversation: self.key.jid.to_string(),
            client_message_id: client_message_id.clone(),
            content,
        };
        let sent = self
            .dispatch(sender, &event.room, Some(&client_message_id), move |client| {
                send_with_retry(client, message)
            })
            .await;
        if let Err(err) = sent {
            ctx.store.lock().await.delete_message(&self.key, &client_message_id)?;
            return Err(err);
        }
        debug!(
            portal = %self.key,
            event = %event.event_id,
            message = %client_message_id,
            "Sent message to remote"
        );
        Ok(())
    }

    async fn quote_source(
        &self,
        ctx: &BridgeContext,
        target: &EventId,
    ) -> Result<Option<QuoteSource>> {
        let Some(row) = ctx.store.lock().await.find_message_by_mxid(target)? else {
            return Ok(None);
        };
        let author_name = ctx.registry.puppet(&row.sender).await?.displayname().await;
        Ok(Some(QuoteSource {
            author: row.sender,
            author_name,
            timestamp: row.timestamp,
            conversation: self.key.jid.to_string(),
            message_id: if row.id.is_empty() { row.jid } else { row.id },
            text: plain_body(&row.content),
        }))
    }

    /// Run a remote operation for `sender` under the send timeout.
    ///
    /// A timeout posts a warning and keeps waiting; the warning is redacted if
    /// the operation still succeeds. Failures are reported in the room.
    async fn dispatch<F, Fut>(
        &self,
        sender: &User,
        room: &RoomId,
        sent_id: Option<&str>,
        op: F,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn RemoteClient>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = self.ctx()?;
        let client = sender.require_client().await?;
        let cancel = sender.child_token().await.ok_or(BridgeError::NotConnected)?;

        let (tx, mut rx) = oneshot::channel();
        let operation = op(client.clone());
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BridgeError::NotConnected),
                result = operation => result,
            };
            let _ = tx.send(result);
        });

        let result = match tokio::time::timeout(ctx.config.connection_timeout(), &mut rx).await {
            Ok(result) => flatten(result),
            Err(_) => {
                if let (true, Some(id)) = (ctx.config.fetch_message_on_timeout, sent_id) {
                    match client.message_exists(self.key.jid.as_str(), id).await {
                        Ok(true) => {
                            debug!(
                                portal = %self.key,
                                message = id,
                                "Message arrived despite timeout"
                            );
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(err) => {
                            debug!(portal = %self.key, error = %err, "Failed to check for message")
                        }
                    }
                }

                let text = format!("{NOT_BRIDGED_WARNING}: {}", BridgeError::SendTimeout);
                let warning = match self.send_notice(room, &text).await {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!(portal = %self.key, error = %err, "Failed to post timeout warning");
                        None
                    }
                };
                let result = flatten(rx.await);
                if let (Ok(()), Some(warning)) = (&result, warning) {
                    info!(portal = %self.key, "Message arrived after timeout warning");
                    let intent = self.main_intent().await?;
                    if let Err(err) = ctx.home.redact(&intent, room, &warning).await {
                        warn!(portal = %self.key, error = %err, "Failed to redact timeout warning");
                    }
                }
                result
            }
        };

        if let Err(err) = &result {
            warn!(portal = %self.key, error = %err, "Failed to bridge to remote");
            let text = format!("{NOT_BRIDGED_WARNING}: {err}");
            if let Err(notice_err) = self.send_notice(room, &text).await {
                warn!(portal = %self.key, error = %notice_err, "Failed to post failure notice");
            }
        }
        result
    }

    /// Only the user who sent a message can delete it remotely.
    pub async fn handle_home_redaction(
        self: &Arc<Self>,
        sender: &Arc<User>,
        room: &RoomId,
        redacts: &EventId,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let Some(row) = ctx.store.lock().await.find_message_by_mxid(redacts)? else {
            return Ok(());
        };
        if sender.jid().await.as_ref() != Some(&row.sender) {
            debug!(
                portal = %self.key,
                event = %redacts,
                "Ignoring redaction of someone else's message"
            );
            return Ok(());
        }

        let conversation = self.key.jid.to_string();
        let message_id = if row.id.is_empty() { row.jid.clone() } else { row.id.clone() };
        self.dispatch(sender, room, None, move |client| async move {
            client.delete_message(&conversation, &message_id).await
        })
        .await?;
        ctx.store.lock().await.delete_message(&self.key, &row.jid)?;
        Ok(())
    }

    /// A real user left the room.
    pub async fn handle_home_leave(self: &Arc<Self>, user: &Arc<User>) -> Result<()> {
        if self.is_private_chat() {
            if user.jid().await.as_ref() != Some(&self.key.receiver) {
                return Ok(());
            }
            info!(portal = %self.key, user = %user.mxid(), "Private chat left, deleting portal");
            self.delete().await?;
            return self.cleanup(false).await;
        }

        match user.client().await {
            Some(client) => {
                if let Err(err) = client.leave_group(self.key.jid.as_str()).await {
                    warn!(
                        portal = %self.key,
                        user = %user.mxid(),
                        error = %err,
                        "Failed to leave remote group"
                    );
                }
            }
            None => debug!(
                portal = %self.key,
                user = %user.mxid(),
                "Not connected, not leaving remote group"
            ),
        }
        self.cleanup_if_empty().await?;
        Ok(())
    }

    pub async fn handle_home_kick(&self, sender: &Arc<User>, target: &HomeUserId) -> Result<()> {
        let ctx = self.ctx()?;
        if self.is_private_chat() {
            return Ok(());
        }
        let Some(member) = ctx.ids.parse_puppet_mxid(target) else {
            return Ok(());
        };
        let client = sender.require_client().await?;
        client.remove_members(self.key.jid.as_str(), &[member]).await
    }

    pub async fn handle_home_invite(&self, sender: &Arc<User>, target: &HomeUserId) -> Result<()> {
        let ctx = self.ctx()?;
        if self.is_private_chat() {
            return Ok(());
        }
        let Some(member) = ctx.ids.parse_puppet_mxid(target) else {
            return Ok(());
        };
        let client = sender.require_client().await?;
        client.add_members(self.key.jid.as_str(), &[member]).await
    }
}

async fn send_with_retry(client: Arc<dyn RemoteClient>, message: OutboundMessage) -> Result<()> {
    match client.send_message(&message).await {
        Err(BridgeError::AuthExpired) => {
            debug!(
                message = %message.client_message_id,
                "Remote token expired, refreshing before resend"
            );
            client.refresh_token().await?;
            client.send_message(&message).await
        }
        other => other,
    }
}

fn flatten(result: std::result::Result<Result<()>, oneshot::error::RecvError>) -> Result<()> {
    result.unwrap_or_else(|_| {
        Err(BridgeError::Remote("send task ended without a result".to_string()))
    })
}
