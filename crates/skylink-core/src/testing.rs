//! In-memory home and remote fakes that record every call, plus a harness
//! wiring them into a bridge.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use skylink_shared::{EventId, HomeUserId, PortalKey, RemoteId, RoomId};
use skylink_store::{Database, StoredSession};
use tokio::sync::mpsc;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::home::{CreateRoomRequest, HomeClient, HomeMessage, Intent};
use crate::portal::Portal;
use crate::remote::{
    EventSink, GroupInfo, LoginCredentials, OutboundMessage, RemoteClient, RemoteConnector,
    RemoteContact, RemoteConversation, RemoteEvent, RemoteMedia, RemoteMessage, RemoteSession,
};
use crate::user::User;

pub(crate) const ALICE: &str = "@alice:example.org";
pub(crate) const ALICE_JID: &str = "8:alice@s.skype.net";
pub(crate) const BOB_JID: &str = "8:bob@s.skype.net";
pub(crate) const GROUP: &str = "19:weekend@thread.skype";
pub(crate) const MGMT_ROOM: &str = "!management:example.org";

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn text_message(
    client_message_id: &str,
    id: &str,
    conversation: &str,
    sender: &str,
    timestamp: i64,
    content: &str,
) -> RemoteMessage {
    RemoteMessage {
        id: id.to_string(),
        client_message_id: client_message_id.to_string(),
        conversation: conversation.to_string(),
        sender: RemoteId::from(sender),
        from_me: false,
        timestamp,
        message_type: "RichText".to_string(),
        content: content.to_string(),
        edited_id: None,
        media: None,
    }
}

// ---------------------------------------------------------------------------
// Home
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub intent: Intent,
    pub room: RoomId,
    pub event: EventId,
    pub message: HomeMessage,
}

#[derive(Default)]
struct HomeState {
    next_id: u64,
    create_requests: Vec<CreateRoomRequest>,
    messages: Vec<SentMessage>,
    redactions: Vec<(Intent, RoomId, EventId)>,
    forbidden_redactors: Vec<HomeUserId>,
    kicks: Vec<(Intent, RoomId, HomeUserId, String)>,
    invites: Vec<(Intent, RoomId, HomeUserId)>,
    leaves: Vec<(Intent, RoomId)>,
    joined: HashMap<RoomId, Vec<HomeUserId>>,
    state: HashMap<(RoomId, String, String), Value>,
    state_events: Vec<(String, Value)>,
    display_names: Vec<(Intent, String)>,
    typing: Vec<(Intent, RoomId, bool, u64)>,
    logins: u64,
}

pub(crate) struct FakeHome {
    bot: HomeUserId,
    state: Mutex<HomeState>,
}

impl FakeHome {
    fn new(bot: HomeUserId) -> Self {
        Self {
            bot,
            state: Mutex::new(HomeState::default()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut HomeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn rooms_created(&self) -> usize {
        self.with(|s| s.create_requests.len())
    }

    pub fn last_create_request(&self) -> Option<CreateRoomRequest> {
        self.with(|s| s.create_requests.last().cloned())
    }

    pub fn messages_in(&self, room: &RoomId) -> Vec<SentMessage> {
        self.with(|s| s.messages.iter().filter(|m| &m.room == room).cloned().collect())
    }

    pub fn redactions(&self) -> Vec<(Intent, RoomId, EventId)> {
        self.with(|s| s.redactions.clone())
    }

    pub fn forbid_redactions_by(&self, user: &str) {
        self.with(|s| s.forbidden_redactors.push(HomeUserId::from(user)));
    }

    pub fn kicks(&self) -> Vec<(Intent, RoomId, HomeUserId, String)> {
        self.with(|s| s.kicks.clone())
    }

    pub fn leaves(&self) -> Vec<(Intent, RoomId)> {
        self.with(|s| s.leaves.clone())
    }

    pub fn joined(&self, room: &RoomId) -> Vec<HomeUserId> {
        self.with(|s| s.joined.get(room).cloned().unwrap_or_default())
    }

    pub fn set_joined(&self, room: &RoomId, members: Vec<HomeUserId>) {
        self.with(|s| s.joined.insert(room.clone(), members));
    }

    pub fn state_events(&self) -> Vec<(String, Value)> {
        self.with(|s| s.state_events.clone())
    }

    pub fn display_names(&self) -> Vec<(Intent, String)> {
        self.with(|s| s.display_names.clone())
    }

    pub fn typing(&self) -> Vec<(Intent, RoomId, bool, u64)> {
        self.with(|s| s.typing.clone())
    }
}

#[async_trait]
impl HomeClient for FakeHome {
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomId> {
        // Widens the window for concurrent creators.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let creator = request.creator.user_id(&self.bot);
        Ok(self.with(|s| {
            s.next_id += 1;
            let room = RoomId(format!("!room{}:example.org", s.next_id));
            s.joined.insert(room.clone(), vec![creator]);
            s.create_requests.push(request);
            room
        }))
    }

    async fn invite(&self, intent: &Intent, room: &RoomId, user: &HomeUserId) -> Result<()> {
        self.with(|s| s.invites.push((intent.clone(), room.clone(), user.clone())));
        Ok(())
    }

    async fn ensure_joined(&self, intent: &Intent, room: &RoomId) -> Result<()> {
        let user = intent.user_id(&self.bot);
        self.with(|s| {
            let members = s.joined.entry(room.clone()).or_default();
            if !members.contains(&user) {
                members.push(user);
            }
        });
        Ok(())
    }

    async fn kick(
        &self,
        intent: &Intent,
        room: &RoomId,
        user: &HomeUserId,
        reason: &str,
    ) -> Result<()> {
        self.with(|s| {
            if let Some(members) = s.joined.get_mut(room) {
                members.retain(|m| m != user);
            }
            s.kicks.push((intent.clone(), room.clone(), user.clone(), reason.to_string()));
        });
        Ok(())
    }

    async fn leave(&self, intent: &Intent, room: &RoomId) -> Result<()> {
        let user = intent.user_id(&self.bot);
        self.with(|s| {
            if let Some(members) = s.joined.get_mut(room) {
                members.retain(|m| m != &user);
            }
            s.leaves.push((intent.clone(), room.clone()));
        });
        Ok(())
    }

    async fn joined_members(&self, room: &RoomId) -> Result<Vec<HomeUserId>> {
        Ok(self.joined(room))
    }

    async fn get_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>> {
        let key = (room.clone(), event_type.to_string(), state_key.to_string());
        Ok(self.with(|s| s.state.get(&key).cloned()))
    }

    async fn set_state(
        &self,
        _intent: &Intent,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<EventId> {
        Ok(self.with(|s| {
            s.next_id += 1;
            s.state.insert(
                (room.clone(), event_type.to_string(), state_key.to_string()),
                content.clone(),
            );
            s.state_events.push((event_type.to_string(), content));
            EventId(format!("$state{}", s.next_id))
        }))
    }

    async fn send_message(
        &self,
        intent: &Intent,
        room: &RoomId,
        message: &HomeMessage,
        _timestamp_ms: Option<i64>,
    ) -> Result<EventId> {
        Ok(self.with(|s| {
            s.next_id += 1;
            let event = EventId(format!("$ev{}", s.next_id));
            s.messages.push(SentMessage {
                intent: intent.clone(),
                room: room.clone(),
                event: event.clone(),
                message: message.clone(),
            });
            event
        }))
    }

    async fn redact(&self, intent: &Intent, room: &RoomId, event: &EventId) -> Result<()> {
        let user = intent.user_id(&self.bot);
        self.with(|s| {
            if s.forbidden_redactors.contains(&user) {
                return Err(BridgeError::Forbidden(format!("{user} may not redact")));
            }
            s.redactions.push((intent.clone(), room.clone(), event.clone()));
            Ok(())
        })
    }

    async fn mark_read(&self, _intent: &Intent, _room: &RoomId, _event: &EventId) -> Result<()> {
        Ok(())
    }

    async fn set_typing(
        &self,
        intent: &Intent,
        room: &RoomId,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<()> {
        self.with(|s| s.typing.push((intent.clone(), room.clone(), typing, timeout_ms)));
        Ok(())
    }

    async fn set_presence(&self, _intent: &Intent, _online: bool) -> Result<()> {
        Ok(())
    }

    async fn set_display_name(&self, intent: &Intent, name: &str) -> Result<()> {
        self.with(|s| s.display_names.push((intent.clone(), name.to_string())));
        Ok(())
    }

    async fn set_avatar_url(&self, _intent: &Intent, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, _data: Bytes, _mimetype: &str) -> Result<String> {
        Ok(self.with(|s| {
            s.next_id += 1;
            format!("mxc://example.org/{}", s.next_id)
        }))
    }

    async fn download(&self, _url: &str) -> Result<Bytes> {
        Ok(Bytes::from_static(b"media"))
    }

    async fn login_as(&self, _user: &HomeUserId) -> Result<String> {
        Ok(self.with(|s| {
            s.logins += 1;
            format!("fresh-token-{}", s.logins)
        }))
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

struct RemoteState {
    sink: Option<EventSink>,
    refresh_tx: Option<mpsc::Sender<i32>>,
    session_token: String,
    contacts: Vec<RemoteContact>,
    conversations: Vec<RemoteConversation>,
    history: Vec<RemoteMessage>,
    group_info: Option<GroupInfo>,
    send_delay: Duration,
    download_delay: Duration,
    fail_downloads: bool,
    fail_sends: bool,
    fail_next_login: bool,
    message_exists: bool,
    expire_next_send: bool,
    sent: Vec<OutboundMessage>,
    deleted: Vec<(String, String)>,
    member_changes: Vec<(bool, RemoteId)>,
    logins: usize,
    logouts: usize,
    token_refreshes: usize,
}

pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                sink: None,
                refresh_tx: None,
                session_token: "token-1".to_string(),
                contacts: Vec::new(),
                conversations: Vec::new(),
                history: Vec::new(),
                group_info: None,
                send_delay: Duration::ZERO,
                download_delay: Duration::ZERO,
                fail_downloads: false,
                fail_sends: false,
                fail_next_login: false,
                message_exists: false,
                expire_next_send: false,
                sent: Vec::new(),
                deleted: Vec::new(),
                member_changes: Vec::new(),
                logins: 0,
                logouts: 0,
                token_refreshes: 0,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut RemoteState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn session(&self) -> RemoteSession {
        RemoteSession {
            own_id: RemoteId::from(ALICE_JID),
            session: StoredSession {
                skype_token: self.with(|s| s.session_token.clone()),
                ..StoredSession::default()
            },
        }
    }

    /// Deliver an event as if the network pushed it.
    pub fn push(&self, event: RemoteEvent) {
        let sink = self.with(|s| s.sink.clone());
        assert!(sink.expect("not subscribed").put(event), "event dropped");
    }

    pub fn refresh(&self, signal: i32) {
        let tx = self.with(|s| s.refresh_tx.clone()).expect("no refresh watcher");
        tx.try_send(signal).unwrap();
    }

    pub fn set_session_token(&self, token: &str) {
        self.with(|s| s.session_token = token.to_string());
    }

    pub fn set_conversations(&self, conversations: Vec<RemoteConversation>) {
        self.with(|s| s.conversations = conversations);
    }

    pub fn set_history(&self, history: Vec<RemoteMessage>) {
        self.with(|s| s.history = history);
    }

    pub fn set_group_info(&self, info: GroupInfo) {
        self.with(|s| s.group_info = Some(info));
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.with(|s| s.send_delay = delay);
    }

    pub fn set_download_delay(&self, delay: Duration) {
        self.with(|s| s.download_delay = delay);
    }

    pub fn fail_downloads(&self) {
        self.with(|s| s.fail_downloads = true);
    }

    pub fn fail_next_login(&self) {
        self.with(|s| s.fail_next_login = true);
    }

    pub fn fail_sends(&self) {
        self.with(|s| s.fail_sends = true);
    }

    pub fn set_message_exists(&self, exists: bool) {
        self.with(|s| s.message_exists = exists);
    }

    pub fn expire_next_send(&self) {
        self.with(|s| s.expire_next_send = true);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.with(|s| s.sent.clone())
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.with(|s| s.deleted.clone())
    }

    pub fn member_changes(&self) -> Vec<(bool, RemoteId)> {
        self.with(|s| s.member_changes.clone())
    }

    pub fn login_count(&self) -> usize {
        self.with(|s| s.logins)
    }

    pub fn logout_count(&self) -> usize {
        self.with(|s| s.logouts)
    }

    pub fn token_refreshes(&self) -> usize {
        self.with(|s| s.token_refreshes)
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn login(&self, _credentials: &LoginCredentials) -> Result<RemoteSession> {
        if self.with(|s| std::mem::take(&mut s.fail_next_login)) {
            return Err(BridgeError::Remote("invalid credentials".to_string()));
        }
        self.with(|s| s.logins += 1);
        Ok(self.session())
    }

    async fn restore(&self, _session: &StoredSession) -> Result<RemoteSession> {
        Ok(self.session())
    }

    async fn subscribe(&self, sink: EventSink) -> Result<()> {
        self.with(|s| s.sink = Some(sink));
        Ok(())
    }

    fn refresh_signals(&self) -> Option<mpsc::Receiver<i32>> {
        let (tx, rx) = mpsc::channel(1);
        self.with(|s| s.refresh_tx = Some(tx));
        Some(rx)
    }

    fn current_session(&self) -> Option<StoredSession> {
        Some(self.session().session)
    }

    async fn contacts(&self) -> Result<Vec<RemoteContact>> {
        Ok(self.with(|s| s.contacts.clone()))
    }

    async fn conversations(&self) -> Result<Vec<RemoteConversation>> {
        Ok(self.with(|s| s.conversations.clone()))
    }

    async fn group_info(&self, conversation: &str) -> Result<GroupInfo> {
        Ok(self.with(|s| {
            s.group_info.clone().unwrap_or_else(|| GroupInfo {
                jid: conversation.to_string(),
                name: "Group".to_string(),
                topic: String::new(),
                avatar_url: None,
                participants: Vec::new(),
            })
        }))
    }

    async fn history(
        &self,
        conversation: &str,
        since: i64,
        limit: Option<usize>,
    ) -> Result<Vec<RemoteMessage>> {
        let mut messages: Vec<RemoteMessage> = self.with(|s| {
            s.history
                .iter()
                .filter(|m| m.conversation == conversation && m.timestamp > since)
                .cloned()
                .collect()
        });
        messages.sort_by_key(|m| m.timestamp);
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        let (delay, expired, fail) =
            self.with(|s| (s.send_delay, std::mem::take(&mut s.expire_next_send), s.fail_sends));
        if expired {
            return Err(BridgeError::AuthExpired);
        }
        if fail {
            return Err(BridgeError::Remote("send rejected".to_string()));
        }
        tokio::time::sleep(delay).await;
        self.with(|s| s.sent.push(message.clone()));
        Ok(())
    }

    async fn message_exists(&self, _conversation: &str, _client_message_id: &str) -> Result<bool> {
        Ok(self.with(|s| s.message_exists))
    }

    async fn delete_message(&self, conversation: &str, message_id: &str) -> Result<()> {
        self.with(|s| s.deleted.push((conversation.to_string(), message_id.to_string())));
        Ok(())
    }

    async fn add_members(&self, _group: &str, members: &[RemoteId]) -> Result<()> {
        self.with(|s| s.member_changes.extend(members.iter().map(|m| (true, m.clone()))));
        Ok(())
    }

    async fn remove_members(&self, _group: &str, members: &[RemoteId]) -> Result<()> {
        self.with(|s| s.member_changes.extend(members.iter().map(|m| (false, m.clone()))));
        Ok(())
    }

    async fn leave_group(&self, _group: &str) -> Result<()> {
        Ok(())
    }

    async fn download_media(&self, _media: &RemoteMedia) -> Result<Bytes> {
        let (delay, fail) = self.with(|s| (s.download_delay, s.fail_downloads));
        tokio::time::sleep(delay).await;
        if fail {
            return Err(BridgeError::DownloadFailure("download failed".to_string()));
        }
        Ok(Bytes::from_static(b"remote media"))
    }

    async fn refresh_token(&self) -> Result<()> {
        self.with(|s| s.token_refreshes += 1);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.with(|s| s.logouts += 1);
        Ok(())
    }
}

struct FakeConnector {
    remote: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, _user: &HomeUserId) -> Result<Arc<dyn RemoteClient>> {
        Ok(self.remote.clone() as Arc<dyn RemoteClient>)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub bridge: Bridge,
    pub home: Arc<FakeHome>,
    pub remote: Arc<FakeRemote>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        let mut config = BridgeConfig {
            homeserver_domain: "example.org".to_string(),
            initial_chat_sync: 0,
            ..BridgeConfig::default()
        };
        configure(&mut config);

        let home = Arc::new(FakeHome::new(config.bot_mxid()));
        let remote = Arc::new(FakeRemote::new());
        let store = Database::open_in_memory().unwrap();
        let bridge = Bridge::new(
            config,
            store,
            home.clone(),
            Arc::new(FakeConnector { remote: remote.clone() }),
        );
        Self { bridge, home, remote }
    }

    pub fn ctx(&self) -> &Arc<BridgeContext> {
        self.bridge.context()
    }

    /// Log alice in and wait for the post-login sync to finish.
    pub async fn login(&self) -> Arc<User> {
        let user = self.bridge.user(&ALICE.into()).await.unwrap();
        user.set_management_room(MGMT_ROOM.into()).await.unwrap();
        self.bridge
            .login(
                &ALICE.into(),
                LoginCredentials {
                    username: "alice".to_string(),
                    password: "secret".to_string(),
                },
            )
            .await
            .unwrap();
        settle(&user).await;
        user
    }

    /// The shared group portal with its room created.
    pub async fn group_portal(&self, user: &Arc<User>) -> Arc<Portal> {
        settle(user).await;
        let portal = self.ctx().registry.portal(&PortalKey::new(GROUP, "")).await.unwrap();
        portal.create_room(user, None).await.unwrap();
        portal
    }

    pub async fn wait_for_messages(&self, room: &RoomId, count: usize) {
        self.eventually(|| self.home.messages_in(room).len() >= count).await;
    }

    pub async fn eventually(&self, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    pub async fn eventually_async<F, Fut>(&self, check: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}

/// Wait until nothing holds the user's sync lock.
pub(crate) async fn settle(user: &User) {
    drop(user.sync_lock.lock().await);
}
