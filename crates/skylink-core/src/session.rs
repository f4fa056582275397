//! Session lifecycle: login, restore, refresh monitoring, relogin and
//! teardown of a user's remote connection.

use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use skylink_store::StoredCredentials;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{BridgeError, Result};
use crate::remote::{EventSink, LoginCredentials, RemoteClient, RemoteSession};
use crate::user::{Connection, SessionState, User};

const NO_CREDENTIALS: &str = "no stored credentials, please log in again";

impl User {
    /// Log in with credentials, replacing any existing connection.
    pub async fn login(self: &Arc<Self>, credentials: LoginCredentials) -> Result<()> {
        let ctx = self.ctx()?;
        let previous = self.state();
        self.set_state(SessionState::Connecting);
        let result = async {
            let client = ctx.remote.connect(self.mxid()).await?;
            let session = client.login(&credentials).await?;
            self.establish(client, session, Some(credentials)).await
        }
        .await;
        if result.is_err() {
            match self.client().await {
                Some(_) => self.set_state(previous),
                None => self.set_state(SessionState::LoggedOut),
            }
        }
        result
    }

    /// Resume the stored session, falling back to stored credentials when it
    /// has expired.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let ctx = self.ctx()?;
        let record = self.record().await;
        self.set_state(SessionState::Connecting);

        let client = ctx.remote.connect(self.mxid()).await?;
        let restored = match &record.session {
            Some(session) => client.restore(session).await,
            None => Err(BridgeError::AuthExpired),
        };
        match restored {
            Ok(session) => self.establish(client, session, None).await,
            Err(err) if err.is_auth_expired() => {
                let Some(stored) = record.credentials else {
                    return Err(err);
                };
                info!(user = %self.mxid(), "Stored session expired, logging in again");
                let credentials = LoginCredentials {
                    username: stored.username,
                    password: stored.password,
                };
                let session = client.login(&credentials).await?;
                self.establish(client, session, Some(credentials)).await
            }
            Err(err) => Err(err),
        }
    }

    /// Restore the session, telling the user when that fails.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.restore().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(user = %self.mxid(), error = %err, "Failed to connect");
                self.set_state(SessionState::LoggedOut);
                self.notify(&format!("Failed to connect to Skype: {err}")).await;
                Err(err)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        client: Arc<dyn RemoteClient>,
        session: RemoteSession,
        credentials: Option<LoginCredentials>,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let (tx, rx) = mpsc::channel(ctx.config.user_event_queue);
        client.subscribe(EventSink::new(self.mxid().clone(), tx)).await?;

        let (previous_jid, previous_connection) = {
            let mut record = self.record.lock().await;
            let previous = record.jid.replace(session.own_id.clone());
            record.session = Some(session.session.clone());
            if let Some(credentials) = &credentials {
                record.credentials = Some(StoredCredentials {
                    username: credentials.username.clone(),
                    password: credentials.password.clone(),
                });
            }
            let previous_connection =
                std::mem::replace(&mut record.last_connection, chrono::Utc::now().timestamp());
            ctx.store.lock().await.update_user(&record)?;
            (previous, previous_connection)
        };
        if let Some(previous) = previous_jid.filter(|p| p != &session.own_id) {
            ctx.registry.unregister_user_jid(&previous).await;
        }
        ctx.registry.register_user_jid(session.own_id.clone(), self).await;

        let cancel = CancellationToken::new();
        let signals = client.refresh_signals();
        {
            let mut connection = self.connection.lock().await;
            if let Some(old) = connection.replace(Connection {
                client,
                cancel: cancel.clone(),
            }) {
                old.cancel.cancel();
            }
        }

        let span = info_span!("user", mxid = %self.mxid());
        tokio::spawn(self.clone().run_events(rx, cancel.clone()).instrument(span.clone()));
        if let Some(signals) = signals {
            let monitor = monitor_session(Arc::downgrade(self), signals, cancel);
            tokio::spawn(monitor.instrument(span.clone()));
        }

        self.set_state(SessionState::Connected);
        info!(user = %self.mxid(), jid = %session.own_id, "Connected to remote network");

        // Inbound routing waits until the post-login sync releases this.
        let sync_guard = self.sync_lock.clone().lock_owned().await;
        tokio::spawn(self.clone().post_login(sync_guard, previous_connection).instrument(span));
        Ok(())
    }

    async fn persist_session(&self) -> Result<()> {
        let Some(client) = self.client().await else {
            return Ok(());
        };
        let ctx = self.ctx()?;
        let mut record = self.record.lock().await;
        if let Some(session) = client.current_session() {
            record.session = Some(session);
        }
        record.last_connection = chrono::Utc::now().timestamp();
        ctx.store.lock().await.update_user(&record)?;
        Ok(())
    }

    /// Boxed because relogin spawns a new session monitor, which in turn
    /// awaits this.
    fn handle_session_expired(self: &Arc<Self>) -> BoxFuture<'_, ()> {
        async move { self.relogin_or_teardown().await }.boxed()
    }

    async fn relogin_or_teardown(self: &Arc<Self>) {
        warn!(user = %self.mxid(), "Remote session expired");
        self.set_state(SessionState::Expired);

        let stored = self.record.lock().await.credentials.clone();
        let failure = match stored {
            Some(stored) => {
                let credentials = LoginCredentials {
                    username: stored.username,
                    password: stored.password,
                };
                match self.login(credentials).await {
                    Ok(()) => {
                        info!(user = %self.mxid(), "Logged in again after session expiry");
                        return;
                    }
                    Err(err) => err.to_string(),
                }
            }
            None => NO_CREDENTIALS.to_string(),
        };

        self.notify(&format!("Session expired and relogin failed: {failure}")).await;
        if let Err(err) = self.teardown().await {
            warn!(user = %self.mxid(), error = %err, "Failed to tear down expired session");
        }
    }

    /// Kick the user from every portal they are in, then drop the connection
    /// and the stored session.
    pub(crate) async fn teardown(&self) -> Result<()> {
        let ctx = self.ctx()?;
        if let Some(jid) = self.jid().await {
            let keys = ctx.store.lock().await.user_portal_keys(&jid)?;
            for key in keys {
                let portal = ctx.registry.portal(&key).await?;
                let Some(room) = portal.mxid().await else {
                    continue;
                };
                let intent = portal.main_intent().await?;
                if let Err(err) = ctx.home.kick(&intent, &room, self.mxid(), "Logout").await {
                    warn!(user = %self.mxid(), room = %room, error = %err, "Failed to kick user");
                }
            }
        }

        {
            let mut record = self.record.lock().await;
            record.session = None;
            ctx.store.lock().await.update_user(&record)?;
        }
        self.disconnect().await;
        Ok(())
    }

    /// Log out remotely and forget the login entirely.
    pub async fn logout(&self) -> Result<()> {
        let ctx = self.ctx()?;
        if let Some(client) = self.client().await {
            if let Err(err) = client.logout().await {
                warn!(user = %self.mxid(), error = %err, "Remote logout failed");
            }
        }
        self.teardown().await?;

        let jid = {
            let mut record = self.record.lock().await;
            record.credentials = None;
            let jid = record.jid.take();
            ctx.store.lock().await.update_user(&record)?;
            jid
        };
        if let Some(jid) = jid {
            ctx.registry.unregister_user_jid(&jid).await;
        }
        info!(user = %self.mxid(), "Logged out");
        Ok(())
    }

    /// Drop the connection without touching stored state.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.cancel.cancel();
        }
        self.set_state(SessionState::LoggedOut);
    }

    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }
}

/// Watch the connection's refresh signal. A positive value persists the
/// renewed session; anything else means the session is gone.
async fn monitor_session(
    user: Weak<User>,
    mut signals: mpsc::Receiver<i32>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(user) = user.upgrade() else {
            break;
        };
        if signal > 0 {
            if let Err(err) = user.persist_session().await {
                warn!(user = %user.mxid(), error = %err, "Failed to persist refreshed session");
            }
            continue;
        }
        user.handle_session_expired().await;
        break;
    }
}

#[cfg(test)]
mod tests {
    use skylink_store::{StoredSession, UserRecord};

    use super::*;
    use crate::home::Intent;
    use crate::testing::{Harness, ALICE, ALICE_JID};

    #[tokio::test]
    async fn login_persists_session_and_credentials() {
        let harness = Harness::new().await;
        let user = harness.login().await;

        assert_eq!(user.state(), SessionState::Connected);
        let stored = harness.ctx().store.lock().await.find_user_by_mxid(user.mxid()).unwrap();
        let stored = stored.unwrap();
        assert_eq!(stored.jid.as_ref().map(|j| j.as_str()), Some(ALICE_JID));
        assert!(stored.session.is_some());
        assert_eq!(stored.credentials.unwrap().username, "alice");

        let found = harness.ctx().registry.user_by_jid(&ALICE_JID.into()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &user));
    }

    #[tokio::test]
    async fn refresh_signal_persists_session() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        harness.remote.set_session_token("renewed");

        harness.remote.refresh(1);
        let (ctx, mxid) = (harness.ctx(), user.mxid());
        harness
            .eventually_async(move || async move {
                let record = ctx.store.lock().await.find_user_by_mxid(mxid).unwrap().unwrap();
                record.session.map(|s| s.skype_token) == Some("renewed".to_string())
            })
            .await;
        assert_eq!(user.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn expiry_with_credentials_logs_in_again() {
        let harness = Harness::new().await;
        let user = harness.login().await;

        harness.remote.refresh(0);
        harness.eventually(|| harness.remote.login_count() == 2).await;
        let mut state = user.watch_state();
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        assert!(harness.home.kicks().is_empty());
    }

    #[tokio::test]
    async fn expiry_without_credentials_tears_down() {
        let harness = Harness::new().await;
        let mgmt = "!mgmt:example.org";
        let mut record = UserRecord::new(ALICE.into());
        record.jid = Some(ALICE_JID.into());
        record.management_room = Some(mgmt.into());
        record.session = Some(StoredSession {
            skype_token: "stored".into(),
            ..StoredSession::default()
        });
        harness.ctx().store.lock().await.insert_user(&record).unwrap();

        harness.bridge.start().await.unwrap();
        let user = harness.ctx().registry.user(&ALICE.into()).await.unwrap();
        assert_eq!(user.state(), SessionState::Connected);
        let portal = harness.group_portal(&user).await;
        let room = portal.mxid().await.unwrap();

        harness.remote.refresh(0);
        let mut state = user.watch_state();
        state.wait_for(|s| *s == SessionState::LoggedOut).await.unwrap();

        let notices = harness.home.messages_in(&mgmt.into());
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].message.body,
            "Session expired and relogin failed: no stored credentials, please log in again"
        );
        assert_eq!(
            harness.home.kicks(),
            vec![(Intent::Bot, room, user.mxid().clone(), "Logout".to_string())]
        );
        assert!(user.client().await.is_none());
        let stored = harness.ctx().store.lock().await.find_user_by_mxid(user.mxid()).unwrap();
        let stored = stored.unwrap();
        assert!(stored.session.is_none());
    }

    #[tokio::test]
    async fn failed_login_keeps_the_live_connection() {
        let harness = Harness::new().await;
        let user = harness.login().await;
        harness.remote.fail_next_login();

        let credentials = LoginCredentials {
            username: "alice".to_string(),
            password: "wrong".to_string(),
        };
        assert!(user.login(credentials).await.is_err());

        assert_eq!(user.state(), SessionState::Connected);
        assert!(user.is_connected().await);
    }

    #[tokio::test]
    async fn logout_forgets_the_login() {
        let harness = Harness::new().await;
        let user = harness.login().await;

        user.logout().await.unwrap();

        assert_eq!(user.state(), SessionState::LoggedOut);
        assert_eq!(harness.remote.logout_count(), 1);
        assert!(harness.ctx().registry.user_by_jid(&ALICE_JID.into()).await.unwrap().is_none());
        let stored = harness.ctx().store.lock().await.find_user_by_mxid(user.mxid()).unwrap();
        let stored = stored.unwrap();
        assert!(stored.jid.is_none());
        assert!(stored.credentials.is_none());
    }
}
