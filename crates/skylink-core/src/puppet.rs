use std::sync::{Arc, Weak};

use skylink_shared::constants::{
    NAME_QUALITY_DISPLAYNAME, NAME_QUALITY_NONE, NAME_QUALITY_PERSON_ID,
};
use skylink_shared::{HomeUserId, PortalKey, RemoteId};
use skylink_store::PuppetRecord;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::{upgrade, BridgeContext};
use crate::error::{BridgeError, Result};
use crate::home::Intent;
use crate::ids::PuppetIdMapper;
use crate::remote::{RemoteClient, RemoteContact, RemoteMedia};

/// A remote contact mirrored as a ghost account.
pub struct Puppet {
    ctx: Weak<BridgeContext>,
    jid: RemoteId,
    mxid: HomeUserId,
    record: Mutex<PuppetRecord>,
}

impl Puppet {
    pub(crate) fn new(
        ctx: &Weak<BridgeContext>,
        ids: &PuppetIdMapper,
        record: PuppetRecord,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: ctx.clone(),
            jid: record.jid.clone(),
            mxid: ids.puppet_mxid(&record.jid),
            record: Mutex::new(record),
        })
    }

    pub fn jid(&self) -> &RemoteId {
        &self.jid
    }

    /// The ghost account's home id.
    pub fn mxid(&self) -> &HomeUserId {
        &self.mxid
    }

    pub async fn record(&self) -> PuppetRecord {
        self.record.lock().await.clone()
    }

    pub async fn displayname(&self) -> String {
        self.record.lock().await.displayname.clone()
    }

    pub fn default_intent(&self) -> Intent {
        Intent::Ghost(self.mxid.clone())
    }

    /// The real account lent to this puppet, when double puppeting is set up.
    pub async fn custom_intent(&self) -> Option<Intent> {
        let record = self.record.lock().await;
        match (&record.custom_mxid, &record.access_token) {
            (Some(mxid), Some(token)) => Some(Intent::Custom {
                mxid: mxid.clone(),
                access_token: token.clone(),
            }),
            _ => None,
        }
    }

    /// Intent to act as this contact in a portal.
    ///
    /// The private chat with the contact itself always uses the ghost.
    pub async fn intent_for(&self, portal: &PortalKey) -> Intent {
        if portal.private_chat_partner().as_ref() == Some(&self.jid) {
            return self.default_intent();
        }
        match self.custom_intent().await {
            Some(intent) => intent,
            None => self.default_intent(),
        }
    }

    /// Apply a display name unless the stored one came from a better source.
    pub async fn update_name(&self, name: &str, quality: i64) -> Result<bool> {
        let ctx = upgrade(&self.ctx)?;
        let formatted = ctx.ids.displayname(name);

        let mut record = self.record.lock().await;
        if quality < record.name_quality || formatted == record.displayname {
            return Ok(false);
        }

        ctx.home
            .set_display_name(&self.default_intent(), &formatted)
            .await?;
        record.displayname = formatted;
        record.name_quality = quality;
        ctx.store.lock().await.update_puppet(&record)?;
        debug!(puppet = %self.jid, name = %record.displayname, quality, "Updated puppet name");
        Ok(true)
    }

    /// Sync name and avatar from a contact list entry.
    pub async fn update_from_contact(
        &self,
        client: &dyn RemoteClient,
        contact: &RemoteContact,
    ) -> Result<bool> {
        let (name, quality) = contact_name(contact);
        let mut changed = self.update_name(&name, quality).await?;
        if let Some(url) = &contact.avatar_url {
            changed |= self.update_avatar(client, url).await?;
        }
        Ok(changed)
    }

    /// Mirror a remote avatar. An empty URL clears it.
    pub async fn update_avatar(&self, client: &dyn RemoteClient, url: &str) -> Result<bool> {
        let ctx = upgrade(&self.ctx)?;
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
            let data = client.download_media(&media).await?;
            ctx.home.upload(data, &media.mimetype).await?
        };
        ctx.home
            .set_avatar_url(&self.default_intent(), &content_uri)
            .await?;

        record.avatar = url.to_string();
        record.avatar_url = content_uri;
        ctx.store.lock().await.update_puppet(&record)?;
        debug!(puppet = %self.jid, "Updated puppet avatar");
        Ok(true)
    }

    /// Attach or detach a real home account for double puppeting.
    pub async fn switch_custom_mxid(
        self: &Arc<Self>,
        access_token: Option<String>,
        mxid: Option<HomeUserId>,
    ) -> Result<()> {
        let ctx = upgrade(&self.ctx)?;
        let old = {
            let mut record = self.record.lock().await;
            let old = record.custom_mxid.take();
            record.custom_mxid = mxid.clone();
            record.access_token = access_token;
            if old != mxid {
                record.next_batch = None;
            }
            ctx.store.lock().await.update_puppet(&record)?;
            old
        };
        ctx.registry
            .reindex_custom_mxid(old.as_ref(), mxid.as_ref(), self)
            .await;
        info!(puppet = %self.jid, custom = ?mxid, "Switched custom puppet");
        Ok(())
    }

    /// Obtain a fresh token for the custom account after it expired.
    pub async fn refresh_custom_token(&self) -> Result<Intent> {
        let ctx = upgrade(&self.ctx)?;
        let mut record = self.record.lock().await;
        let mxid = record.custom_mxid.clone().ok_or(BridgeError::AuthExpired)?;
        let token = ctx.home.login_as(&mxid).await?;
        record.access_token = Some(token.clone());
        ctx.store.lock().await.update_puppet(&record)?;
        info!(puppet = %self.jid, "Refreshed custom puppet token");
        Ok(Intent::Custom {
            mxid,
            access_token: token,
        })
    }
}

/// Best available name for a contact and how much to trust it.
pub fn contact_name(contact: &RemoteContact) -> (String, i64) {
    if let Some(name) = contact.display_name.as_deref().filter(|n| !n.is_empty()) {
        return (name.to_string(), NAME_QUALITY_DISPLAYNAME);
    }
    if let Some(person) = contact.person_id.as_deref().filter(|p| !p.is_empty()) {
        return (person.to_string(), NAME_QUALITY_PERSON_ID);
    }
    (contact.id.bare().to_string(), NAME_QUALITY_NONE)
}
