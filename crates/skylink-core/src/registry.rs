//! Identity registry: the one place in-memory users, puppets and portals are
//! created.
//!
//! Each map is sharded by key hash. A shard lock is held for the whole
//! lookup-or-create span, store round trip included, so two first references
//! to the same key can never insert two rows or build two objects. Secondary
//! indexes are only touched after the shard lock has been released or while
//! no other shard lock is held.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use skylink_shared::{HomeUserId, PortalKey, RemoteId, RoomId};
use skylink_store::{PortalRecord, PuppetRecord, UserRecord};
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::{upgrade, BridgeContext};
use crate::error::Result;
use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::user::User;

const SHARDS: usize = 16;

struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, Arc<V>>>>,
}

impl<K: Hash + Eq + Clone, V> ShardedMap<K, V> {
    fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Arc<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    async fn get(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lock().await.get(key).cloned()
    }

    async fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lock().await.remove(key)
    }

    async fn values(&self) -> Vec<Arc<V>> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.lock().await.values().cloned());
        }
        all
    }
}

pub struct IdentityRegistry {
    ctx: Weak<BridgeContext>,
    users: ShardedMap<HomeUserId, User>,
    users_by_jid: Mutex<HashMap<RemoteId, Arc<User>>>,
    puppets: ShardedMap<RemoteId, Puppet>,
    puppets_by_custom_mxid: Mutex<HashMap<HomeUserId, Arc<Puppet>>>,
    portals: ShardedMap<PortalKey, Portal>,
    portals_by_mxid: Mutex<HashMap<RoomId, Arc<Portal>>>,
}

impl IdentityRegistry {
    pub(crate) fn new(ctx: Weak<BridgeContext>) -> Self {
        Self {
            ctx,
            users: ShardedMap::new(),
            users_by_jid: Mutex::new(HashMap::new()),
            puppets: ShardedMap::new(),
            puppets_by_custom_mxid: Mutex::new(HashMap::new()),
            portals: ShardedMap::new(),
            portals_by_mxid: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Get or create the user for a home account.
    pub async fn user(&self, mxid: &HomeUserId) -> Result<Arc<User>> {
        let ctx = upgrade(&self.ctx)?;
        let mut shard = self.users.shard(mxid).lock().await;
        if let Some(user) = shard.get(mxid) {
            return Ok(user.clone());
        }

        let record = {
            let db = ctx.store.lock().await;
            match db.find_user_by_mxid(mxid)? {
                Some(record) => record,
                None => {
                    let record = UserRecord::new(mxid.clone());
                    db.insert_user(&record)?;
                    debug!(user = %mxid, "Created user row");
                    record
                }
            }
        };

        let jid = record.jid.clone();
        let user = User::new(&self.ctx, record);
        shard.insert(mxid.clone(), user.clone());
        drop(shard);

        if let Some(jid) = jid {
            self.users_by_jid.lock().await.insert(jid, user.clone());
        }
        Ok(user)
    }

    /// The user logged in as `jid`, if any. Never creates one.
    pub async fn user_by_jid(&self, jid: &RemoteId) -> Result<Option<Arc<User>>> {
        if let Some(user) = self.users_by_jid.lock().await.get(jid) {
            return Ok(Some(user.clone()));
        }
        let ctx = upgrade(&self.ctx)?;
        let record = ctx.store.lock().await.find_user_by_jid(jid)?;
        match record {
            Some(record) => Ok(Some(self.user(&record.mxid).await?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn register_user_jid(&self, jid: RemoteId, user: &Arc<User>) {
        self.users_by_jid.lock().await.insert(jid, user.clone());
    }

    pub(crate) async fn unregister_user_jid(&self, jid: &RemoteId) {
        self.users_by_jid.lock().await.remove(jid);
    }

    pub async fn loaded_users(&self) -> Vec<Arc<User>> {
        self.users.values().await
    }

    // -----------------------------------------------------------------------
    // Puppets
    // -----------------------------------------------------------------------

    /// Get or create the puppet for a remote contact.
    pub async fn puppet(&self, jid: &RemoteId) -> Result<Arc<Puppet>> {
        let ctx = upgrade(&self.ctx)?;
        let mut shard = self.puppets.shard(jid).lock().await;
        if let Some(puppet) = shard.get(jid) {
            return Ok(puppet.clone());
        }

        let record = {
            let db = ctx.store.lock().await;
            match db.find_puppet(jid)? {
                Some(record) => record,
                None => {
                    let record = PuppetRecord::new(jid.clone());
                    db.insert_puppet(&record)?;
                    debug!(puppet = %jid, "Created puppet row");
                    record
                }
            }
        };

        let custom = record.custom_mxid.clone();
        let puppet = Puppet::new(&self.ctx, &ctx.ids, record);
        shard.insert(jid.clone(), puppet.clone());
        drop(shard);

        if let Some(custom) = custom {
            self.puppets_by_custom_mxid
                .lock()
                .await
                .insert(custom, puppet.clone());
        }
        Ok(puppet)
    }

    /// Resolve a puppet home id back to its puppet.
    pub async fn puppet_by_mxid(&self, mxid: &HomeUserId) -> Result<Option<Arc<Puppet>>> {
        let ctx = upgrade(&self.ctx)?;
        match ctx.ids.parse_puppet_mxid(mxid) {
            Some(jid) => Ok(Some(self.puppet(&jid).await?)),
            None => Ok(None),
        }
    }

    /// The puppet a real home account double-puppets, if any.
    pub async fn puppet_by_custom_mxid(&self, mxid: &HomeUserId) -> Result<Option<Arc<Puppet>>> {
        if let Some(puppet) = self.puppets_by_custom_mxid.lock().await.get(mxid) {
            return Ok(Some(puppet.clone()));
        }
        let ctx = upgrade(&self.ctx)?;
        let record = ctx.store.lock().await.find_puppet_by_custom_mxid(mxid)?;
        match record {
            Some(record) => Ok(Some(self.puppet(&record.jid).await?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn reindex_custom_mxid(
        &self,
        old: Option<&HomeUserId>,
        new: Option<&HomeUserId>,
        puppet: &Arc<Puppet>,
    ) {
        let mut index = self.puppets_by_custom_mxid.lock().await;
        if let Some(old) = old {
            index.remove(old);
        }
        if let Some(new) = new {
            index.insert(new.clone(), puppet.clone());
        }
    }

    /// Load every double-puppeted puppet so its index entry exists.
    pub async fn load_custom_puppets(&self) -> Result<usize> {
        let ctx = upgrade(&self.ctx)?;
        let records = ctx.store.lock().await.puppets_with_custom_mxid()?;
        for record in &records {
            self.puppet(&record.jid).await?;
        }
        Ok(records.len())
    }

    // -----------------------------------------------------------------------
    // Portals
    // -----------------------------------------------------------------------

    /// Get or create the portal for a key, starting its consumer on creation.
    pub async fn portal(&self, key: &PortalKey) -> Result<Arc<Portal>> {
        let ctx = upgrade(&self.ctx)?;
        let mut shard = self.portals.shard(key).lock().await;
        if let Some(portal) = shard.get(key) {
            return Ok(portal.clone());
        }

        let record = {
            let db = ctx.store.lock().await;
            match db.find_portal(key)? {
                Some(record) => record,
                None => {
                    let record = PortalRecord::new(key.clone());
                    db.insert_portal(&record)?;
                    debug!(portal = %key, "Created portal row");
                    record
                }
            }
        };

        let mxid = record.mxid.clone();
        let portal = Portal::spawn(&ctx, record);
        shard.insert(key.clone(), portal.clone());
        drop(shard);

        if let Some(mxid) = mxid {
            self.portals_by_mxid.lock().await.insert(mxid, portal.clone());
        }
        Ok(portal)
    }

    /// The portal bridged into a home room, if any. Never creates one.
    pub async fn portal_by_mxid(&self, mxid: &RoomId) -> Result<Option<Arc<Portal>>> {
        if let Some(portal) = self.portals_by_mxid.lock().await.get(mxid) {
            return Ok(Some(portal.clone()));
        }
        let ctx = upgrade(&self.ctx)?;
        let record = ctx.store.lock().await.find_portal_by_mxid(mxid)?;
        match record {
            Some(record) => Ok(Some(self.portal(&record.key).await?)),
            None => Ok(None),
        }
    }

    /// A portal already loaded in memory, without touching the store.
    pub async fn loaded_portal(&self, key: &PortalKey) -> Option<Arc<Portal>> {
        self.portals.get(key).await
    }

    pub(crate) async fn register_portal_mxid(&self, mxid: RoomId, portal: &Arc<Portal>) {
        self.portals_by_mxid.lock().await.insert(mxid, portal.clone());
    }

    /// Forget a portal under both of its keys. Its consumer stops once the
    /// last handle is gone.
    pub(crate) async fn unregister_portal(&self, key: &PortalKey, mxid: Option<&RoomId>) {
        self.portals.remove(key).await;
        if let Some(mxid) = mxid {
            self.portals_by_mxid.lock().await.remove(mxid);
        }
    }

    pub async fn loaded_portals(&self) -> Vec<Arc<Portal>> {
        self.portals.values().await
    }
}
