use rusqlite::{params, OptionalExtension};
use skylink_shared::{PortalKey, RemoteId, RoomId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::PortalRecord;

const PORTAL_COLUMNS: &str = "jid, receiver, mxid, name, topic, avatar, avatar_url, encrypted";

impl Database {
    pub fn insert_portal(&self, portal: &PortalRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO portal (jid, receiver, mxid, name, topic, avatar, avatar_url, encrypted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                portal.key.jid.as_str(),
                portal.key.receiver.as_str(),
                portal.mxid.as_ref().map(|m| m.as_str()),
                portal.name,
                portal.topic,
                portal.avatar,
                portal.avatar_url,
                portal.encrypted,
            ],
        )?;
        Ok(())
    }

    pub fn update_portal(&self, portal: &PortalRecord) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE portal
             SET mxid = ?3, name = ?4, topic = ?5, avatar = ?6, avatar_url = ?7, encrypted = ?8
             WHERE jid = ?1 AND receiver = ?2",
            params![
                portal.key.jid.as_str(),
                portal.key.receiver.as_str(),
                portal.mxid.as_ref().map(|m| m.as_str()),
                portal.name,
                portal.topic,
                portal.avatar,
                portal.avatar_url,
                portal.encrypted,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("portal {}", portal.key)));
        }
        Ok(())
    }

    pub fn delete_portal(&self, key: &PortalKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM portal WHERE jid = ?1 AND receiver = ?2",
            params![key.jid.as_str(), key.receiver.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn get_portal(&self, key: &PortalKey) -> Result<PortalRecord> {
        self.find_portal(key)?
            .ok_or_else(|| StoreError::NotFound(format!("portal {key}")))
    }

    pub fn find_portal(&self, key: &PortalKey) -> Result<Option<PortalRecord>> {
        let portal = self
            .conn()
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portal WHERE jid = ?1 AND receiver = ?2"),
                params![key.jid.as_str(), key.receiver.as_str()],
                row_to_portal,
            )
            .optional()?;
        Ok(portal)
    }

    pub fn find_portal_by_mxid(&self, mxid: &RoomId) -> Result<Option<PortalRecord>> {
        let portal = self
            .conn()
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portal WHERE mxid = ?1"),
                params![mxid.as_str()],
                row_to_portal,
            )
            .optional()?;
        Ok(portal)
    }

    /// Every portal of a conversation, across receivers.
    pub fn portals_by_jid(&self, jid: &RemoteId) -> Result<Vec<PortalRecord>> {
        self.query_portals(
            &format!("SELECT {PORTAL_COLUMNS} FROM portal WHERE jid = ?1"),
            params![jid.as_str()],
        )
    }

    /// Private chats owned by `receiver`.
    pub fn private_chats_of(&self, receiver: &RemoteId) -> Result<Vec<PortalRecord>> {
        self.query_portals(
            &format!("SELECT {PORTAL_COLUMNS} FROM portal WHERE receiver = ?1 AND jid <> receiver"),
            params![receiver.as_str()],
        )
    }

    pub fn all_portals(&self) -> Result<Vec<PortalRecord>> {
        self.query_portals(&format!("SELECT {PORTAL_COLUMNS} FROM portal"), params![])
    }

    fn query_portals(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<PortalRecord>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(args, row_to_portal)?;

        let mut portals = Vec::new();
        for row in rows {
            portals.push(row?);
        }
        Ok(portals)
    }
}

fn row_to_portal(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortalRecord> {
    let jid: String = row.get(0)?;
    let receiver: String = row.get(1)?;
    let mxid: Option<String> = row.get(2)?;

    Ok(PortalRecord {
        key: PortalKey::from_parts(jid, receiver),
        mxid: mxid.filter(|m| !m.is_empty()).map(RoomId),
        name: row.get(3)?,
        topic: row.get(4)?,
        avatar: row.get(5)?,
        avatar_url: row.get(6)?,
        encrypted: row.get(7)?,
    })
}
