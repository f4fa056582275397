use rusqlite::{params, OptionalExtension};
use skylink_shared::{HomeUserId, RemoteId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::PuppetRecord;

const PUPPET_COLUMNS: &str =
    "jid, avatar, avatar_url, displayname, name_quality, custom_mxid, access_token, next_batch";

impl Database {
    pub fn insert_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO puppet (jid, avatar, avatar_url, displayname, name_quality,
                                 custom_mxid, access_token, next_batch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                puppet.jid.as_str(),
                puppet.avatar,
                puppet.avatar_url,
                puppet.displayname,
                puppet.name_quality,
                puppet.custom_mxid.as_ref().map(|m| m.as_str()),
                puppet.access_token,
                puppet.next_batch,
            ],
        )?;
        Ok(())
    }

    pub fn update_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE puppet
             SET avatar = ?2, avatar_url = ?3, displayname = ?4, name_quality = ?5,
                 custom_mxid = ?6, access_token = ?7, next_batch = ?8
             WHERE jid = ?1",
            params![
                puppet.jid.as_str(),
                puppet.avatar,
                puppet.avatar_url,
                puppet.displayname,
                puppet.name_quality,
                puppet.custom_mxid.as_ref().map(|m| m.as_str()),
                puppet.access_token,
                puppet.next_batch,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("puppet {}", puppet.jid)));
        }
        Ok(())
    }

    pub fn find_puppet(&self, jid: &RemoteId) -> Result<Option<PuppetRecord>> {
        let puppet = self
            .conn()
            .query_row(
                &format!("SELECT {PUPPET_COLUMNS} FROM puppet WHERE jid = ?1"),
                params![jid.as_str()],
                row_to_puppet,
            )
            .optional()?;
        Ok(puppet)
    }

    pub fn find_puppet_by_custom_mxid(&self, mxid: &HomeUserId) -> Result<Option<PuppetRecord>> {
        let puppet = self
            .conn()
            .query_row(
                &format!("SELECT {PUPPET_COLUMNS} FROM puppet WHERE custom_mxid = ?1"),
                params![mxid.as_str()],
                row_to_puppet,
            )
            .optional()?;
        Ok(puppet)
    }

    pub fn all_puppets(&self) -> Result<Vec<PuppetRecord>> {
        self.query_puppets(&format!("SELECT {PUPPET_COLUMNS} FROM puppet"))
    }

    pub fn puppets_with_custom_mxid(&self) -> Result<Vec<PuppetRecord>> {
        self.query_puppets(&format!(
            "SELECT {PUPPET_COLUMNS} FROM puppet
             WHERE custom_mxid IS NOT NULL AND custom_mxid <> ''"
        ))
    }

    fn query_puppets(&self, sql: &str) -> Result<Vec<PuppetRecord>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map([], row_to_puppet)?;

        let mut puppets = Vec::new();
        for row in rows {
            puppets.push(row?);
        }
        Ok(puppets)
    }
}

fn row_to_puppet(row: &rusqlite::Row<'_>) -> rusqlite::Result<PuppetRecord> {
    let jid: String = row.get(0)?;
    let custom_mxid: Option<String> = row.get(5)?;

    Ok(PuppetRecord {
        jid: RemoteId(jid),
        avatar: row.get(1)?,
        avatar_url: row.get(2)?,
        displayname: row.get(3)?,
        name_quality: row.get(4)?,
        custom_mxid: custom_mxid.filter(|m| !m.is_empty()).map(HomeUserId),
        access_token: row.get(6)?,
        next_batch: row.get(7)?,
    })
}
