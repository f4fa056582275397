use rusqlite::params;
use skylink_shared::{PortalKey, RemoteId};

use crate::database::Database;
use crate::error::Result;
use crate::models::UserPortalRecord;

impl Database {
    /// Replace the set of portals `user_jid` participates in. Every portal
    /// must already have a row.
    pub fn set_user_portals(
        &mut self,
        user_jid: &RemoteId,
        portals: &[UserPortalRecord],
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM user_portal WHERE user_jid = ?1",
            params![user_jid.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO user_portal
                     (user_jid, portal_jid, portal_receiver, in_community)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in portals {
                stmt.execute(params![
                    user_jid.as_str(),
                    record.portal.jid.as_str(),
                    record.portal.receiver.as_str(),
                    record.in_community,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a single membership without touching the others.
    pub fn add_user_portal(&self, record: &UserPortalRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_portal (user_jid, portal_jid, portal_receiver, in_community)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.user_jid.as_str(),
                record.portal.jid.as_str(),
                record.portal.receiver.as_str(),
                record.in_community,
            ],
        )?;
        Ok(())
    }

    pub fn user_portal_keys(&self, user_jid: &RemoteId) -> Result<Vec<PortalKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT portal_jid, portal_receiver FROM user_portal WHERE user_jid = ?1",
        )?;
        let rows = stmt.query_map(params![user_jid.as_str()], |row| {
            let jid: String = row.get(0)?;
            let receiver: String = row.get(1)?;
            Ok(PortalKey::from_parts(jid, receiver))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub fn is_user_in_portal(&self, user_jid: &RemoteId, key: &PortalKey) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM user_portal
             WHERE user_jid = ?1 AND portal_jid = ?2 AND portal_receiver = ?3",
            params![user_jid.as_str(), key.jid.as_str(), key.receiver.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortalRecord;

    #[test]
    fn replace_membership_set() {
        let mut db = Database::open_in_memory().unwrap();
        let me = RemoteId::from("8:me@s.skype.net");
        let a = PortalKey::new("19:a@thread.skype", "");
        let b = PortalKey::new("19:b@thread.skype", "");
        db.insert_portal(&PortalRecord::new(a.clone())).unwrap();
        db.insert_portal(&PortalRecord::new(b.clone())).unwrap();

        let record = |key: &PortalKey| UserPortalRecord {
            user_jid: me.clone(),
            portal: key.clone(),
            in_community: false,
        };

        db.set_user_portals(&me, &[record(&a), record(&b)]).unwrap();
        assert_eq!(db.user_portal_keys(&me).unwrap().len(), 2);

        db.set_user_portals(&me, &[record(&b)]).unwrap();
        assert_eq!(db.user_portal_keys(&me).unwrap(), vec![b.clone()]);
        assert!(!db.is_user_in_portal(&me, &a).unwrap());

        db.add_user_portal(&record(&a)).unwrap();
        db.add_user_portal(&record(&a)).unwrap();
        assert!(db.is_user_in_portal(&me, &a).unwrap());
    }
}
