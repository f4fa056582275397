use rusqlite::{params, OptionalExtension};
use skylink_shared::{HomeUserId, RemoteId, RoomId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{StoredCredentials, StoredSession, UserRecord};

const USER_COLUMNS: &str = "mxid, jid, management_room, last_connection, endpoint_id, skype_token,
     registration_token, registration_token_str, location_host, username, password";

impl Database {
    pub fn insert_user(&self, user: &UserRecord) -> Result<()> {
        let session = user.session.clone().unwrap_or_default();
        let has_session = user.session.is_some();
        self.conn().execute(
            "INSERT INTO \"user\" (mxid, jid, management_room, last_connection, endpoint_id,
                                   skype_token, registration_token, registration_token_str,
                                   location_host, username, password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user.mxid.as_str(),
                user.jid.as_ref().map(|j| j.as_str()),
                user.management_room.as_ref().map(|r| r.as_str()),
                user.last_connection,
                has_session.then_some(session.endpoint_id),
                has_session.then_some(session.skype_token),
                has_session.then_some(session.registration_token),
                has_session.then_some(session.registration_token_str),
                has_session.then_some(session.location_host),
                user.credentials.as_ref().map(|c| c.username.as_str()),
                user.credentials.as_ref().map(|c| c.password.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn update_user(&self, user: &UserRecord) -> Result<()> {
        let session = user.session.clone().unwrap_or_default();
        let has_session = user.session.is_some();
        let affected = self.conn().execute(
            "UPDATE \"user\"
             SET jid = ?2, management_room = ?3, last_connection = ?4, endpoint_id = ?5,
                 skype_token = ?6, registration_token = ?7, registration_token_str = ?8,
                 location_host = ?9, username = ?10, password = ?11
             WHERE mxid = ?1",
            params![
                user.mxid.as_str(),
                user.jid.as_ref().map(|j| j.as_str()),
                user.management_room.as_ref().map(|r| r.as_str()),
                user.last_connection,
                has_session.then_some(session.endpoint_id),
                has_session.then_some(session.skype_token),
                has_session.then_some(session.registration_token),
                has_session.then_some(session.registration_token_str),
                has_session.then_some(session.location_host),
                user.credentials.as_ref().map(|c| c.username.as_str()),
                user.credentials.as_ref().map(|c| c.password.as_str()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("user {}", user.mxid)));
        }
        Ok(())
    }

    pub fn find_user_by_mxid(&self, mxid: &HomeUserId) -> Result<Option<UserRecord>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM \"user\" WHERE mxid = ?1"),
                params![mxid.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_jid(&self, jid: &RemoteId) -> Result<Option<UserRecord>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM \"user\" WHERE jid = ?1"),
                params![jid.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Users that have completed a login at least once.
    pub fn logged_in_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM \"user\" WHERE jid IS NOT NULL AND jid <> ''"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Clear the management room of whichever user currently owns `room`.
    pub fn release_management_room(&self, room: &RoomId, except: &HomeUserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE \"user\" SET management_room = NULL WHERE management_room = ?1 AND mxid <> ?2",
            params![room.as_str(), except.as_str()],
        )?;
        Ok(affected)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let mxid: String = row.get(0)?;
    let jid: Option<String> = row.get(1)?;
    let management_room: Option<String> = row.get(2)?;

    let skype_token: Option<String> = row.get(5)?;
    let session = match skype_token {
        Some(skype_token) => Some(StoredSession {
            endpoint_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            skype_token,
            registration_token: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            registration_token_str: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            location_host: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        }),
        None => None,
    };

    let username: Option<String> = row.get(9)?;
    let password: Option<String> = row.get(10)?;
    let credentials = match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() => {
            Some(StoredCredentials { username, password })
        }
        _ => None,
    };

    Ok(UserRecord {
        mxid: HomeUserId(mxid),
        jid: jid.filter(|j| !j.is_empty()).map(RemoteId),
        management_room: management_room.filter(|r| !r.is_empty()).map(RoomId),
        last_connection: row.get(3)?,
        session,
        credentials,
    })
}
