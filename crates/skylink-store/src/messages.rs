use rusqlite::{params, OptionalExtension};
use skylink_shared::{EventId, PortalKey, RemoteId};

use crate::database::Database;
use crate::error::Result;
use crate::models::MessageRecord;

const MESSAGE_COLUMNS: &str = "chat_jid, chat_receiver, jid, id, mxid, sender, timestamp, content";

impl Database {
    pub fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO message
                 (chat_jid, chat_receiver, jid, id, mxid, sender, timestamp, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.chat.jid.as_str(),
                message.chat.receiver.as_str(),
                message.jid,
                message.id,
                message.mxid.as_str(),
                message.sender.as_str(),
                message.timestamp,
                message.content,
            ],
        )?;
        Ok(())
    }

    /// Look up a message by its client-assigned id within a portal.
    pub fn find_message(&self, chat: &PortalKey, jid: &str) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM message
                     WHERE chat_jid = ?1 AND chat_receiver = ?2 AND jid = ?3"
                ),
                params![chat.jid.as_str(), chat.receiver.as_str(), jid],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn find_message_by_mxid(&self, mxid: &EventId) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE mxid = ?1"),
                params![mxid.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Look up a message by its network-confirmed id within a portal.
    pub fn find_message_by_remote_id(
        &self,
        chat: &PortalKey,
        id: &str,
    ) -> Result<Option<MessageRecord>> {
        if id.is_empty() {
            return Ok(None);
        }
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM message
                     WHERE chat_jid = ?1 AND chat_receiver = ?2 AND id = ?3"
                ),
                params![chat.jid.as_str(), chat.receiver.as_str(), id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Attach the network-confirmed id to a row that does not have one yet.
    ///
    /// Returns `false` when the row is missing or already carries an id.
    pub fn backfill_message_id(&self, chat: &PortalKey, jid: &str, id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE message SET id = ?4
             WHERE chat_jid = ?1 AND chat_receiver = ?2 AND jid = ?3 AND id = ''",
            params![chat.jid.as_str(), chat.receiver.as_str(), jid, id],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_message(&self, chat: &PortalKey, jid: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM message WHERE chat_jid = ?1 AND chat_receiver = ?2 AND jid = ?3",
            params![chat.jid.as_str(), chat.receiver.as_str(), jid],
        )?;
        Ok(affected > 0)
    }

    /// Most recent bridged message of a portal.
    pub fn last_message_in_chat(&self, chat: &PortalKey) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM message
                     WHERE chat_jid = ?1 AND chat_receiver = ?2
                     ORDER BY timestamp DESC
                     LIMIT 1"
                ),
                params![chat.jid.as_str(), chat.receiver.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn count_messages_in_chat(&self, chat: &PortalKey) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM message WHERE chat_jid = ?1 AND chat_receiver = ?2",
            params![chat.jid.as_str(), chat.receiver.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let chat_jid: String = row.get(0)?;
    let chat_receiver: String = row.get(1)?;
    let mxid: String = row.get(4)?;
    let sender: String = row.get(5)?;

    Ok(MessageRecord {
        chat: PortalKey::from_parts(chat_jid, chat_receiver),
        jid: row.get(2)?,
        id: row.get(3)?,
        mxid: EventId(mxid),
        sender: RemoteId(sender),
        timestamp: row.get(6)?,
        content: row.get(7)?,
    })
}
