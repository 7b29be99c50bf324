use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use nexfi_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageStatus, Transition};

const SELECT_COLUMNS: &str = "SELECT id, from_user_id, to_user_id, content, image, voice, mood,
        timestamp, status, sent_by_me, is_read, remote_id
 FROM messages";

impl Database {
    /// Insert or update a batch of messages in one transaction.
    ///
    /// Content fields take the incoming values. The stored status is the
    /// greater of the stored and incoming status, and `remote_id` follows
    /// whichever side wins. Any record that breaks the `remote_id` rule
    /// aborts the whole batch.
    pub fn upsert_messages(&mut self, messages: &[Message]) -> Result<()> {
        if let Some(bad) = messages.iter().find(|m| !m.is_consistent()) {
            return Err(StoreError::InvalidRecord(bad.id.clone()));
        }

        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (id, from_user_id, to_user_id, content, image, voice, mood,
                                       timestamp, status, sent_by_me, is_read, remote_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    from_user_id = excluded.from_user_id,
                    to_user_id   = excluded.to_user_id,
                    content      = excluded.content,
                    image        = excluded.image,
                    voice        = excluded.voice,
                    mood         = excluded.mood,
                    timestamp    = excluded.timestamp,
                    sent_by_me   = excluded.sent_by_me,
                    is_read      = excluded.is_read,
                    status       = MAX(messages.status, excluded.status),
                    remote_id    = CASE WHEN excluded.status > messages.status
                                        THEN excluded.remote_id
                                        ELSE messages.remote_id END",
            )?;

            for m in messages {
                stmt.execute(params![
                    m.id,
                    m.from_user_id.as_str(),
                    m.to_user_id.as_str(),
                    m.text,
                    m.image,
                    m.voice,
                    m.mood,
                    format_timestamp(&m.timestamp),
                    m.status.rank(),
                    m.sent_by_me,
                    m.read,
                    m.remote_id,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = messages.len(), "upserted messages");
        Ok(())
    }

    pub fn upsert_message(&mut self, message: &Message) -> Result<()> {
        self.upsert_messages(std::slice::from_ref(message))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let message = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Every message not yet acknowledged by the backend, oldest first.
    pub fn get_unsynced_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS} WHERE status < ?1 ORDER BY timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![MessageStatus::Synced.rank()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Advance a `local` message to `delivered`.
    pub fn mark_message_delivered(&self, id: &str) -> Result<Transition> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id, MessageStatus::Delivered.rank()],
        )?;
        self.transition_result(id, affected)
    }

    /// Record the backend id of a message and mark it `synced`.
    pub fn mark_message_synced(&self, id: &str, remote_id: &str) -> Result<Transition> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, remote_id = ?3 WHERE id = ?1 AND status < ?2",
            params![id, MessageStatus::Synced.rank(), remote_id],
        )?;
        self.transition_result(id, affected)
    }

    /// Messages exchanged between two users in either direction, oldest first.
    pub fn get_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE (from_user_id = ?1 AND to_user_id = ?2)
                OR (from_user_id = ?2 AND to_user_id = ?1)
             ORDER BY timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![a.as_str(), b.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn transition_result(&self, id: &str, affected: usize) -> Result<Transition> {
        if affected > 0 {
            return Ok(Transition::Applied);
        }
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(if exists {
            Transition::Unchanged
        } else {
            Transition::NotFound
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let ts_str: String = row.get(7)?;
    let rank: i64 = row.get(8)?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let status = MessageStatus::from_rank(rank)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(8, rank))?;

    Ok(Message {
        id: row.get(0)?,
        from_user_id: UserId::new(row.get::<_, String>(1)?),
        to_user_id: UserId::new(row.get::<_, String>(2)?),
        text: row.get(3)?,
        image: row.get(4)?,
        voice: row.get(5)?,
        mood: row.get(6)?,
        timestamp,
        status,
        sent_by_me: row.get(9)?,
        read: row.get(10)?,
        remote_id: row.get(11)?,
    })
}
