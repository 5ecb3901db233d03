use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use wa_gateway_transport::wa_jid::Jid;
use wa_gateway_transport::wa_webhook::MessageStatus;

const INIT_MIGRATION_SQL: &str = include_str!("migrations/0001_init.sql");

/// One persisted chat message and its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataMessage {
    pub chat_id: String,
    pub message_id: String,
    pub message_timestamp: i64,
    pub json_data: String,
    pub status: MessageStatus,
    pub status_timestamp: i64,
}

/// The single paired account identity the External Client resumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub jid: Jid,
    pub push_name: Option<String>,
    pub platform: Option<String>,
    pub paired_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent dir '{}'",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open sqlite database '{}'", db_path.display()))?;
        conn.execute_batch(INIT_MIGRATION_SQL)
            .context("failed to apply initial sqlite migration")?;

        Ok(Self { db_path })
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open(&self.db_path).with_context(|| {
            format!(
                "failed to open sqlite database '{}'",
                self.db_path.display()
            )
        })
    }

    /// Upserts the whole batch in one transaction.
    pub fn save_messages(&self, messages: &[DataMessage]) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to begin message batch transaction")?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (
                    message_id, chat_id, message_timestamp, json_data,
                    status, status_timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(message_id) DO UPDATE SET
                    chat_id = excluded.chat_id,
                    message_timestamp = excluded.message_timestamp,
                    json_data = excluded.json_data,
                    status = excluded.status,
                    status_timestamp = excluded.status_timestamp",
            )?;

            for message in messages {
                stmt.execute(params![
                    message.message_id,
                    message.chat_id,
                    message.message_timestamp,
                    message.json_data,
                    message.status.code(),
                    message.status_timestamp
                ])
                .with_context(|| format!("failed to save message '{}'", message.message_id))?;
            }
        }

        tx.commit()
            .context("failed to commit message batch transaction")?;

        Ok(messages.len())
    }

    pub fn save_message(&self, message: &DataMessage) -> Result<()> {
        self.save_messages(std::slice::from_ref(message))
            .map(|_| ())
    }

    /// Returns `false` when no row with `message_id` exists.
    pub fn update_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        status_timestamp: i64,
    ) -> Result<bool> {
        let conn = self.connection()?;

        let updated = conn
            .execute(
                "UPDATE messages
                 SET status = ?2, status_timestamp = ?3
                 WHERE message_id = ?1",
                params![message_id, status.code(), status_timestamp],
            )
            .context("failed to update message status")?;

        Ok(updated > 0)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<DataMessage>> {
        let conn = self.connection()?;

        conn.query_row(
            "SELECT chat_id, message_id, message_timestamp, json_data, status, status_timestamp
             FROM messages
             WHERE message_id = ?1",
            params![message_id],
            row_to_message,
        )
        .optional()
        .context("failed to query message")
    }

    pub fn count_messages(&self) -> Result<u64> {
        let conn = self.connection()?;

        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get::<_, u64>(0))
            .context("failed to count messages")
    }

    pub fn load_device(&self) -> Result<Option<DeviceIdentity>> {
        let conn = self.connection()?;

        let row = conn
            .query_row(
                "SELECT jid, push_name, platform, paired_at_ms FROM device WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to query device identity")?;

        let Some((jid, push_name, platform, paired_at_ms)) = row else {
            return Ok(None);
        };

        let jid = jid
            .parse::<Jid>()
            .with_context(|| format!("stored device jid '{jid}' is invalid"))?;

        Ok(Some(DeviceIdentity {
            jid,
            push_name,
            platform,
            paired_at_ms,
        }))
    }

    pub fn save_device(&self, device: &DeviceIdentity) -> Result<()> {
        let conn = self.connection()?;

        conn.execute(
            "INSERT INTO device (id, jid, push_name, platform, paired_at_ms)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                jid = excluded.jid,
                push_name = excluded.push_name,
                platform = excluded.platform,
                paired_at_ms = excluded.paired_at_ms",
            params![
                device.jid.to_string(),
                device.push_name,
                device.platform,
                to_i64(device.paired_at_ms)?
            ],
        )
        .context("failed to save device identity")?;

        Ok(())
    }

    pub fn clear_device(&self) -> Result<bool> {
        let conn = self.connection()?;

        let deleted = conn
            .execute("DELETE FROM device WHERE id = 1", [])
            .context("failed to clear device identity")?;

        Ok(deleted > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataMessage> {
    Ok(DataMessage {
        chat_id: row.get(0)?,
        message_id: row.get(1)?,
        message_timestamp: row.get(2)?,
        json_data: row.get(3)?,
        status: MessageStatus::from_code(row.get(4)?),
        status_timestamp: row.get(5)?,
    })
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).context("u64 timestamp does not fit into i64")
}
