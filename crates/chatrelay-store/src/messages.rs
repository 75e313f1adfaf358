use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use chatrelay_core::{MessageKind, UserId};

use crate::database::Database;
use crate::error::StoreError;

/// Most recent conversations returned per user.
pub const RECENT_CHATS_LIMIT: u32 = 10;

/// Placeholder shown for a user with no exchanged messages.
pub const NO_MESSAGES_YET: &str = "No messages yet";

/// A message about to be stored.
#[derive(Clone, Copy, Debug)]
pub struct NewMessage<'a> {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    /// Text for text messages, filename for media.
    pub body: &'a str,
    /// Base64 media body.
    pub media: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub media: Option<String>,
    pub timestamp: String,
}

/// One line of a conversation, shaped for the `get_chat_history` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub message: String,
    pub timestamp: String,
    pub is_image: bool,
    pub is_voice: bool,
    pub is_video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_data: Option<String>,
}

impl HistoryEntry {
    fn new(
        sender_id: UserId,
        sender_name: String,
        sender_avatar: Option<String>,
        kind: MessageKind,
        body: String,
        media: Option<String>,
        timestamp: String,
    ) -> Self {
        let mut entry = Self {
            sender_id,
            sender_name,
            sender_avatar,
            message: body,
            timestamp,
            is_image: kind == MessageKind::Image,
            is_voice: kind == MessageKind::Voice,
            is_video: kind == MessageKind::Video,
            image_data: None,
            voice_data: None,
            video_data: None,
        };
        match kind {
            MessageKind::Text => {}
            MessageKind::Image => entry.image_data = media,
            MessageKind::Voice => entry.voice_data = media,
            MessageKind::Video => entry.video_data = media,
        }
        entry
    }
}

/// Another user and the latest message exchanged with them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecentChat {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub last_message: String,
    pub last_timestamp: Option<String>,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a message. Both users must exist.
    #[instrument(
        skip(self, msg),
        fields(sender_id = %msg.sender_id, receiver_id = %msg.receiver_id, kind = %msg.kind)
    )]
    pub fn insert(&self, msg: NewMessage<'_>) -> Result<StoredMessage, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let known: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE id IN (?1, ?2)",
                rusqlite::params![msg.sender_id.get(), msg.receiver_id.get()],
                |row| row.get(0),
            )?;
            let expected = if msg.sender_id == msg.receiver_id { 1 } else { 2 };
            if known < expected {
                return Err(StoreError::NotFound(format!("user {}", msg.receiver_id)));
            }

            conn.execute(
                "INSERT INTO chat_messages (sender_id, receiver_id, kind, body, media, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.sender_id.get(),
                    msg.receiver_id.get(),
                    msg.kind.as_str(),
                    msg.body,
                    msg.media,
                    now,
                ],
            )?;

            Ok(StoredMessage {
                id: conn.last_insert_rowid(),
                sender_id: msg.sender_id,
                receiver_id: msg.receiver_id,
                kind: msg.kind,
                body: msg.body.to_string(),
                media: msg.media.map(str::to_string),
                timestamp: now.clone(),
            })
        })
    }

    /// Conversation between two users, oldest first.
    #[instrument(skip(self), fields(user_id = %user, peer_id = %peer))]
    pub fn history(&self, user: UserId, peer: UserId) -> Result<Vec<HistoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.sender_id, COALESCE(u.display_name, 'Unknown'), u.avatar,
                        m.kind, m.body, m.media, m.created_at
                 FROM chat_messages m
                 LEFT JOIN users u ON u.id = m.sender_id
                 WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
                    OR (m.sender_id = ?2 AND m.receiver_id = ?1)
                 ORDER BY m.id ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![user.get(), peer.get()])?;
            let mut history = Vec::new();
            while let Some(row) = rows.next()? {
                let raw_kind: String = row.get(3)?;
                let kind = raw_kind.parse::<MessageKind>().map_err(|e| {
                    StoreError::Database(format!("chat_messages.kind: {e}"))
                })?;
                history.push(HistoryEntry::new(
                    UserId::new(row.get(0)?),
                    row.get(1)?,
                    row.get(2)?,
                    kind,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ));
            }
            Ok(history)
        })
    }

    /// Every other user with the latest message exchanged with `user`,
    /// most recent conversation first, users never talked to last.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn recent(&self, user: UserId) -> Result<Vec<RecentChat>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.display_name, u.avatar, lm.body, lm.created_at
                 FROM users u
                 LEFT JOIN chat_messages lm ON lm.id = (
                     SELECT MAX(m.id) FROM chat_messages m
                     WHERE (m.sender_id = u.id AND m.receiver_id = ?1)
                        OR (m.sender_id = ?1 AND m.receiver_id = u.id)
                 )
                 WHERE u.id != ?1
                 ORDER BY lm.id IS NULL, lm.id DESC, u.id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user.get(), RECENT_CHATS_LIMIT], |row| {
                    let last: Option<String> = row.get(3)?;
                    Ok(RecentChat {
                        user_id: UserId::new(row.get(0)?),
                        display_name: row.get(1)?,
                        avatar: row.get(2)?,
                        last_message: last.unwrap_or_else(|| NO_MESSAGES_YET.to_string()),
                        last_timestamp: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
