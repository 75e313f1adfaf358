//! Routed message records and their pushed wire shape.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ids::UserId;

/// What a routed message carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [Self::Text, Self::Image, Self::Voice, Self::Video];

    /// Request field holding the base64 payload, `None` for text.
    pub fn data_field(self) -> Option<&'static str> {
        match self {
            Self::Text => None,
            Self::Image => Some("image_data"),
            Self::Voice => Some("voice_data"),
            Self::Video => Some("video_data"),
        }
    }

    /// Filename used when a media request omits one.
    pub fn default_filename(self) -> Option<&'static str> {
        match self {
            Self::Text => None,
            Self::Image => Some("image.jpg"),
            Self::Voice => Some("voice.wav"),
            Self::Video => Some("video.mp4"),
        }
    }

    pub fn is_media(self) -> bool {
        self != Self::Text
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// One routed message. Built once by the dispatcher and never mutated; it
/// ends up either written to the recipient's live connection or parked in
/// the recipient's offline mailbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    /// Message text, or the base64 media body for media kinds.
    pub payload: String,
    /// Original filename for media kinds.
    pub filename: Option<String>,
    /// RFC 3339 timestamp assigned when the message was stored.
    pub timestamp: String,
}

impl Envelope {
    /// Server-to-client push frame for this envelope.
    ///
    /// `message` carries the text, or the filename for media; the media body
    /// goes under the kind's data field.
    pub fn to_push(&self) -> serde_json::Value {
        let message = match self.kind {
            MessageKind::Text => self.payload.as_str(),
            _ => self.filename.as_deref().unwrap_or_default(),
        };

        let mut frame = json!({
            "action": "message",
            "sender_id": self.sender_id,
            "sender_name": self.sender_name,
            "sender_avatar": self.sender_avatar,
            "receiver_id": self.receiver_id,
            "message": message,
            "timestamp": self.timestamp,
            "is_image": self.kind == MessageKind::Image,
            "is_voice": self.kind == MessageKind::Voice,
            "is_video": self.kind == MessageKind::Video,
        });

        if let (Some(field), Some(obj)) = (self.kind.data_field(), frame.as_object_mut()) {
            obj.insert(field.to_string(), json!(self.payload));
        }
        frame
    }

    /// Encode the push frame as the bytes of one wire frame payload.
    pub fn encode_push(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_push())
    }
}
