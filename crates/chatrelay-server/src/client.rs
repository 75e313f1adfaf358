//! A minimal protocol client.
//!
//! Direct responses and pushed `action: "message"` frames share one stream;
//! `request` sets pushes aside so callers can collect them with
//! `next_push`.

use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use chatrelay_core::UserId;

use crate::frame::{self, FrameError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
use crate::rpc::Response;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a pushed message, got: {0}")]
    UnexpectedFrame(Value),
}

pub struct RelayClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    pushes: VecDeque<Value>,
}

fn is_push(frame: &Value) -> bool {
    frame.get("action").and_then(Value::as_str) == Some("message")
}

impl RelayClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: frame::reader(read_half, DEFAULT_MAX_FRAME_LEN),
            writer: frame::writer(write_half, DEFAULT_MAX_FRAME_LEN),
            pushes: VecDeque::new(),
        })
    }

    /// Write one frame as-is.
    pub async fn send_raw(&mut self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        frame::write_frame(&mut self.writer, payload.into()).await?;
        Ok(())
    }

    /// Read the next frame of any kind.
    pub async fn read_value(&mut self) -> Result<Value, ClientError> {
        let payload = frame::read_frame(&mut self.reader).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Send a request and wait for its direct response, buffering any pushed
    /// messages that arrive first.
    pub async fn request(&mut self, body: Value) -> Result<Response, ClientError> {
        self.send_raw(serde_json::to_vec(&body)?).await?;
        loop {
            let frame = self.read_value().await?;
            if is_push(&frame) {
                self.pushes.push_back(frame);
                continue;
            }
            return Ok(serde_json::from_value(frame)?);
        }
    }

    /// Next pushed message, buffered or read from the stream.
    pub async fn next_push(&mut self) -> Result<Value, ClientError> {
        if let Some(frame) = self.pushes.pop_front() {
            return Ok(frame);
        }
        let frame = self.read_value().await?;
        if is_push(&frame) {
            Ok(frame)
        } else {
            Err(ClientError::UnexpectedFrame(frame))
        }
    }

    /// Pushed messages received so far and not yet taken.
    pub fn buffered_pushes(&self) -> usize {
        self.pushes.len()
    }

    pub async fn register(
        &mut self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> Result<Response, ClientError> {
        self.request(json!({
            "action": "register",
            "display_name": display_name,
            "email": email,
            "password": password,
        }))
        .await
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<Response, ClientError> {
        self.request(json!({"action": "login", "email": email, "password": password}))
            .await
    }

    pub async fn resume(&mut self, user_id: UserId) -> Result<Response, ClientError> {
        self.request(json!({"action": "resume_session", "user_id": user_id}))
            .await
    }

    pub async fn send_text(
        &mut self,
        receiver_id: UserId,
        message: &str,
    ) -> Result<Response, ClientError> {
        self.request(json!({
            "action": "message",
            "receiver_id": receiver_id,
            "message": message,
        }))
        .await
    }
}
