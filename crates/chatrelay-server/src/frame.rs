//! Length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Any error at this layer is fatal for the connection.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::codec::{
    FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError,
};

/// Default ceiling on a single frame payload (100 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed the stream cleanly between frames.
    #[error("connection closed")]
    Closed,

    #[error("frame exceeds {max} byte limit")]
    Oversized { max: usize },

    /// No bytes arrived within an [`IdleRead`] timeout.
    #[error("connection idle")]
    Idle,

    /// Includes a stream that ends partway through a frame.
    #[error("transport error: {0}")]
    Io(io::Error),
}

impl FrameError {
    fn from_io(e: io::Error, max: usize) -> Self {
        let inner = e.get_ref();
        if inner.is_some_and(|i| i.is::<LengthDelimitedCodecError>()) {
            return FrameError::Oversized { max };
        }
        if inner.is_some_and(|i| i.is::<IdleElapsed>()) {
            return FrameError::Idle;
        }
        FrameError::Io(e)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no traffic for {0:?}")]
struct IdleElapsed(Duration);

/// A reader that fails once no bytes have arrived for `timeout`.
///
/// The clock restarts on every read that yields data and on [`rearm`], so a
/// peer trickling a large frame never trips it while it keeps sending.
///
/// [`rearm`]: IdleRead::rearm
pub struct IdleRead<R> {
    inner: R,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<R> IdleRead<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    /// Restart the idle clock from now.
    pub fn rearm(&mut self) {
        // An unrepresentable deadline keeps the far-future one from `sleep`.
        if let Some(at) = Instant::now().checked_add(self.timeout) {
            self.deadline.as_mut().reset(at);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IdleRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.rearm();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    IdleElapsed(this.timeout),
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Codec for the relay wire format with the given payload ceiling.
pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_LEN)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec()
}

pub fn reader<R: AsyncRead>(io: R, max_frame_len: usize) -> FrameReader<R> {
    FramedRead::new(io, codec(max_frame_len))
}

pub fn writer<W: AsyncWrite>(io: W, max_frame_len: usize) -> FrameWriter<W> {
    FramedWrite::new(io, codec(max_frame_len))
}

/// Read one complete frame payload.
///
/// A declared length above the ceiling fails as soon as the prefix is read;
/// the payload is never buffered.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<BytesMut, FrameError> {
    let max = reader.decoder().max_frame_length();
    match reader.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(FrameError::from_io(e, max)),
        None => Err(FrameError::Closed),
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    payload: Bytes,
) -> Result<(), FrameError> {
    let max = writer.encoder().max_frame_length();
    writer
        .send(payload)
        .await
        .map_err(|e| FrameError::from_io(e, max))
}
