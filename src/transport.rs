//! Length-prefixed framing over byte streams.
//!
//! Each frame is a 4-byte little-endian body length followed by the body.
//! Bytes may arrive split or coalesced arbitrarily; [`FrameBuffer`]
//! reassembles them and yields whole frames in order.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::messages::{self, MessageError};

pub const HEADER_LENGTH: usize = 4;

/// Largest frame body accepted by default (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reassembly buffer for incoming frames.
///
/// Grows by doubling when a chunk does not fit and compacts the unread tail
/// to the front after every extracted frame.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    filled: usize,
    max_message_size: usize,
}

impl FrameBuffer {
    pub fn new(max_message_size: usize) -> Self {
        let initial = INITIAL_BUFFER_SIZE.min(max_message_size.saturating_add(HEADER_LENGTH));
        Self {
            buffer: vec![0; initial.max(HEADER_LENGTH)],
            filled: 0,
            max_message_size,
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        let required = self.filled + chunk.len();
        if required > self.buffer.len() {
            let mut capacity = self.buffer.len().max(HEADER_LENGTH);
            while capacity < required {
                capacity *= 2;
            }
            self.buffer.resize(capacity, 0);
        }
        self.buffer[self.filled..required].copy_from_slice(chunk);
        self.filled = required;
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MessageError> {
        if self.filled < HEADER_LENGTH {
            return Ok(None);
        }
        let header = [
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ];
        let length = u32::from_le_bytes(header) as usize;
        if length > self.max_message_size {
            return Err(MessageError::FrameTooLarge {
                length,
                limit: self.max_message_size,
            });
        }

        let total = HEADER_LENGTH + length;
        if self.filled < total {
            return Ok(None);
        }

        let frame = self.buffer[HEADER_LENGTH..total].to_vec();
        self.buffer.copy_within(total..self.filled, 0);
        self.filled -= total;
        Ok(Some(frame))
    }
}

/// Prefix `body` with its length header as one contiguous buffer.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, MessageError> {
    let length = u32::try_from(body.len()).map_err(|_| MessageError::FrameTooLarge {
        length: body.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(HEADER_LENGTH + body.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Peer disconnects that end a stream quietly instead of surfacing an error.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Reads framed messages from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: FrameBuffer,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::new(max_message_size),
            chunk: vec![0; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Next frame body, or `None` once the peer closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MessageError> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }
            let read = match self.inner.read(&mut self.chunk).await {
                Ok(read) => read,
                Err(err) if is_disconnect(&err) => 0,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        buffered = self.buffer.len(),
                        "stream closed with a partial frame buffered"
                    );
                }
                return Ok(None);
            }
            self.buffer.extend(&self.chunk[..read]);
        }
    }

    pub async fn next_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, MessageError> {
        match self.next_frame().await? {
            Some(frame) => messages::decode_message(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes framed messages to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one message. Writes to a peer that already went away
    /// are dropped silently.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), MessageError> {
        let frame = encode_frame(&messages::encode_message(message)?)?;
        match self.write_frame(&frame).await {
            Err(MessageError::Io(err)) if is_disconnect(&err) => {
                debug!(?err, "dropping frame for disconnected peer");
                Ok(())
            }
            other => other,
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), MessageError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
