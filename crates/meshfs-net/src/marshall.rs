//! Length-prefixed message framing.
//!
//! A frame is a little-endian `u16` length followed by that many payload
//! bytes. The payload is a tag byte plus body, AES-GCM sealed once the
//! session cipher is installed. Every read and write races the connection's
//! cancellation token, so a shutdown unblocks tasks parked on the socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use meshfs_crypto::DirectionalCipher;

use crate::error::{NetError, Result};
use crate::messages::Message;

/// Hard ceiling imposed by the 2-byte length prefix.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

fn map_eof(e: std::io::Error) -> NetError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetError::Disconnected
    } else {
        NetError::Io(e)
    }
}

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
    cipher: Option<DirectionalCipher>,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream. `max_frame` is clamped to [`MAX_FRAME_LEN`].
    pub fn new(inner: R, max_frame: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            max_frame: max_frame.min(MAX_FRAME_LEN),
            cipher: None,
            cancel,
        }
    }

    /// Decrypt every following frame with `cipher`.
    pub fn set_cipher(&mut self, cipher: DirectionalCipher) {
        self.cipher = Some(cipher);
    }

    /// Whether frames are decrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Read one message.
    pub async fn read(&mut self) -> Result<Message> {
        let payload = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(NetError::Cancelled),
            frame = read_frame(&mut self.inner, self.max_frame) => frame?,
        };
        match self.cipher.as_mut() {
            Some(cipher) => Message::decode(&cipher.open(&payload)?),
            None => Message::decode(&payload),
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(inner: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    inner.read_exact(&mut header).await.map_err(map_eof)?;
    let len = u16::from_le_bytes(header) as usize;
    if len == 0 {
        return Err(NetError::EmptyFrame);
    }
    if len > max {
        return Err(NetError::FrameTooLarge { len, max });
    }

    let mut payload = vec![0u8; len];
    inner.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok(payload)
}

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
    max_frame: usize,
    cipher: Option<DirectionalCipher>,
    cancel: CancellationToken,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a byte stream. `max_frame` is clamped to [`MAX_FRAME_LEN`].
    pub fn new(inner: W, max_frame: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            max_frame: max_frame.min(MAX_FRAME_LEN),
            cipher: None,
            cancel,
        }
    }

    /// Encrypt every following frame with `cipher`.
    pub fn set_cipher(&mut self, cipher: DirectionalCipher) {
        self.cipher = Some(cipher);
    }

    /// Largest message body that still fits one frame.
    pub fn max_payload(&self) -> usize {
        match self.cipher {
            Some(_) => self.max_frame.saturating_sub(meshfs_crypto::TAG_LEN),
            None => self.max_frame,
        }
    }

    /// Write one message and flush it.
    ///
    /// An oversized message is rejected before anything touches the socket.
    pub async fn write(&mut self, message: &Message) -> Result<()> {
        let plain = message.encode()?;
        if plain.len() > self.max_payload() {
            return Err(NetError::FrameTooLarge {
                len: plain.len(),
                max: self.max_payload(),
            });
        }
        let payload = match self.cipher.as_mut() {
            Some(cipher) => cipher.seal(&plain)?,
            None => plain,
        };

        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            res = write_frame(&mut self.inner, &frame) => res,
        }
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(NetError::Io)
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(inner: &mut W, frame: &[u8]) -> Result<()> {
    inner.write_all(frame).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::WriteZero => NetError::Disconnected,
        _ => NetError::Io(e),
    })?;
    inner.flush().await.map_err(NetError::Io)
}

/// Split a duplex stream into framed halves sharing one cancellation token.
pub fn framed<S>(
    stream: S,
    max_frame: usize,
    cancel: CancellationToken,
) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader::new(read, max_frame, cancel.clone()),
        FrameWriter::new(write, max_frame, cancel),
    )
}
