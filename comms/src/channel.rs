//! Length prefixed framing over any async byte stream.
//!
//! Every frame is a big endian `LenType` with the body's length followed by the body itself.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Align4, Deserialize, Serialize};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let receiver = OnoReceiver {
        rx,
        frame_limit: usize::MAX,
    };

    let sender = OnoSender {
        tx,
        buf: Vec::new(),
    };

    (receiver, sender)
}

/// The sending end handle of the communication.
pub struct OnoSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Sends `msg` as a single frame.
    ///
    /// The serialized head is staged in an internal buffer next to the length prefix, the
    /// zero-copy tail is written straight from `msg`.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, buf } = self;

        buf.clear();
        buf.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(buf).unwrap_or_default();
        let body_len = buf.len() - LEN_TYPE_SIZE + tail.len();
        buf[..LEN_TYPE_SIZE].copy_from_slice(&(body_len as LenType).to_be_bytes());

        tx.write_all(buf).await?;
        tx.write_all(tail).await?;
        tx.flush().await
    }
}

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    frame_limit: usize,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Rejects frames whose body is longer than `limit` bytes.
    ///
    /// A rejected frame is skipped whole so the stream stays aligned on frame boundaries.
    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = limit;
        self
    }

    /// Waits for the next frame and deserializes it.
    ///
    /// # Arguments
    /// * `buf` - The buffer the frame is read into, the returned `T` borrows from it. Its
    ///           element type guarantees the alignment needed for zero-copy numeric arrays.
    ///
    /// # Returns
    /// The message, an `InvalidData` error if the frame was skipped or malformed, or any other
    /// io error if the stream failed.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut len_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_buf).await?;
        let len = LenType::from_be_bytes(len_buf);

        let len = match usize::try_from(len) {
            Ok(len) if len <= self.frame_limit => len,
            _ => return self.skip_frame(len).await,
        };

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let body = &mut bytes[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }

    /// Discards the body of an oversized frame.
    async fn skip_frame<T>(&mut self, len: LenType) -> io::Result<T> {
        let skipped = tokio::io::copy(&mut (&mut self.rx).take(len), &mut tokio::io::sink()).await?;

        if skipped < len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Skipped a frame of {len} bytes, the limit is {} bytes",
                self.frame_limit
            ),
        ))
    }
}
