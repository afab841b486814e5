use std::{
    io::Read,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
        LazyLock,
    },
};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::header::Header;
use crate::{
    conn::stream_description::DEFAULT_MAX_MESSAGE_SIZE_BYTES,
    error::{Error, ErrorKind, Result},
};

static GLOBAL_REQUEST_IDS: LazyLock<Arc<RequestIdGenerator>> =
    LazyLock::new(|| Arc::new(RequestIdGenerator::new()));

/// Hands out request ids for outgoing messages. Ids increase monotonically for the lifetime of
/// the generator.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    /// Creates a generator whose first id is 0.
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a generator whose first id is `first`.
    pub const fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first),
        }
    }

    /// The generator shared by the whole process.
    pub fn global() -> Arc<RequestIdGenerator> {
        GLOBAL_REQUEST_IDS.clone()
    }

    /// Obtains a new, unique request id.
    pub fn next_id(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Reads a complete framed message (header included) from `reader`.
pub async fn read_frame<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    max_message_size_bytes: Option<i32>,
) -> Result<Vec<u8>> {
    let length = reader.read_i32_le().await?;
    let mut frame = start_frame(length, max_message_size_bytes)?;
    reader.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

/// Reads a complete framed message (header included) from a blocking `reader`.
///
/// `cancellation` is checked before the read starts and again once the length prefix has
/// arrived. A read that is already blocked waiting for bytes is not interrupted.
pub fn read_frame_sync<R: Read>(
    reader: &mut R,
    max_message_size_bytes: Option<i32>,
    cancellation: &CancellationToken,
) -> Result<Vec<u8>> {
    if cancellation.is_cancelled() {
        return Err(Error::cancelled());
    }
    let length = reader.read_i32_sync()?;
    if cancellation.is_cancelled() {
        return Err(Error::cancelled());
    }
    let mut frame = start_frame(length, max_message_size_bytes)?;
    reader.read_exact(&mut frame[4..])?;
    Ok(frame)
}

fn start_frame(length: i32, max_message_size_bytes: Option<i32>) -> Result<Vec<u8>> {
    let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
    if length > max_len {
        return Err(ErrorKind::InvalidResponse {
            message: format!("Message length {} over maximum {}", length, max_len),
        }
        .into());
    }
    if length < Header::LENGTH as i32 {
        return Err(ErrorKind::InvalidResponse {
            message: format!("Message length {} is shorter than a header", length),
        }
        .into());
    }

    let mut frame = vec![0u8; length as usize];
    frame[..4].copy_from_slice(&length.to_le_bytes());
    Ok(frame)
}

/// Little-endian reads over blocking readers.
pub(crate) trait SyncLittleEndianRead: Read {
    /// Read an `i32` in little-endian order.
    fn read_i32_sync(&mut self) -> Result<i32> {
        let mut buf: [u8; 4] = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a `u32` in little-endian order.
    fn read_u32_sync(&mut self) -> Result<u32> {
        let mut buf: [u8; 4] = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read an `i64` in little-endian order.
    fn read_i64_sync(&mut self) -> Result<i64> {
        let mut buf: [u8; 8] = [0; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_u8_sync(&mut self) -> Result<u8> {
        let mut buf: [u8; 1] = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a null-terminated UTF-8 string. Returns the string and the number of bytes consumed.
    fn read_cstring_sync(&mut self) -> Result<(String, usize)> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8_sync()? {
                0 => break,
                byte => bytes.push(byte),
            }
        }
        let consumed = bytes.len() + 1;
        let string = String::from_utf8(bytes).map_err(|e| ErrorKind::InvalidResponse {
            message: format!("invalid cstring in message: {}", e),
        })?;
        Ok((string, consumed))
    }
}

impl<R: Read> SyncLittleEndianRead for R {}

pub(crate) struct SyncCountReader<R> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> SyncCountReader<R> {
    /// Constructs a new CountReader that wraps `reader`.
    pub(crate) fn new(reader: R) -> Self {
        SyncCountReader {
            reader,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(crate) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<R: Read> Read for SyncCountReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.reader.read(buf)?;
        self.bytes_read += bytes;
        Ok(bytes)
    }
}
