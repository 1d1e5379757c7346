use crate::error::{BlockError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload one packet may carry. Bounds per-packet memory on every
/// hop and is the chunk size of the on-disk block layout.
pub const MAX_PACKET_PAYLOAD: usize = 64 * 1024;

const LEN_FIELD: usize = 4;
const CHECKSUM_FIELD: usize = 4;
const LAST_FIELD: usize = 1;

/// One framed unit of block data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Bytes,
    pub checksum: Option<u32>,
    pub last: bool,
}

impl Packet {
    pub fn new(payload: Bytes, last: bool, checksums: bool) -> Self {
        let checksum = checksums.then(|| checksum(&payload));
        Self {
            payload,
            checksum,
            last,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn verify(&self) -> Result<()> {
        match self.checksum {
            Some(expected) => verify_checksum(&self.payload, expected),
            None => Ok(()),
        }
    }

    pub fn encoded_len(&self) -> usize {
        LEN_FIELD
            + self.payload.len()
            + self.checksum.map_or(0, |_| CHECKSUM_FIELD)
            + LAST_FIELD
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_i32(self.payload.len() as i32);
        buf.put_slice(&self.payload);
        if let Some(checksum) = self.checksum {
            buf.put_u32(checksum);
        }
        buf.put_u8(u8::from(self.last));
    }

    /// Decodes one packet from the front of `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes, checksums: bool) -> Result<Self> {
        if buf.remaining() < LEN_FIELD {
            return Err(BlockError::protocol("truncated packet length"));
        }
        let len = check_payload_len(buf.get_i32())?;

        let trailer = if checksums { CHECKSUM_FIELD } else { 0 } + LAST_FIELD;
        if buf.remaining() < len + trailer {
            return Err(BlockError::protocol(format!(
                "truncated packet: need {} bytes, have {}",
                len + trailer,
                buf.remaining()
            )));
        }

        let payload = buf.split_to(len);
        let checksum = checksums.then(|| buf.get_u32());
        let last = decode_last(buf.get_u8())?;

        let packet = Self {
            payload,
            checksum,
            last,
        };
        packet.verify()?;
        Ok(packet)
    }
}

/// Reads one packet off a stream.
///
/// The declared length is validated before any payload byte is consumed, so
/// an oversized packet never reaches the block file.
pub async fn read_packet<R>(reader: &mut R, checksums: bool) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = check_payload_len(reader.read_i32().await.map_err(truncated)?)?;

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    let checksum = if checksums {
        Some(reader.read_u32().await.map_err(truncated)?)
    } else {
        None
    };
    let last = decode_last(reader.read_u8().await.map_err(truncated)?)?;

    let packet = Packet {
        payload: payload.freeze(),
        checksum,
        last,
    };
    packet.verify()?;
    Ok(packet)
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    packet.encode(&mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn verify_checksum(data: &[u8], expected: u32) -> Result<()> {
    let actual = checksum(data);
    if actual != expected {
        return Err(BlockError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

fn check_payload_len(len: i32) -> Result<usize> {
    if len < 0 {
        return Err(BlockError::protocol(format!(
            "negative packet length {}",
            len
        )));
    }
    let len = len as usize;
    if len > MAX_PACKET_PAYLOAD {
        return Err(BlockError::protocol(format!(
            "packet payload {} exceeds maximum {}",
            len, MAX_PACKET_PAYLOAD
        )));
    }
    Ok(len)
}

fn decode_last(marker: u8) -> Result<bool> {
    match marker {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(BlockError::protocol(format!(
            "invalid end marker {}",
            other
        ))),
    }
}

// A stream that ends mid-packet is a framing fault, not a local IO failure.
fn truncated(error: std::io::Error) -> BlockError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        BlockError::protocol("truncated packet")
    } else {
        BlockError::Io(error)
    }
}
