//! Block transfer wire protocol.
//!
//! A connection starts with one [`OpHeader`], decoded once at the boundary
//! into a tagged union. Data then flows as [`Packet`] frames and result codes
//! ([`Status`]) flow back.

pub mod packet;

pub use packet::{
    MAX_PACKET_PAYLOAD, Packet, checksum, read_packet, verify_checksum, write_packet,
};

use crate::block::{BlockId, ReplicaList};
use crate::error::{BlockError, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_REPLICAS: usize = 16;
const MAX_ADDRESS_LEN: usize = 255;

const OP_WRITE: u8 = 1;
const OP_READ: u8 = 2;

/// Single-byte result code sent back to the peer. Detailed causes stay in
/// the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    fn to_byte(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            other => Err(BlockError::protocol(format!(
                "unknown result code {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpHeader {
    Write {
        block_id: BlockId,
        checksums: bool,
        replicas: ReplicaList,
    },
    Read {
        block_id: BlockId,
        offset: u64,
        /// `None` reads to the end of the block.
        length: Option<u64>,
    },
}

impl OpHeader {
    pub fn block_id(&self) -> BlockId {
        match self {
            OpHeader::Write { block_id, .. } | OpHeader::Read { block_id, .. } => *block_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(PROTOCOL_VERSION);
        match self {
            OpHeader::Write {
                block_id,
                checksums,
                replicas,
            } => {
                if replicas.len() > MAX_REPLICAS {
                    return Err(BlockError::protocol(format!(
                        "replica list of {} exceeds maximum {}",
                        replicas.len(),
                        MAX_REPLICAS
                    )));
                }
                buf.put_u8(OP_WRITE);
                buf.put_slice(&block_id.to_bytes());
                buf.put_u8(u8::from(*checksums));
                buf.put_u16(replicas.len() as u16);
                for address in replicas.addresses() {
                    if address.len() > MAX_ADDRESS_LEN {
                        return Err(BlockError::protocol(format!(
                            "replica address too long: {}",
                            address
                        )));
                    }
                    buf.put_u16(address.len() as u16);
                    buf.put_slice(address.as_bytes());
                }
            }
            OpHeader::Read {
                block_id,
                offset,
                length,
            } => {
                buf.put_u8(OP_READ);
                buf.put_slice(&block_id.to_bytes());
                buf.put_u64(*offset);
                let length = match length {
                    Some(length) => i64::try_from(*length)
                        .map_err(|_| BlockError::protocol("read length overflows i64"))?,
                    None => -1,
                };
                buf.put_i64(length);
            }
        }
        Ok(())
    }
}

pub async fn read_header<R>(reader: &mut R) -> Result<OpHeader>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u16().await.map_err(eof_as_protocol)?;
    if version != PROTOCOL_VERSION {
        return Err(BlockError::protocol(format!(
            "unsupported protocol version {}",
            version
        )));
    }

    let op = reader.read_u8().await.map_err(eof_as_protocol)?;
    let mut id = [0u8; BlockId::LEN];
    reader.read_exact(&mut id).await.map_err(eof_as_protocol)?;
    let block_id = BlockId::from_bytes(id);

    match op {
        OP_WRITE => {
            let checksums = match reader.read_u8().await.map_err(eof_as_protocol)? {
                0 => false,
                1 => true,
                other => {
                    return Err(BlockError::protocol(format!(
                        "invalid checksum flag {}",
                        other
                    )));
                }
            };
            let count = reader.read_u16().await.map_err(eof_as_protocol)? as usize;
            if count == 0 || count > MAX_REPLICAS {
                return Err(BlockError::protocol(format!(
                    "invalid replica count {}",
                    count
                )));
            }

            let mut addresses = Vec::with_capacity(count);
            for _ in 0..count {
                let len = reader.read_u16().await.map_err(eof_as_protocol)? as usize;
                if len == 0 || len > MAX_ADDRESS_LEN {
                    return Err(BlockError::protocol(format!(
                        "invalid replica address length {}",
                        len
                    )));
                }
                let mut raw = vec![0u8; len];
                reader.read_exact(&mut raw).await.map_err(eof_as_protocol)?;
                let address = String::from_utf8(raw)
                    .map_err(|_| BlockError::protocol("replica address is not utf-8"))?;
                addresses.push(address);
            }

            Ok(OpHeader::Write {
                block_id,
                checksums,
                replicas: ReplicaList::new(addresses)?,
            })
        }
        OP_READ => {
            let offset = reader.read_u64().await.map_err(eof_as_protocol)?;
            let length = match reader.read_i64().await.map_err(eof_as_protocol)? {
                -1 => None,
                value if value < 0 => {
                    return Err(BlockError::protocol(format!(
                        "invalid read length {}",
                        value
                    )));
                }
                value => Some(value as u64),
            };
            Ok(OpHeader::Read {
                block_id,
                offset,
                length,
            })
        }
        other => Err(BlockError::protocol(format!("unknown op {}", other))),
    }
}

pub async fn write_header<W>(writer: &mut W, header: &OpHeader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    header.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn read_status<R>(reader: &mut R) -> Result<Status>
where
    R: AsyncRead + Unpin,
{
    let byte = reader.read_u8().await.map_err(eof_as_protocol)?;
    Status::from_byte(byte)
}

pub async fn write_status<W>(writer: &mut W, status: Status) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(status.to_byte()).await?;
    writer.flush().await?;
    Ok(())
}

/// Sent by the read handler after an `Ok` status, ahead of the packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPreamble {
    pub checksums: bool,
    /// Logical block offset of the first packet's first byte.
    pub first_offset: u64,
}

impl ReadPreamble {
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(u8::from(self.checksums));
        buf.put_u64(self.first_offset);
        writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let checksums = reader.read_u8().await.map_err(eof_as_protocol)? != 0;
        let first_offset = reader.read_u64().await.map_err(eof_as_protocol)?;
        Ok(Self {
            checksums,
            first_offset,
        })
    }
}

fn eof_as_protocol(error: std::io::Error) -> BlockError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        BlockError::protocol("connection closed mid-header")
    } else {
        BlockError::Io(error)
    }
}
