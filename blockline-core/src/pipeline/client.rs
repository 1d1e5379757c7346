use super::{PipelineOptions, connect};
use crate::block::{BlockId, ReplicaList};
use crate::error::{BlockError, Result};
use crate::protocol::{
    MAX_PACKET_PAYLOAD, OpHeader, Packet, ReadPreamble, Status, read_packet, read_status,
    write_header, write_packet,
};
use bytes::{Bytes, BytesMut};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

/// Client end of a write pipeline: streams packets to the chain head and
/// counts its acknowledgements.
pub struct BlockWriter {
    block_id: BlockId,
    head: String,
    checksums: bool,
    options: PipelineOptions,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    packets_sent: u64,
    finished: bool,
}

impl BlockWriter {
    /// Connects to the head of `replicas` and waits for the chain to accept
    /// the header.
    pub async fn connect(
        block_id: BlockId,
        replicas: ReplicaList,
        checksums: bool,
        options: PipelineOptions,
    ) -> Result<Self> {
        let head = replicas.head().to_string();
        let stream = connect(&head, options.connect_timeout).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_header(
            &mut write_half,
            &OpHeader::Write {
                block_id,
                checksums,
                replicas,
            },
        )
        .await?;

        let mut writer = Self {
            block_id,
            head,
            checksums,
            options,
            reader: BufReader::new(read_half),
            writer: write_half,
            packets_sent: 0,
            finished: false,
        };
        writer.expect_ok("header").await?;
        Ok(writer)
    }

    pub fn checksums(&self) -> bool {
        self.checksums
    }

    /// Sends one packet. Non-final packets wait for their ack; the final
    /// packet waits for the whole chain to commit.
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        if self.finished {
            return Err(BlockError::Internal(format!(
                "block {} already finished",
                self.block_id
            )));
        }
        if packet.checksum.is_some() != self.checksums {
            return Err(BlockError::Internal(
                "packet checksum presence does not match the transfer".to_string(),
            ));
        }

        let last = packet.last;
        write_packet(&mut self.writer, &packet).await?;
        self.packets_sent += 1;

        if last {
            self.finished = true;
            self.expect_ok("final confirmation").await
        } else {
            self.expect_ok("packet ack").await
        }
    }

    pub async fn send_payload(&mut self, payload: Bytes, last: bool) -> Result<()> {
        self.send(Packet::new(payload, last, self.checksums)).await
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    async fn expect_ok(&mut self, what: &str) -> Result<()> {
        let status = timeout(self.options.ack_timeout, read_status(&mut self.reader))
            .await
            .map_err(|_| {
                BlockError::Downstream(format!(
                    "no {} from {} within {:?}",
                    what, self.head, self.options.ack_timeout
                ))
            })?
            .map_err(|error| {
                BlockError::Downstream(format!("reading {} from {}: {}", what, self.head, error))
            })?;

        match status {
            Status::Ok => Ok(()),
            Status::Error => Err(BlockError::Downstream(format!(
                "pipeline for block {} via {} reported error on {}",
                self.block_id, self.head, what
            ))),
        }
    }
}

/// Writes `body` as block `block_id` through `replicas`, splitting it into
/// maximum-size packets.
pub async fn write_block(
    block_id: BlockId,
    replicas: ReplicaList,
    body: Bytes,
    checksums: bool,
    options: PipelineOptions,
) -> Result<()> {
    let mut writer = BlockWriter::connect(block_id, replicas, checksums, options).await?;

    if body.is_empty() {
        return writer.send_payload(Bytes::new(), true).await;
    }

    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + MAX_PACKET_PAYLOAD).min(body.len());
        writer
            .send_payload(body.slice(offset..end), end == body.len())
            .await?;
        offset = end;
    }
    Ok(())
}

/// Reads `[offset, offset + length)` of a block from `address`; `None`
/// reads to the end.
pub async fn read_block(
    address: &str,
    block_id: BlockId,
    offset: u64,
    length: Option<u64>,
    options: PipelineOptions,
) -> Result<Bytes> {
    let stream = connect(address, options.connect_timeout).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_header(
        &mut write_half,
        &OpHeader::Read {
            block_id,
            offset,
            length,
        },
    )
    .await?;

    let status = timeout(options.ack_timeout, read_status(&mut reader))
        .await
        .map_err(|_| BlockError::Downstream(format!("no reply from {}", address)))??;
    if status != Status::Ok {
        return Err(BlockError::Downstream(format!(
            "read of block {} [{}+{:?}] rejected by {}",
            block_id, offset, length, address
        )));
    }

    let preamble = ReadPreamble::read(&mut reader).await?;
    if preamble.first_offset > offset {
        return Err(BlockError::protocol(format!(
            "first packet offset {} is past requested offset {}",
            preamble.first_offset, offset
        )));
    }

    let mut body = BytesMut::new();
    loop {
        let packet = timeout(
            options.ack_timeout,
            read_packet(&mut reader, preamble.checksums),
        )
        .await
        .map_err(|_| BlockError::Downstream(format!("read from {} stalled", address)))??;
        body.extend_from_slice(&packet.payload);
        if packet.last {
            break;
        }
    }

    let skip = (offset - preamble.first_offset) as usize;
    if skip > body.len() {
        return Err(BlockError::protocol("read stream shorter than requested offset"));
    }
    let mut body = body.freeze().slice(skip..);
    if let Some(length) = length {
        let length = length as usize;
        if length > body.len() {
            return Err(BlockError::protocol(format!(
                "read stream returned {} bytes, wanted {}",
                body.len(),
                length
            )));
        }
        body.truncate(length);
    }
    Ok(body)
}
