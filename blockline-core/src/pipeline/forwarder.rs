use super::{PipelineOptions, connect};
use crate::block::{BlockId, ReplicaList};
use crate::error::{BlockError, Result};
use crate::protocol::{OpHeader, Packet, Status, read_status, write_header, write_packet};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Outcome of the downstream leg so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub result: Status,
    pub error: Option<String>,
}

enum Connection {
    Connecting(oneshot::Receiver<std::result::Result<OwnedReadHalf, String>>),
    Connected(BufReader<OwnedReadHalf>),
    Failed,
}

/// Relays an in-progress write to the next replica.
///
/// Packets are queued with [`add_packet`](Self::add_packet) and streamed by
/// a background task, so local disk writes never wait on the network hop.
/// Acknowledgements come back through
/// [`forward_confirmation`](Self::forward_confirmation), one per call.
pub struct DownstreamForwarder {
    block_id: BlockId,
    target: String,
    options: PipelineOptions,
    queue: mpsc::UnboundedSender<Packet>,
    connection: Connection,
    outcome: Arc<Mutex<ForwardOutcome>>,
    sender: JoinHandle<()>,
}

impl DownstreamForwarder {
    /// Starts connecting to the head of `downstream` and sends it
    /// `(block_id, downstream)` as a write header.
    pub fn start(
        block_id: BlockId,
        checksums: bool,
        downstream: ReplicaList,
        options: PipelineOptions,
    ) -> Self {
        let target = downstream.head().to_string();
        let header = OpHeader::Write {
            block_id,
            checksums,
            replicas: downstream,
        };

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let outcome = Arc::new(Mutex::new(ForwardOutcome {
            result: Status::Ok,
            error: None,
        }));

        let sender = tokio::spawn(run_sender(
            target.clone(),
            header,
            options,
            queue_rx,
            connected_tx,
            outcome.clone(),
        ));

        tracing::debug!("Forwarding block {} to {}", block_id, target);

        Self {
            block_id,
            target,
            options,
            queue,
            connection: Connection::Connecting(connected_rx),
            outcome,
            sender,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Queues an exact copy of `packet` for the next hop. Never blocks.
    pub async fn add_packet(&self, packet: Packet) -> Result<()> {
        if self.queue.send(packet).is_err() {
            return Err(BlockError::Downstream(self.failure_cause().await));
        }
        Ok(())
    }

    /// Waits for the next acknowledgement from downstream. A downstream
    /// `Error`, a broken connection and prolonged silence all fail.
    pub async fn forward_confirmation(&mut self) -> Result<()> {
        let ack_timeout = self.options.ack_timeout;
        let reader = self.reader().await?;

        match timeout(ack_timeout, read_status(reader)).await {
            Ok(Ok(Status::Ok)) => Ok(()),
            Ok(Ok(Status::Error)) => {
                let cause = format!("{} reported error", self.target);
                self.record_failure(cause.clone()).await;
                Err(BlockError::Downstream(cause))
            }
            Ok(Err(error)) => {
                let cause = format!("reading ack from {} failed: {}", self.target, error);
                self.record_failure(cause.clone()).await;
                Err(BlockError::Downstream(cause))
            }
            Err(_) => {
                let cause = format!(
                    "no ack from {} within {:?}",
                    self.target, ack_timeout
                );
                self.record_failure(cause.clone()).await;
                Err(BlockError::Downstream(cause))
            }
        }
    }

    /// Waits for the chain's final confirmation after the last packet was
    /// queued. Only `Ok` here means every downstream replica committed.
    pub async fn wait_for_confirmations(&mut self) -> Result<()> {
        self.forward_confirmation().await?;

        let outcome = self.last_outcome().await;
        if outcome.result != Status::Ok {
            return Err(BlockError::Downstream(
                outcome
                    .error
                    .unwrap_or_else(|| format!("{} failed", self.target)),
            ));
        }

        tracing::debug!(
            "Downstream {} confirmed block {}",
            self.target,
            self.block_id
        );
        Ok(())
    }

    pub async fn last_result(&self) -> Status {
        self.outcome.lock().await.result
    }

    pub async fn last_exception(&self) -> Option<String> {
        self.outcome.lock().await.error.clone()
    }

    pub async fn last_outcome(&self) -> ForwardOutcome {
        self.outcome.lock().await.clone()
    }

    async fn reader(&mut self) -> Result<&mut BufReader<OwnedReadHalf>> {
        let connection = std::mem::replace(&mut self.connection, Connection::Failed);
        self.connection = match connection {
            Connection::Connecting(connected) => self.await_connection(connected).await?,
            other => other,
        };

        if !matches!(self.connection, Connection::Connected(_)) {
            return Err(BlockError::Downstream(self.failure_cause().await));
        }
        match &mut self.connection {
            Connection::Connected(reader) => Ok(reader),
            _ => Err(BlockError::Downstream(format!(
                "downstream {} unavailable",
                self.target
            ))),
        }
    }

    async fn await_connection(
        &self,
        connected: oneshot::Receiver<std::result::Result<OwnedReadHalf, String>>,
    ) -> Result<Connection> {
        let wait = self.options.connect_timeout + self.options.ack_timeout;
        let cause = match timeout(wait, connected).await {
            Ok(Ok(Ok(read_half))) => return Ok(Connection::Connected(BufReader::new(read_half))),
            Ok(Ok(Err(cause))) => return Err(BlockError::Downstream(cause)),
            Ok(Err(_)) => format!("forwarder to {} stopped before connecting", self.target),
            Err(_) => format!("connecting to {} timed out", self.target),
        };
        self.record_failure(cause.clone()).await;
        Err(BlockError::Downstream(cause))
    }

    async fn record_failure(&self, cause: String) {
        record_failure(&self.outcome, cause).await;
    }

    async fn failure_cause(&self) -> String {
        self.last_exception()
            .await
            .unwrap_or_else(|| format!("downstream {} unavailable", self.target))
    }
}

impl Drop for DownstreamForwarder {
    fn drop(&mut self) {
        // Dropping the write half tells the next hop the stream ended.
        self.sender.abort();
    }
}

async fn run_sender(
    target: String,
    header: OpHeader,
    options: PipelineOptions,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    connected: oneshot::Sender<std::result::Result<OwnedReadHalf, String>>,
    outcome: Arc<Mutex<ForwardOutcome>>,
) {
    let stream = match connect(&target, options.connect_timeout).await {
        Ok(stream) => stream,
        Err(error) => {
            let cause = error.to_string();
            tracing::warn!("Downstream {} unreachable: {}", target, cause);
            record_failure(&outcome, cause.clone()).await;
            let _ = connected.send(Err(cause));
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    if let Err(error) = write_header(&mut write_half, &header).await {
        let cause = format!("sending header to {} failed: {}", target, error);
        record_failure(&outcome, cause.clone()).await;
        let _ = connected.send(Err(cause));
        return;
    }

    if connected.send(Ok(read_half)).is_err() {
        return;
    }

    while let Some(packet) = queue.recv().await {
        let last = packet.last;
        if let Err(error) = write_packet(&mut write_half, &packet).await {
            let cause = format!("sending packet to {} failed: {}", target, error);
            tracing::warn!("{}", cause);
            record_failure(&outcome, cause).await;
            return;
        }
        if last {
            break;
        }
    }
}

async fn record_failure(outcome: &Mutex<ForwardOutcome>, cause: String) {
    let mut outcome = outcome.lock().await;
    outcome.result = Status::Error;
    if outcome.error.is_none() {
        outcome.error = Some(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_header, read_packet, write_status};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn options() -> PipelineOptions {
        PipelineOptions {
            ack_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn relays_acks_from_next_hop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let block_id = BlockId::generate();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let header = read_header(&mut reader).await.unwrap();
            write_status(&mut write_half, Status::Ok).await.unwrap();

            let mut payloads = Vec::new();
            loop {
                let packet = read_packet(&mut reader, true).await.unwrap();
                payloads.push(packet.payload.clone());
                write_status(&mut write_half, Status::Ok).await.unwrap();
                if packet.last {
                    break;
                }
            }
            (header, payloads)
        });

        let downstream = ReplicaList::new(vec![address]).unwrap();
        let mut forwarder = DownstreamForwarder::start(block_id, true, downstream, options());
        forwarder.forward_confirmation().await.unwrap();

        forwarder
            .add_packet(Packet::new(Bytes::from_static(b"one"), false, true))
            .await
            .unwrap();
        forwarder.forward_confirmation().await.unwrap();
        forwarder
            .add_packet(Packet::new(Bytes::from_static(b"two"), true, true))
            .await
            .unwrap();
        forwarder.wait_for_confirmations().await.unwrap();
        assert_eq!(forwarder.last_result().await, Status::Ok);

        let (header, payloads) = peer.await.unwrap();
        assert_eq!(header.block_id(), block_id);
        assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn unreachable_next_hop_sets_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let downstream = ReplicaList::new(vec![address]).unwrap();
        let mut forwarder =
            DownstreamForwarder::start(BlockId::generate(), true, downstream, options());

        let err = forwarder.forward_confirmation().await.unwrap_err();
        assert!(matches!(err, BlockError::Downstream(_)));
        assert_eq!(forwarder.last_result().await, Status::Error);
        assert!(forwarder.last_exception().await.is_some());
    }

    #[tokio::test]
    async fn silent_next_hop_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let downstream = ReplicaList::new(vec![address]).unwrap();
        let mut forwarder =
            DownstreamForwarder::start(BlockId::generate(), false, downstream, options());

        let err = forwarder.forward_confirmation().await.unwrap_err();
        assert!(err.to_string().contains("no ack"));
        assert_eq!(forwarder.last_result().await, Status::Error);
        peer.abort();
    }
}
