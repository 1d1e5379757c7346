use async_trait::async_trait;
use blockline_core::protocol::{
    checksum, read_header, read_packet, read_status, write_header, write_packet, write_status,
};
use blockline_core::{
    BlockError, BlockId, BlockInfo, BlockStore, BlockWriter, Command, CoordinatorClient, DataNode,
    HeartbeatClient, HeartbeatEnvelope, HeartbeatOptions, OpHeader, Packet, PipelineOptions,
    ReplicaList, ReplicationCommand, ReplicationQueue, ReplicationWorker, Result, Status,
    read_block, write_block,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct TestNode {
    _dir: tempfile::TempDir,
    store: Arc<BlockStore>,
    address: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl TestNode {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path().to_path_buf(), true).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let node = Arc::new(DataNode::new(
            store.clone(),
            address.clone(),
            options(),
            16,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(node.serve(listener, shutdown_rx));
        Self {
            _dir: dir,
            store,
            address,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

#[derive(Default)]
struct RecordingCoordinator {
    rounds: Mutex<Vec<Vec<HeartbeatEnvelope>>>,
}

impl RecordingCoordinator {
    fn saw(&self, envelope: &HeartbeatEnvelope) -> bool {
        self.rounds
            .lock()
            .unwrap()
            .iter()
            .any(|round| round.contains(envelope))
    }

    fn committed_reports(&self) -> Vec<BlockId> {
        let rounds = self.rounds.lock().unwrap();
        let mut ids = Vec::new();
        for envelope in rounds.iter().flatten() {
            match envelope {
                HeartbeatEnvelope::NewBlock { block } => ids.push(block.block_id),
                HeartbeatEnvelope::BlockReport { blocks, .. } => {
                    ids.extend(blocks.iter().map(|block| block.block_id))
                }
                _ => {}
            }
        }
        ids
    }
}

#[async_trait]
impl CoordinatorClient for RecordingCoordinator {
    async fn heartbeat(
        &self,
        _node_address: &str,
        envelopes: &[HeartbeatEnvelope],
    ) -> Result<Vec<Command>> {
        self.rounds.lock().unwrap().push(envelopes.to_vec());
        Ok(Vec::new())
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        ack_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
    }
}

fn replicas<S: AsRef<str>>(nodes: &[S]) -> ReplicaList {
    ReplicaList::new(nodes.iter().map(|node| node.as_ref().to_string()).collect()).unwrap()
}

fn body(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

#[tokio::test]
async fn two_node_chain_commits_everywhere() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let block_id = BlockId::generate();
    let data = body(150 * 1024);

    write_block(
        block_id,
        replicas(&[&a.address, &b.address]),
        data.clone(),
        true,
        options(),
    )
    .await
    .unwrap();

    let expected = vec![BlockInfo {
        block_id,
        size: 153_600,
    }];
    assert_eq!(a.store.block_report().await, expected);
    assert_eq!(b.store.block_report().await, expected);

    for node in [&a, &b] {
        let read = read_block(&node.address, block_id, 0, None, options())
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn manual_chain_write_acks_each_packet_and_reports_commit() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let coordinators: Vec<(Arc<RecordingCoordinator>, HeartbeatClient)> = [&a, &b]
        .into_iter()
        .map(|node| {
            let coordinator = Arc::new(RecordingCoordinator::default());
            let heartbeat = HeartbeatClient::new(
                node.address.clone(),
                node.store.clone(),
                coordinator.clone(),
                ReplicationQueue::new(),
                HeartbeatOptions::default(),
            );
            (coordinator, heartbeat)
        })
        .collect();

    let block_id = BlockId::generate();
    let data = body(150 * 1024);
    let mut writer = BlockWriter::connect(
        block_id,
        replicas(&[&a.address, &b.address]),
        true,
        options(),
    )
    .await
    .unwrap();

    let mut packet_acks = 0;
    for range in [0..65_536, 65_536..131_072] {
        writer
            .send_payload(data.slice(range), false)
            .await
            .unwrap();
        packet_acks += 1;
        assert!(!a.store.is_committed(block_id).await);
        assert!(!b.store.is_committed(block_id).await);
    }
    assert_eq!(packet_acks, 2);

    writer
        .send_payload(data.slice(131_072..), true)
        .await
        .unwrap();
    assert_eq!(writer.packets_sent(), 3);
    // The final ack only arrives once every replica committed.
    assert!(a.store.is_committed(block_id).await);
    assert!(b.store.is_committed(block_id).await);

    let notice = HeartbeatEnvelope::NewBlock {
        block: BlockInfo {
            block_id,
            size: 153_600,
        },
    };
    for (coordinator, heartbeat) in &coordinators {
        heartbeat.beat().await.unwrap();
        assert!(coordinator.saw(&notice));
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn dropped_downstream_fails_write_and_leaves_block_pending() {
    let a = TestNode::start().await;

    // Stand-in for B: accepts the header, acks packet 1, hangs up after
    // packet 2.
    let fake = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_address = fake.local_addr().unwrap().to_string();
    let fake_task = tokio::spawn(async move {
        let (mut stream, _) = fake.accept().await.unwrap();
        let header = read_header(&mut stream).await.unwrap();
        assert!(matches!(header, OpHeader::Write { .. }));
        write_status(&mut stream, Status::Ok).await.unwrap();
        read_packet(&mut stream, true).await.unwrap();
        write_status(&mut stream, Status::Ok).await.unwrap();
        read_packet(&mut stream, true).await.unwrap();
    });

    let block_id = BlockId::generate();
    let mut writer = BlockWriter::connect(
        block_id,
        replicas(&[&a.address, &fake_address]),
        true,
        options(),
    )
    .await
    .unwrap();

    let packet = body(64 * 1024);
    let mut failed_at = None;
    for index in 1..=3 {
        if writer.send_payload(packet.clone(), index == 3).await.is_err() {
            failed_at = Some(index);
            break;
        }
    }
    let failed_at = failed_at.expect("write through a dropped replica must fail");
    assert!(failed_at <= 3);
    fake_task.await.unwrap();

    assert!(!a.store.is_committed(block_id).await);
    assert!(a.store.is_pending(block_id).await);

    let coordinator = Arc::new(RecordingCoordinator::default());
    let heartbeat = HeartbeatClient::new(
        a.address.clone(),
        a.store.clone(),
        coordinator.clone(),
        ReplicationQueue::new(),
        HeartbeatOptions::default(),
    );
    heartbeat.beat().await.unwrap();
    assert!(!coordinator.committed_reports().contains(&block_id));

    a.stop().await;
}

#[tokio::test]
async fn commit_reaches_coordinator_before_next_interval() {
    let a = TestNode::start().await;
    let coordinator = Arc::new(RecordingCoordinator::default());
    let heartbeat = Arc::new(HeartbeatClient::new(
        a.address.clone(),
        a.store.clone(),
        coordinator.clone(),
        ReplicationQueue::new(),
        HeartbeatOptions {
            interval: Duration::from_secs(3600),
            ..HeartbeatOptions::default()
        },
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx));

    let block_id = BlockId::generate();
    write_block(block_id, replicas(&[&a.address]), body(1000), true, options())
        .await
        .unwrap();

    let notice = HeartbeatEnvelope::NewBlock {
        block: BlockInfo {
            block_id,
            size: 1000,
        },
    };
    let reported = tokio::time::timeout(Duration::from_secs(5), async {
        while !coordinator.saw(&notice) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reported.is_ok(), "new block was not reported out of cycle");

    shutdown.send(true).unwrap();
    heartbeat_task.await.unwrap();
    a.stop().await;
}

#[tokio::test]
async fn three_node_chain_succeeds_or_fails_as_a_whole() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let c = TestNode::start().await;

    let block_id = BlockId::generate();
    write_block(
        block_id,
        replicas(&[&a.address, &b.address, &c.address]),
        body(200_000),
        true,
        options(),
    )
    .await
    .unwrap();
    for node in [&a, &b, &c] {
        assert_eq!(node.store.block_size(block_id).await, Some(200_000));
    }

    let unreachable = closed_address().await;
    let failed_id = BlockId::generate();
    let result = write_block(
        failed_id,
        replicas(&[&a.address, &b.address, &unreachable]),
        body(10),
        true,
        options(),
    )
    .await;
    assert!(matches!(result, Err(BlockError::Downstream(_))));
    assert!(!a.store.is_committed(failed_id).await);
    assert!(!b.store.is_committed(failed_id).await);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn reads_are_repeatable_and_range_checked() {
    let a = TestNode::start().await;
    let block_id = BlockId::generate();
    let data = body(100_000);
    write_block(block_id, replicas(&[&a.address]), data.clone(), false, options())
        .await
        .unwrap();

    let first = read_block(&a.address, block_id, 0, None, options()).await.unwrap();
    let second = read_block(&a.address, block_id, 0, None, options()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, data);

    let middle = read_block(&a.address, block_id, 65_000, Some(2_000), options())
        .await
        .unwrap();
    assert_eq!(middle, data.slice(65_000..67_000));

    let tail = read_block(&a.address, block_id, 100_000, None, options())
        .await
        .unwrap();
    assert!(tail.is_empty());

    assert!(read_block(&a.address, block_id, 99_000, Some(1_001), options())
        .await
        .is_err());
    assert!(read_block(&a.address, block_id, 100_001, None, options())
        .await
        .is_err());
    assert!(read_block(&a.address, BlockId::generate(), 0, None, options())
        .await
        .is_err());

    a.stop().await;
}

#[tokio::test]
async fn oversized_packet_is_rejected_before_payload() {
    let a = TestNode::start().await;
    let block_id = BlockId::generate();

    let mut stream = TcpStream::connect(&a.address).await.unwrap();
    write_header(
        &mut stream,
        &OpHeader::Write {
            block_id,
            checksums: true,
            replicas: replicas(&[&a.address]),
        },
    )
    .await
    .unwrap();
    assert_eq!(read_status(&mut stream).await.unwrap(), Status::Ok);

    let mut frame = BytesMut::new();
    frame.put_i32(64 * 1024 + 1);
    stream.write_all(&frame).await.unwrap();
    assert_eq!(read_status(&mut stream).await.unwrap(), Status::Error);
    assert!(!a.store.is_committed(block_id).await);

    a.stop().await;
}

#[tokio::test]
async fn oversized_packet_after_valid_one_keeps_received_bytes_pending() {
    let a = TestNode::start().await;
    let block_id = BlockId::generate();

    let mut stream = TcpStream::connect(&a.address).await.unwrap();
    write_header(
        &mut stream,
        &OpHeader::Write {
            block_id,
            checksums: true,
            replicas: replicas(&[&a.address]),
        },
    )
    .await
    .unwrap();
    assert_eq!(read_status(&mut stream).await.unwrap(), Status::Ok);

    let first = body(1000);
    write_packet(&mut stream, &Packet::new(first.clone(), false, true))
        .await
        .unwrap();
    assert_eq!(read_status(&mut stream).await.unwrap(), Status::Ok);

    let mut frame = BytesMut::new();
    frame.put_i32(blockline_core::MAX_PACKET_PAYLOAD as i32 + 1);
    stream.write_all(&frame).await.unwrap();
    assert_eq!(read_status(&mut stream).await.unwrap(), Status::Error);

    assert!(a.store.is_pending(block_id).await);
    assert!(!a.store.is_committed(block_id).await);

    let pending: Vec<_> = std::fs::read_dir(a.store.data_dir().join("pending"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(pending.len(), 1);
    let mut expected = first.to_vec();
    expected.extend_from_slice(&checksum(&first).to_be_bytes());
    assert_eq!(std::fs::read(&pending[0]).unwrap(), expected);

    a.stop().await;
}

#[tokio::test]
async fn duplicate_block_id_is_rejected() {
    let a = TestNode::start().await;
    let block_id = BlockId::generate();
    write_block(block_id, replicas(&[&a.address]), body(10), true, options())
        .await
        .unwrap();

    let again = write_block(block_id, replicas(&[&a.address]), body(20), true, options()).await;
    assert!(again.is_err());
    assert_eq!(a.store.block_size(block_id).await, Some(10));

    a.stop().await;
}

#[tokio::test]
async fn replication_copies_committed_block_to_new_chain() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let block_id = BlockId::generate();
    let data = body(130_000);
    write_block(block_id, replicas(&[&a.address]), data.clone(), true, options())
        .await
        .unwrap();

    let worker = ReplicationWorker::new(a.store.clone(), ReplicationQueue::new(), options());
    let copied = worker
        .replicate(&ReplicationCommand {
            block_id,
            targets: replicas(&[&b.address]),
        })
        .await
        .unwrap();
    assert_eq!(copied, 130_000);

    let read = read_block(&b.address, block_id, 0, None, options()).await.unwrap();
    assert_eq!(read, data);

    a.stop().await;
    b.stop().await;
}
