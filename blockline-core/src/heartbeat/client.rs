use super::{Command, CoordinatorClient, HeartbeatEnvelope};
use crate::block::{BlockId, BlockInfo};
use crate::error::{BlockError, Result};
use crate::replication::{ReplicationCommand, ReplicationQueue};
use crate::storage::{BlockListener, BlockStore};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Extra attempts per round after the first failure.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Pending blocks older than this are swept on the heartbeat cadence.
    pub pending_max_age: Duration,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            pending_max_age: Duration::from_secs(600),
        }
    }
}

/// Envelopes accumulated between heartbeat rounds.
#[derive(Default)]
pub struct HeartbeatOutbox {
    queue: Mutex<VecDeque<HeartbeatEnvelope>>,
    wake: Notify,
}

impl HeartbeatOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: HeartbeatEnvelope) {
        self.lock().push_back(envelope);
    }

    /// Requests a heartbeat now instead of at the next tick.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn drain(&self) -> Vec<HeartbeatEnvelope> {
        self.lock().drain(..).collect()
    }

    /// Puts undelivered envelopes back ahead of anything queued since.
    fn restore(&self, envelopes: Vec<HeartbeatEnvelope>) {
        let mut queue = self.lock();
        for envelope in envelopes.into_iter().rev() {
            queue.push_front(envelope);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<HeartbeatEnvelope>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockListener for HeartbeatOutbox {
    fn block_committed(&self, block: BlockInfo) {
        self.push(HeartbeatEnvelope::NewBlock { block });
        self.trigger();
    }

    fn blocks_removed(&self, block_ids: &[BlockId]) {
        for block_id in block_ids {
            self.push(HeartbeatEnvelope::BlockDeleted {
                block_id: *block_id,
            });
        }
        self.trigger();
    }
}

/// Periodic status/command exchange with the coordinator.
pub struct HeartbeatClient {
    node_address: String,
    store: Arc<BlockStore>,
    coordinator: Arc<dyn CoordinatorClient>,
    outbox: Arc<HeartbeatOutbox>,
    replication: ReplicationQueue,
    options: HeartbeatOptions,
}

impl HeartbeatClient {
    /// Creates the client and installs its outbox as the store's listener.
    pub fn new(
        node_address: String,
        store: Arc<BlockStore>,
        coordinator: Arc<dyn CoordinatorClient>,
        replication: ReplicationQueue,
        options: HeartbeatOptions,
    ) -> Self {
        let outbox = Arc::new(HeartbeatOutbox::new());
        store.set_listener(outbox.clone());
        Self {
            node_address,
            store,
            coordinator,
            outbox,
            replication,
            options,
        }
    }

    pub fn outbox(&self) -> Arc<HeartbeatOutbox> {
        self.outbox.clone()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.queue_block_report().await;

        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Heartbeat to coordinator every {:?} as {}",
            self.options.interval,
            self.node_address
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.sweep_stale_pending(self.options.pending_max_age).await {
                        Ok(0) => {}
                        Ok(swept) => tracing::info!("Swept {} stale pending blocks", swept),
                        Err(error) => tracing::warn!("Pending sweep failed: {}", error),
                    }
                }
                _ = self.outbox.wake.notified() => {
                    tracing::debug!("Out-of-cycle heartbeat");
                }
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }

            if let Err(error) = self.beat().await {
                tracing::warn!("Heartbeat round failed: {}", error);
            }
        }

        tracing::info!("Heartbeat loop stopped");
    }

    /// Runs one round: sends a fresh status plus everything queued since the
    /// last round, then processes the returned commands.
    pub async fn beat(&self) -> Result<usize> {
        let mut envelopes = vec![HeartbeatEnvelope::Status {
            usage: self.store.usage().await,
            pending_blocks: self.store.pending_count().await,
            sent_at: Utc::now(),
        }];
        envelopes.extend(self.outbox.drain());

        let commands = match self.send_with_retry(&envelopes).await {
            Ok(commands) => commands,
            Err(error) => {
                let undelivered = envelopes
                    .into_iter()
                    .filter(|envelope| !matches!(envelope, HeartbeatEnvelope::Status { .. }))
                    .collect();
                self.outbox.restore(undelivered);
                return Err(error);
            }
        };

        let count = commands.len();
        for command in commands {
            self.process_command(command).await;
        }
        Ok(count)
    }

    pub async fn process_command(&self, command: Command) {
        match command {
            Command::ReportBlocks => {
                self.queue_block_report().await;
                self.outbox.trigger();
            }
            Command::DeleteBlocks { block_ids } => {
                tracing::info!("Coordinator requested deletion of {} blocks", block_ids.len());
                let store = self.store.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    if let Err(error) = store.remove(&block_ids).await {
                        tracing::warn!("Block deletion failed: {}", error);
                    }
                    // Usage changed; get it in front of the coordinator.
                    outbox.trigger();
                });
            }
            Command::ReplicateBlock { block_id, targets } => {
                tracing::info!(
                    "Coordinator requested replication of {} to {:?}",
                    block_id,
                    targets.addresses()
                );
                self.replication
                    .push(ReplicationCommand { block_id, targets })
                    .await;
            }
        }
    }

    async fn queue_block_report(&self) {
        self.outbox.push(HeartbeatEnvelope::BlockReport {
            blocks: self.store.block_report().await,
            usage: self.store.usage().await,
        });
    }

    async fn send_with_retry(&self, envelopes: &[HeartbeatEnvelope]) -> Result<Vec<Command>> {
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 0u32;
        loop {
            match self
                .coordinator
                .heartbeat(&self.node_address, envelopes)
                .await
            {
                Ok(commands) => return Ok(commands),
                Err(error) if attempt < self.options.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Heartbeat attempt {} failed: {}; retrying in {:?}",
                        attempt,
                        error,
                        backoff
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.interval);
                }
                Err(error) => {
                    return Err(BlockError::CoordinatorUnavailable(format!(
                        "giving up after {} attempts: {}",
                        attempt + 1,
                        error
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ReplicaList;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedCoordinator {
        failures_left: AtomicUsize,
        rounds: Mutex<Vec<Vec<HeartbeatEnvelope>>>,
        replies: Mutex<VecDeque<Vec<Command>>>,
    }

    #[async_trait]
    impl CoordinatorClient for ScriptedCoordinator {
        async fn heartbeat(
            &self,
            _node_address: &str,
            envelopes: &[HeartbeatEnvelope],
        ) -> Result<Vec<Command>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(BlockError::CoordinatorUnavailable("down".to_string()));
            }
            self.rounds.lock().unwrap().push(envelopes.to_vec());
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn options() -> HeartbeatOptions {
        HeartbeatOptions {
            interval: Duration::from_millis(50),
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            pending_max_age: Duration::from_secs(600),
        }
    }

    fn setup(
        coordinator: Arc<ScriptedCoordinator>,
    ) -> (tempfile::TempDir, Arc<BlockStore>, HeartbeatClient, ReplicationQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path().to_path_buf(), true).unwrap());
        let queue = ReplicationQueue::new();
        let client = HeartbeatClient::new(
            "node-a:50010".to_string(),
            store.clone(),
            coordinator,
            queue.clone(),
            options(),
        );
        (dir, store, client, queue)
    }

    async fn commit(store: &BlockStore, body: &[u8]) -> BlockId {
        let block_id = BlockId::generate();
        let mut pending = store.create(block_id).await.unwrap();
        pending.append(body).await.unwrap();
        store.complete(pending.finish().await.unwrap()).await.unwrap();
        block_id
    }

    #[tokio::test]
    async fn round_drains_outbox_behind_fresh_status() {
        let coordinator = Arc::new(ScriptedCoordinator::default());
        let (_dir, store, client, _queue) = setup(coordinator.clone());

        let block_id = commit(&store, b"hello").await;
        assert_eq!(client.outbox().len(), 1);

        client.beat().await.unwrap();
        let rounds = coordinator.rounds.lock().unwrap();
        assert!(matches!(rounds[0][0], HeartbeatEnvelope::Status { .. }));
        assert_eq!(
            rounds[0][1],
            HeartbeatEnvelope::NewBlock {
                block: BlockInfo { block_id, size: 5 }
            }
        );
        assert!(client.outbox().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let coordinator = Arc::new(ScriptedCoordinator::default());
        coordinator.failures_left.store(2, Ordering::SeqCst);
        let (_dir, _store, client, _queue) = setup(coordinator.clone());

        client.beat().await.unwrap();
        assert_eq!(coordinator.rounds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undelivered_events_survive_a_failed_round() {
        let coordinator = Arc::new(ScriptedCoordinator::default());
        coordinator.failures_left.store(10, Ordering::SeqCst);
        let (_dir, store, client, _queue) = setup(coordinator.clone());

        let block_id = commit(&store, b"kept").await;
        let err = client.beat().await.unwrap_err();
        assert!(matches!(err, BlockError::CoordinatorUnavailable(_)));
        assert_eq!(client.outbox().len(), 1);

        coordinator.failures_left.store(0, Ordering::SeqCst);
        client.beat().await.unwrap();
        let rounds = coordinator.rounds.lock().unwrap();
        assert!(rounds[0].contains(&HeartbeatEnvelope::NewBlock {
            block: BlockInfo { block_id, size: 4 }
        }));
    }

    #[tokio::test]
    async fn commands_reach_store_and_replication_queue() {
        let coordinator = Arc::new(ScriptedCoordinator::default());
        let (_dir, store, client, queue) = setup(coordinator.clone());
        let doomed = commit(&store, b"delete me").await;
        let copied = commit(&store, b"copy me").await;
        let targets = ReplicaList::new(vec!["node-b:50010".to_string()]).unwrap();

        coordinator.replies.lock().unwrap().push_back(vec![
            Command::DeleteBlocks {
                block_ids: vec![doomed],
            },
            Command::ReplicateBlock {
                block_id: copied,
                targets: targets.clone(),
            },
            Command::ReportBlocks,
        ]);
        assert_eq!(client.beat().await.unwrap(), 3);

        assert_eq!(
            queue.pop().await,
            ReplicationCommand {
                block_id: copied,
                targets
            }
        );

        for _ in 0..100 {
            if !store.is_committed(doomed).await {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.is_committed(doomed).await);

        let queued = client.outbox().drain();
        assert!(queued.iter().any(|envelope| matches!(
            envelope,
            HeartbeatEnvelope::BlockReport { blocks, .. }
                if blocks.iter().any(|block| block.block_id == copied)
        )));
    }

    #[tokio::test]
    async fn commit_triggers_out_of_cycle_beat() {
        let coordinator = Arc::new(ScriptedCoordinator::default());
        let (_dir, store, client, _queue) = setup(coordinator.clone());
        let client = Arc::new(HeartbeatClient {
            options: HeartbeatOptions {
                interval: Duration::from_secs(3600),
                ..options()
            },
            ..client
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(client.clone().run(shutdown_rx));

        // First tick fires immediately; wait for it to go out.
        for _ in 0..100 {
            if !coordinator.rounds.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let block_id = commit(&store, b"prompt").await;
        let expected = HeartbeatEnvelope::NewBlock {
            block: BlockInfo { block_id, size: 6 },
        };
        let mut seen = false;
        for _ in 0..100 {
            if coordinator
                .rounds
                .lock()
                .unwrap()
                .iter()
                .any(|round| round.contains(&expected))
            {
                seen = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "commit was not reported before the next interval");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
