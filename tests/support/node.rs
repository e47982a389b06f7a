use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use peerswap::config::SwapServiceConfig;
use peerswap::onchain::OnChainServices;
use peerswap::peer::{PeerMessageRouter, PeerMessenger};
use peerswap::policy::{Policy, PolicyConfig};
use peerswap::poll::PollService;
use peerswap::retry::RetryConfig;
use peerswap::swap::service::SwapService;
use peerswap::swap::store::{SqliteStore, SwapStore};
use peerswap::swap::{Asset, RequestedSwap, Swap, Transition, TransitionRecord};
use peerswap::txwatcher::ChainWatcher;

use super::chain::MockChain;
use super::lightning::{InvoiceNetwork, MockLightning};

/// In-process peer transport. Delivery runs the receiver's router inline,
/// so messages between two nodes arrive in send order.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routers: Arc<Mutex<HashMap<String, PeerMessageRouter>>>,
}

impl LoopbackNetwork {
    pub fn messenger(&self, node_id: &str) -> Arc<LoopbackMessenger> {
        Arc::new(LoopbackMessenger {
            node_id: node_id.to_string(),
            network: self.clone(),
        })
    }

    pub fn register(&self, node_id: &str, router: PeerMessageRouter) {
        self.lock().insert(node_id.to_string(), router);
    }

    pub fn unregister(&self, node_id: &str) {
        self.lock().remove(node_id);
    }

    pub fn router(&self, node_id: &str) -> Option<PeerMessageRouter> {
        self.lock().get(node_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerMessageRouter>> {
        self.routers.lock().expect("router mutex poisoned")
    }
}

pub struct LoopbackMessenger {
    node_id: String,
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerMessenger for LoopbackMessenger {
    async fn send_message(&self, peer_id: &str, message_type: u32, payload: Vec<u8>) -> Result<()> {
        let router = self
            .network
            .router(peer_id)
            .with_context(|| format!("peer {peer_id} is offline"))?;
        // Delivery is acknowledged whatever the receiver makes of it.
        let _ = router.route(&self.node_id, message_type, &payload).await;
        Ok(())
    }

    async fn connected_peers(&self) -> Result<Vec<String>> {
        let mut peers: Vec<String> = self
            .network
            .lock()
            .keys()
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect();
        peers.sort();
        Ok(peers)
    }
}

/// Swap store whose writes can be switched to fail.
pub struct FailingStore {
    inner: Arc<SqliteStore>,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        anyhow::ensure!(!self.fail_writes.load(Ordering::SeqCst), "disk I/O error");
        Ok(())
    }
}

impl SwapStore for FailingStore {
    fn put(&self, swap: &Swap) -> Result<()> {
        self.check()?;
        self.inner.put(swap)
    }

    fn get(&self, swap_id: &str) -> Result<Option<Swap>> {
        self.inner.get(swap_id)
    }

    fn list(&self) -> Result<Vec<Swap>> {
        self.inner.list()
    }

    fn list_non_terminal(&self) -> Result<Vec<Swap>> {
        self.inner.list_non_terminal()
    }

    fn record_transition(&self, swap: &Swap, transition: &Transition, at: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        self.inner.record_transition(swap, transition, at)
    }

    fn history(&self, swap_id: &str) -> Result<Vec<TransitionRecord>> {
        self.inner.history(swap_id)
    }

    fn put_requested(&self, request: &RequestedSwap) -> Result<()> {
        self.check()?;
        self.inner.put_requested(request)
    }

    fn remove_requested(&self, swap_id: &str) -> Result<()> {
        self.check()?;
        self.inner.remove_requested(swap_id)
    }

    fn list_requested(&self) -> Result<Vec<RequestedSwap>> {
        self.inner.list_requested()
    }
}

/// Fast timings so whole swaps run in well under a second of wall time.
pub fn test_config() -> SwapServiceConfig {
    SwapServiceConfig {
        rpc_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            timeout: Duration::from_secs(2),
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter_ms: 0,
        },
        invoice_poll_interval: Duration::from_millis(20),
        ..SwapServiceConfig::default()
    }
}

pub fn open_policy() -> PolicyConfig {
    PolicyConfig {
        accept_all_peers: true,
        ..PolicyConfig::default()
    }
}

/// Chains, invoices and transport shared by the nodes of one test.
pub struct Harness {
    pub network: LoopbackNetwork,
    pub invoices: InvoiceNetwork,
    pub btc: Arc<MockChain>,
    pub lbtc: Arc<MockChain>,
    dir: tempfile::TempDir,
}

pub struct NodeOptions {
    pub policy: PolicyConfig,
    pub assets: Vec<Asset>,
    /// Wraps the node's sqlite store when set.
    pub failing_store: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            policy: open_policy(),
            assets: Asset::ALL.to_vec(),
            failing_store: false,
        }
    }
}

pub struct TestNode {
    pub id: String,
    pub swaps: SwapService,
    pub poll: PollService,
    pub sqlite: Arc<SqliteStore>,
    pub failing: Option<Arc<FailingStore>>,
    pub lightning: Arc<MockLightning>,
    network: LoopbackNetwork,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Result<Self> {
        peerswap::logging::init().ok();
        Ok(Self {
            network: LoopbackNetwork::default(),
            invoices: InvoiceNetwork::new(),
            btc: Arc::new(MockChain::new(Asset::Bitcoin)),
            lbtc: Arc::new(MockChain::new(Asset::Liquid)),
            dir: tempfile::tempdir().context("create tempdir")?,
        })
    }

    pub fn chain(&self, asset: Asset) -> &Arc<MockChain> {
        match asset {
            Asset::Bitcoin => &self.btc,
            Asset::Liquid => &self.lbtc,
        }
    }

    pub fn db_path(&self, node_id: &str) -> PathBuf {
        self.dir.path().join(format!("{node_id}.sqlite"))
    }

    pub async fn node(&self, node_id: &str) -> Result<TestNode> {
        self.node_with(node_id, NodeOptions::default()).await
    }

    /// Starts a node on its own database, recovering whatever it holds.
    pub async fn node_with(&self, node_id: &str, opts: NodeOptions) -> Result<TestNode> {
        let sqlite = Arc::new(SqliteStore::open(self.db_path(node_id))?);
        let failing = opts
            .failing_store
            .then(|| Arc::new(FailingStore::new(sqlite.clone())));
        let store: Arc<dyn SwapStore> = match &failing {
            Some(failing) => failing.clone() as Arc<dyn SwapStore>,
            None => sqlite.clone(),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut chains = OnChainServices::new();
        let mut watchers = HashMap::new();
        for asset in &opts.assets {
            let chain = self.chain(*asset).clone();
            chains.insert(chain.clone());
            watchers.insert(
                *asset,
                ChainWatcher::new(*asset, chain, Duration::from_millis(20), events_tx.clone()),
            );
        }

        let lightning = self.invoices.node(node_id);
        let messenger = self.network.messenger(node_id);
        let policy = Arc::new(Policy::new(opts.policy, opts.assets.clone()));
        let poll = PollService::new(
            policy.clone(),
            messenger.clone(),
            sqlite.clone(),
            Duration::from_secs(3600),
        );
        poll.load()?;

        let swaps = SwapService::new(
            test_config(),
            store,
            chains,
            watchers.clone(),
            lightning.clone(),
            messenger,
            policy,
            poll.clone(),
        );
        self.network
            .register(node_id, PeerMessageRouter::new(swaps.clone(), poll.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![swaps.start(events_rx)];
        tasks.extend(watchers.values().map(|w| w.spawn(shutdown_rx.clone())));
        swaps.recover_swaps().await?;

        Ok(TestNode {
            id: node_id.to_string(),
            swaps,
            poll,
            sqlite,
            failing,
            lightning,
            network: self.network.clone(),
            shutdown,
            tasks,
        })
    }
}

impl TestNode {
    /// Sends this node's poll to `peer_id`, making this node eligible there.
    pub async fn announce_to(&self, peer_id: &str) -> Result<()> {
        self.poll.poll_peer(peer_id).await?;
        Ok(())
    }

    pub fn stored(&self, swap_id: &str) -> Result<Option<Swap>> {
        self.sqlite.get(swap_id)
    }

    /// Takes the node offline; its database stays behind for a restart.
    pub async fn stop(self) {
        self.network.unregister(&self.id);
        let _ = self.shutdown.send(true);
        self.swaps.shutdown().await;
        for task in self.tasks {
            task.await.ok();
        }
    }
}
