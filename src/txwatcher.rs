use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::SwapError;
use crate::onchain::ChainSource;
use crate::retry::{RetryConfig, with_timeout};
use crate::swap::Asset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventKind {
    /// The transaction reached the asset's required depth. `height` is the tip
    /// at which that was observed.
    Confirmed {
        txid: String,
        confirmations: u32,
        height: u32,
    },
    /// A previously seen transaction is no longer in the chain or mempool.
    Vanished { txid: String },
    /// The watched output was spent by `spender`, in the mempool or a block.
    Spent { spender: String },
    HeightReached { height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub swap_id: String,
    pub asset: Asset,
    pub kind: ChainEventKind,
}

struct TxWatch {
    script_pubkey: String,
    seen: bool,
    fired: bool,
}

struct SpendWatch {
    txid: String,
    vout: u32,
    script_pubkey: String,
    reported: Option<String>,
}

struct HeightWatch {
    height: u32,
    fired: bool,
}

#[derive(Default)]
struct Watches {
    txs: HashMap<(String, String), TxWatch>,
    heights: HashMap<String, HeightWatch>,
    spends: HashMap<String, SpendWatch>,
}

struct Inner {
    asset: Asset,
    depth: u32,
    source: Arc<dyn ChainSource>,
    interval: Duration,
    query_timeout: Duration,
    events: mpsc::UnboundedSender<ChainEvent>,
    watches: Mutex<Watches>,
}

/// Polls one chain for the transactions and heights swaps care about and
/// reports changes on an event channel. Watches are in-memory; the swap
/// service re-arms them on recovery.
#[derive(Clone)]
pub struct ChainWatcher {
    inner: Arc<Inner>,
}

impl ChainWatcher {
    pub fn new(
        asset: Asset,
        source: Arc<dyn ChainSource>,
        interval: Duration,
        events: mpsc::UnboundedSender<ChainEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                asset,
                depth: asset.required_confirmations(),
                source,
                interval,
                query_timeout: Duration::from_secs(30),
                events,
                watches: Mutex::new(Watches::default()),
            }),
        }
    }

    /// Watches `txid` until it reaches the required depth. Re-adding an
    /// existing watch is a no-op.
    pub fn watch_tx(&self, swap_id: &str, txid: &str, script_pubkey: &str) {
        let mut watches = self.lock();
        watches
            .txs
            .entry((swap_id.to_string(), txid.to_string()))
            .or_insert_with(|| TxWatch {
                script_pubkey: script_pubkey.to_string(),
                seen: false,
                fired: false,
            });
        debug!(asset = %self.inner.asset, swap_id, txid, "watching tx");
    }

    /// Fires once the tip reaches `height`. A later call replaces the target.
    pub fn watch_height(&self, swap_id: &str, height: u32) {
        let mut watches = self.lock();
        let replace = watches
            .heights
            .get(swap_id)
            .is_none_or(|w| w.height != height);
        if replace {
            watches.heights.insert(
                swap_id.to_string(),
                HeightWatch {
                    height,
                    fired: false,
                },
            );
        }
    }

    /// Reports the transaction spending output `vout` of `txid`. One spend
    /// watch per swap; a different outpoint replaces it.
    pub fn watch_spend(&self, swap_id: &str, txid: &str, vout: u32, script_pubkey: &str) {
        let mut watches = self.lock();
        let replace = watches
            .spends
            .get(swap_id)
            .is_none_or(|w| w.txid != txid || w.vout != vout);
        if replace {
            watches.spends.insert(
                swap_id.to_string(),
                SpendWatch {
                    txid: txid.to_string(),
                    vout,
                    script_pubkey: script_pubkey.to_string(),
                    reported: None,
                },
            );
            debug!(asset = %self.inner.asset, swap_id, txid, vout, "watching htlc output");
        }
    }

    pub fn unwatch_spend(&self, swap_id: &str) {
        self.lock().spends.remove(swap_id);
    }

    pub fn unwatch_swap(&self, swap_id: &str) {
        let mut watches = self.lock();
        watches.txs.retain(|(id, _), _| id != swap_id);
        watches.heights.remove(swap_id);
        watches.spends.remove(swap_id);
    }

    pub fn watch_count(&self) -> usize {
        let watches = self.lock();
        watches.txs.len() + watches.heights.len() + watches.spends.len()
    }

    /// One polling round. Chain queries run without holding the watch lock.
    pub async fn poll_once(&self) -> Result<(), SwapError> {
        let inner = &self.inner;
        let tip = with_timeout(
            "current_height",
            inner.query_timeout,
            inner.source.current_height(),
        )
        .await
        .map_err(|e| SwapError::ChainQueryUnavailable(format!("{e:#}")))?;

        let targets: Vec<(String, String, String)> = {
            let watches = self.lock();
            watches
                .txs
                .iter()
                .map(|((swap_id, txid), w)| (swap_id.clone(), txid.clone(), w.script_pubkey.clone()))
                .collect()
        };

        for (swap_id, txid, script_pubkey) in targets {
            let confs = with_timeout(
                "get_confirmations",
                inner.query_timeout,
                inner.source.get_confirmations(&txid, &script_pubkey),
            )
            .await
            .map_err(|e| SwapError::ChainQueryUnavailable(format!("{e:#}")))?;

            let event = {
                let mut watches = self.lock();
                let Some(w) = watches.txs.get_mut(&(swap_id.clone(), txid.clone())) else {
                    continue;
                };
                match confs {
                    Some(n) if n >= inner.depth && !w.fired => {
                        w.seen = true;
                        w.fired = true;
                        Some(ChainEventKind::Confirmed {
                            txid: txid.clone(),
                            confirmations: n,
                            height: tip,
                        })
                    }
                    Some(n) if n > 0 => {
                        w.seen = true;
                        None
                    }
                    _ if w.seen => {
                        // Re-arm: the tx may be mined again.
                        w.seen = false;
                        w.fired = false;
                        Some(ChainEventKind::Vanished { txid: txid.clone() })
                    }
                    _ => None,
                }
            };
            if let Some(kind) = event {
                self.emit(&swap_id, kind);
            }
        }

        let outputs: Vec<(String, String, u32, String)> = {
            let watches = self.lock();
            watches
                .spends
                .iter()
                .map(|(swap_id, w)| (swap_id.clone(), w.txid.clone(), w.vout, w.script_pubkey.clone()))
                .collect()
        };

        for (swap_id, txid, vout, script_pubkey) in outputs {
            let spender = with_timeout(
                "find_spend",
                inner.query_timeout,
                inner.source.find_spend(&txid, vout, &script_pubkey),
            )
            .await
            .map_err(|e| SwapError::ChainQueryUnavailable(format!("{e:#}")))?;

            let event = {
                let mut watches = self.lock();
                let Some(w) = watches.spends.get_mut(&swap_id) else {
                    continue;
                };
                if w.txid != txid || w.reported == spender {
                    continue;
                }
                w.reported = spender.clone();
                spender.map(|spender| ChainEventKind::Spent { spender })
            };
            if let Some(kind) = event {
                self.emit(&swap_id, kind);
            }
        }

        let reached: Vec<(String, u32)> = {
            let mut watches = self.lock();
            watches
                .heights
                .iter_mut()
                .filter(|(_, w)| !w.fired && tip >= w.height)
                .map(|(swap_id, w)| {
                    w.fired = true;
                    (swap_id.clone(), w.height)
                })
                .collect()
        };
        for (swap_id, height) in reached {
            self.emit(&swap_id, ChainEventKind::HeightReached { height });
        }

        Ok(())
    }

    /// Polls until `shutdown` flips to true. Query failures back off.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        let backoff = RetryConfig {
            base_delay: watcher.inner.interval,
            max_delay: watcher.inner.interval.saturating_mul(16),
            ..RetryConfig::default()
        };
        tokio::spawn(async move {
            info!(asset = %watcher.inner.asset, depth = watcher.inner.depth, "chain watcher started");
            let mut failures: u32 = 0;
            loop {
                let delay = match watcher.poll_once().await {
                    Ok(()) => {
                        failures = 0;
                        watcher.inner.interval
                    }
                    Err(err) => {
                        warn!(asset = %watcher.inner.asset, error = %err, "chain poll failed");
                        failures = failures.saturating_add(1);
                        backoff.backoff(failures - 1)
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(asset = %watcher.inner.asset, "chain watcher stopped");
        })
    }

    fn emit(&self, swap_id: &str, kind: ChainEventKind) {
        debug!(asset = %self.inner.asset, swap_id, event = ?kind, "chain event");
        let event = ChainEvent {
            swap_id: swap_id.to_string(),
            asset: self.inner.asset,
            kind,
        };
        if self.inner.events.send(event).is_err() {
            warn!(asset = %self.inner.asset, swap_id, "chain event receiver dropped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Watches> {
        self.inner.watches.lock().expect("watch mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeChain {
        state: Mutex<(u32, HashMap<String, u32>, bool)>,
        spent_by: Mutex<HashMap<(String, u32), String>>,
    }

    impl FakeChain {
        fn set_height(&self, h: u32) {
            self.state.lock().unwrap().0 = h;
        }
        fn include(&self, txid: &str, at: u32) {
            self.state.lock().unwrap().1.insert(txid.into(), at);
        }
        fn drop_tx(&self, txid: &str) {
            self.state.lock().unwrap().1.remove(txid);
        }
        fn fail(&self, fail: bool) {
            self.state.lock().unwrap().2 = fail;
        }
        fn spend(&self, txid: &str, vout: u32, spender: Option<&str>) {
            let mut spent_by = self.spent_by.lock().unwrap();
            match spender {
                Some(spender) => spent_by.insert((txid.into(), vout), spender.into()),
                None => spent_by.remove(&(txid.into(), vout)),
            };
        }
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn current_height(&self) -> Result<u32> {
            let s = self.state.lock().unwrap();
            anyhow::ensure!(!s.2, "backend down");
            Ok(s.0)
        }

        async fn get_confirmations(&self, txid: &str, _script_pubkey: &str) -> Result<Option<u32>> {
            let s = self.state.lock().unwrap();
            anyhow::ensure!(!s.2, "backend down");
            Ok(s.1.get(txid).map(|at| s.0.saturating_sub(*at) + 1))
        }

        async fn find_spend(&self, txid: &str, vout: u32, _script_pubkey: &str) -> Result<Option<String>> {
            anyhow::ensure!(!self.state.lock().unwrap().2, "backend down");
            Ok(self.spent_by.lock().unwrap().get(&(txid.to_string(), vout)).cloned())
        }
    }

    fn setup(asset: Asset) -> (Arc<FakeChain>, ChainWatcher, mpsc::UnboundedReceiver<ChainEvent>) {
        let chain = Arc::new(FakeChain::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = ChainWatcher::new(asset, chain.clone(), Duration::from_millis(10), tx);
        (chain, watcher, rx)
    }

    #[tokio::test]
    async fn confirmed_fires_once_at_required_depth() {
        let (chain, watcher, mut rx) = setup(Asset::Bitcoin);
        chain.set_height(100);
        chain.include("aa", 99);
        watcher.watch_tx("s1", "aa", "spk");

        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err(), "two confirmations is not enough on bitcoin");

        chain.set_height(101);
        watcher.poll_once().await.unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(
            ev.kind,
            ChainEventKind::Confirmed {
                txid: "aa".into(),
                confirmations: 3,
                height: 101
            }
        );

        chain.set_height(110);
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reorged_tx_reports_vanished_and_rearms() {
        let (chain, watcher, mut rx) = setup(Asset::Liquid);
        chain.set_height(50);
        chain.include("bb", 50);
        watcher.watch_tx("s1", "bb", "spk");
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());

        chain.drop_tx("bb");
        watcher.poll_once().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::Vanished { txid: "bb".into() }
        );

        chain.set_height(52);
        chain.include("bb", 51);
        watcher.poll_once().await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::Confirmed { confirmations: 2, .. }
        ));
    }

    #[tokio::test]
    async fn height_watch_fires_once() {
        let (chain, watcher, mut rx) = setup(Asset::Liquid);
        watcher.watch_height("s1", 20);
        chain.set_height(19);
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());

        chain.set_height(25);
        watcher.poll_once().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::HeightReached { height: 20 }
        );
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());

        watcher.unwatch_swap("s1");
        assert_eq!(watcher.watch_count(), 0);
    }

    #[tokio::test]
    async fn spend_is_reported_once_per_spender() {
        let (chain, watcher, mut rx) = setup(Asset::Bitcoin);
        chain.set_height(10);
        watcher.watch_spend("s1", "cc", 1, "spk");
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());

        chain.spend("cc", 0, Some("other-output"));
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err(), "only the watched vout counts");

        chain.spend("cc", 1, Some("dd"));
        watcher.poll_once().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::Spent { spender: "dd".into() }
        );
        watcher.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());

        // The spend is reorged out and replaced by another one.
        chain.spend("cc", 1, None);
        watcher.poll_once().await.unwrap();
        chain.spend("cc", 1, Some("ee"));
        watcher.poll_once().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::Spent { spender: "ee".into() }
        );

        watcher.unwatch_spend("s1");
        assert_eq!(watcher.watch_count(), 0);
    }

    #[tokio::test]
    async fn backend_failure_is_chain_query_unavailable() {
        let (chain, watcher, _rx) = setup(Asset::Bitcoin);
        chain.fail(true);
        let err = watcher.poll_once().await.unwrap_err();
        assert!(matches!(err, SwapError::ChainQueryUnavailable(_)));
    }
}
