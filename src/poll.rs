use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SwapError;
use crate::peer::{PeerMessenger, send_wire};
use crate::policy::Policy;
use crate::swap::Asset;
use crate::swap::messages::WireMessage;
use crate::swap::store::PollStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Capability snapshot a node sends to each peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollMessage {
    pub supported_assets: Vec<Asset>,
    pub min_swap_amount_sat: u64,
    pub max_swap_amount_sat: u64,
    /// Whether the sender accepts swap requests from the receiver.
    pub peer_allowed: bool,
    pub timestamp: DateTime<Utc>,
}

impl PollMessage {
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.min_swap_amount_sat > self.max_swap_amount_sat {
            return Err(SwapError::InvalidMessage(format!(
                "poll min {} exceeds max {}",
                self.min_swap_amount_sat, self.max_swap_amount_sat
            )));
        }
        Ok(())
    }
}

/// Last poll received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPoll {
    pub peer_id: String,
    pub poll: PollMessage,
    pub received_at: DateTime<Utc>,
}

impl PeerPoll {
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.received_at > ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub poll: PeerPoll,
    pub stale: bool,
}

struct Inner {
    interval: Duration,
    ttl: Duration,
    policy: Arc<Policy>,
    messenger: Arc<dyn PeerMessenger>,
    store: Arc<dyn PollStore>,
    peers: Mutex<HashMap<String, PeerPoll>>,
}

/// Exchanges capability snapshots with connected peers. Failures here never
/// touch swap state.
#[derive(Clone)]
pub struct PollService {
    inner: Arc<Inner>,
}

impl PollService {
    pub fn new(
        policy: Arc<Policy>,
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn PollStore>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                ttl: interval.saturating_mul(2),
                policy,
                messenger,
                store,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Restores persisted polls. Stale ones are kept; eligibility checks skip them.
    pub fn load(&self) -> Result<usize> {
        let polls = self.inner.store.list_polls().context("load peer polls")?;
        let count = polls.len();
        let mut peers = self.peers();
        for poll in polls {
            peers.insert(poll.peer_id.clone(), poll);
        }
        Ok(count)
    }

    /// This node's snapshot as seen by `peer_id`.
    pub fn local_poll(&self, peer_id: &str) -> PollMessage {
        let policy = &self.inner.policy;
        PollMessage {
            supported_assets: policy.supported_assets().to_vec(),
            min_swap_amount_sat: policy.config().min_swap_amount_sat,
            max_swap_amount_sat: policy.max_amount_for(peer_id),
            peer_allowed: policy.is_peer_allowed(peer_id),
            timestamp: Utc::now(),
        }
    }

    pub async fn poll_peer(&self, peer_id: &str) -> Result<(), SwapError> {
        let poll = self.local_poll(peer_id);
        send_wire(self.inner.messenger.as_ref(), peer_id, &WireMessage::Poll(poll)).await
    }

    pub async fn poll_all_peers(&self) {
        for peer_id in self.connected_peers().await {
            if let Err(err) = self.poll_peer(&peer_id).await {
                warn!(peer_id = %peer_id, error = %err, "send poll failed");
            }
        }
    }

    pub async fn request_polls(&self) {
        for peer_id in self.connected_peers().await {
            if let Err(err) =
                send_wire(self.inner.messenger.as_ref(), &peer_id, &WireMessage::RequestPoll).await
            {
                warn!(peer_id = %peer_id, error = %err, "send request-poll failed");
            }
        }
    }

    pub async fn handle_message(&self, peer_id: &str, message: WireMessage) -> Result<(), SwapError> {
        match message {
            WireMessage::Poll(poll) => {
                let record = PeerPoll {
                    peer_id: peer_id.to_string(),
                    poll,
                    received_at: Utc::now(),
                };
                let store = self.inner.store.clone();
                let stored = record.clone();
                let persisted = tokio::task::spawn_blocking(move || store.put_poll(&stored))
                    .await
                    .context("poll store task failed")
                    .and_then(|res| res);
                if let Err(err) = persisted {
                    // Polls are advisory; keep the in-memory copy anyway.
                    warn!(peer_id, error = %format!("{err:#}"), "persist poll failed");
                }
                debug!(peer_id, assets = ?record.poll.supported_assets, "poll received");
                self.peers().insert(peer_id.to_string(), record);
                Ok(())
            }
            WireMessage::RequestPoll => self.poll_peer(peer_id).await,
            WireMessage::Swap(_) => Err(SwapError::InvalidMessage(
                "swap message routed to poll service".into(),
            )),
        }
    }

    /// Whether a swap of `amount_sat` in `asset` may be started with `peer_id`.
    pub fn is_eligible(
        &self,
        peer_id: &str,
        asset: Asset,
        amount_sat: u64,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let peers = self.peers();
        let Some(record) = peers.get(peer_id) else {
            return Err("no poll received from peer".into());
        };
        if record.is_stale(now, self.inner.ttl) {
            return Err("peer poll is stale".into());
        }
        let poll = &record.poll;
        if !poll.supported_assets.contains(&asset) {
            return Err(format!("peer does not support {asset}"));
        }
        if !poll.peer_allowed {
            return Err("peer does not accept swaps from this node".into());
        }
        if amount_sat < poll.min_swap_amount_sat || amount_sat > poll.max_swap_amount_sat {
            return Err(format!(
                "amount {amount_sat} outside peer limits {}..={}",
                poll.min_swap_amount_sat, poll.max_swap_amount_sat
            ));
        }
        Ok(())
    }

    pub fn peer_statuses(&self, now: DateTime<Utc>) -> Vec<PeerStatus> {
        let mut out: Vec<PeerStatus> = self
            .peers()
            .values()
            .map(|poll| PeerStatus {
                stale: poll.is_stale(now, self.inner.ttl),
                poll: poll.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.poll.peer_id.cmp(&b.poll.peer_id));
        out
    }

    /// Requests polls once, then sends this node's poll every interval until shutdown.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = service.inner.interval.as_secs(), "poll service started");
            service.request_polls().await;
            loop {
                service.poll_all_peers().await;
                tokio::select! {
                    _ = tokio::time::sleep(service.inner.interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("poll service stopped");
        })
    }

    async fn connected_peers(&self) -> Vec<String> {
        match self.inner.messenger.connected_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "list connected peers failed");
                Vec::new()
            }
        }
    }

    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerPoll>> {
        self.inner.peers.lock().expect("poll mutex poisoned")
    }
}
