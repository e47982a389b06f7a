use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::machine::{MachineContext, SwapInput, SwapMachine};
use super::messages::{SwapMessage, SwapMessageBody, WireMessage};
use super::store::SwapStore;
use super::{Asset, RequestedSwap, Swap, SwapKind, Transition};
use crate::config::SwapServiceConfig;
use crate::error::SwapError;
use crate::lightning::Lightning;
use crate::onchain::OnChainServices;
use crate::peer::{PeerMessenger, send_wire};
use crate::policy::{Decision, Policy};
use crate::poll::PollService;
use crate::txwatcher::{ChainEvent, ChainEventKind, ChainWatcher};

struct Unit {
    peer_id: String,
    inbox: mpsc::UnboundedSender<SwapInput>,
}

struct Inner {
    ctx: Arc<MachineContext>,
    policy: Arc<Policy>,
    poll: PollService,
    units: Mutex<HashMap<String, Unit>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Owns every live swap unit and routes peer messages and chain events to them.
#[derive(Clone)]
pub struct SwapService {
    inner: Arc<Inner>,
}

impl SwapService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SwapServiceConfig,
        store: Arc<dyn SwapStore>,
        chains: OnChainServices,
        watchers: HashMap<Asset, ChainWatcher>,
        lightning: Arc<dyn Lightning>,
        messenger: Arc<dyn PeerMessenger>,
        policy: Arc<Policy>,
        poll: PollService,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(MachineContext {
                    cfg,
                    store,
                    chains,
                    watchers,
                    lightning,
                    messenger,
                    halted: Arc::new(AtomicBool::new(false)),
                }),
                policy,
                poll,
                units: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Forwards watcher events to the swap units until shutdown.
    pub fn start(&self, mut events: mpsc::UnboundedReceiver<ChainEvent>) -> JoinHandle<()> {
        let service = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => service.on_chain_event(&event.swap_id, event.kind),
                        None => break,
                    },
                }
            }
            debug!("chain event dispatcher stopped");
        })
    }

    pub fn is_halted(&self) -> bool {
        self.inner.ctx.halted.load(Ordering::SeqCst)
    }

    pub fn active_swaps(&self) -> usize {
        self.units().len()
    }

    /// Starts a swap with `peer_id` as initiator.
    pub async fn create_swap(
        &self,
        kind: SwapKind,
        asset: Asset,
        peer_id: &str,
        amount_sat: u64,
    ) -> Result<String, SwapError> {
        self.ensure_running()?;
        if self.inner.ctx.chains.get(asset).is_none() {
            return Err(SwapError::UnsupportedAsset(asset));
        }
        self.inner.policy.check_outbound(peer_id, asset, amount_sat)?;
        self.inner
            .poll
            .is_eligible(peer_id, asset, amount_sat, Utc::now())
            .map_err(|reason| SwapError::PeerNotEligible {
                peer_id: peer_id.to_string(),
                reason,
            })?;

        let swap = Swap::new_initiator(kind, asset, peer_id, amount_sat, Utc::now());
        let swap_id = swap.id.clone();
        self.persist_created(&swap).await?;
        info!(swap_id = %swap_id, peer_id, asset = %asset, kind = %kind, amount_sat, "swap created");
        self.spawn_unit(swap, true);
        Ok(swap_id)
    }

    /// Routes a decoded swap message. Requests go through the policy first.
    pub async fn handle_peer_message(&self, peer_id: &str, message: SwapMessage) -> Result<(), SwapError> {
        self.ensure_running()?;
        let body = match message.body {
            SwapMessageBody::Request {
                kind,
                asset,
                amount_sat,
                claim_pubkey,
            } => {
                let request = RequestedSwap {
                    swap_id: message.swap_id,
                    peer_id: peer_id.to_string(),
                    kind,
                    asset,
                    amount_sat,
                    peer_pubkey: claim_pubkey,
                    protocol_version: message.protocol_version,
                    received_at: Utc::now(),
                    rejection: None,
                };
                return self.on_request(request).await;
            }
            body => body,
        };

        let units = self.units();
        let Some(unit) = units.get(&message.swap_id) else {
            return Err(SwapError::UnknownSwap(message.swap_id));
        };
        if unit.peer_id != peer_id {
            return Err(SwapError::InvalidMessage(format!(
                "swap {} does not belong to {peer_id}",
                message.swap_id
            )));
        }
        unit.inbox
            .send(SwapInput::Message(body))
            .map_err(|_| SwapError::UnknownSwap(message.swap_id))
    }

    pub fn on_chain_event(&self, swap_id: &str, kind: ChainEventKind) {
        match self.units().get(swap_id) {
            Some(unit) => {
                let _ = unit.inbox.send(SwapInput::Chain(kind));
            }
            None => debug!(swap_id, event = ?kind, "chain event for inactive swap"),
        }
    }

    /// Reloads in-flight swaps after a restart. Watches are re-armed; nothing
    /// already broadcast is sent again. Returns the number of resumed swaps.
    pub async fn recover_swaps(&self) -> Result<usize, SwapError> {
        self.ensure_running()?;
        let swaps = self
            .blocking(|store| store.list_non_terminal())
            .await
            .map_err(SwapError::Other)?;
        let count = swaps.len();
        for swap in swaps {
            if self.units().contains_key(&swap.id) {
                continue;
            }
            info!(swap_id = %swap.id, state = %swap.state, asset = %swap.asset, "recovering swap");
            let (tx, rx) = mpsc::unbounded_channel();
            let mut machine = SwapMachine::new(swap, self.inner.ctx.clone(), tx.clone());
            if machine.resume().await {
                let _ = tx.send(SwapInput::Kick);
            }
            self.run_unit(machine, tx, rx);
        }

        let requested = self
            .blocking(|store| store.list_requested())
            .await
            .map_err(SwapError::Other)?;
        for request in requested.into_iter().filter(RequestedSwap::is_pending) {
            let known = self.is_known(&request.swap_id).await?;
            if known {
                let id = request.swap_id.clone();
                self.persist(move |store| store.remove_requested(&id)).await?;
                continue;
            }
            match self.decide(request).await {
                Ok(()) | Err(SwapError::PolicyRejected(_)) => {}
                Err(err) => return Err(err),
            }
        }

        info!(count, "swap recovery done");
        Ok(count)
    }

    pub async fn get_swap(&self, swap_id: &str) -> Result<Swap, SwapError> {
        let id = swap_id.to_string();
        self.blocking(move |store| store.get(&id))
            .await
            .map_err(SwapError::Other)?
            .ok_or_else(|| SwapError::UnknownSwap(swap_id.to_string()))
    }

    pub async fn list_swaps(&self) -> Result<Vec<Swap>, SwapError> {
        self.blocking(|store| store.list()).await.map_err(SwapError::Other)
    }

    /// Pending and rejected inbound requests, oldest first.
    pub async fn list_requested_swaps(&self) -> Result<Vec<RequestedSwap>, SwapError> {
        self.blocking(|store| store.list_requested())
            .await
            .map_err(SwapError::Other)
    }

    /// Stops every swap unit after its current step and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
                warn!("swap unit did not stop in time");
            }
        }
        info!("swap service stopped");
    }

    async fn on_request(&self, request: RequestedSwap) -> Result<(), SwapError> {
        let known = self.is_known(&request.swap_id).await?;
        if known {
            return Err(SwapError::InvalidMessage(format!(
                "duplicate swap id {}",
                request.swap_id
            )));
        }

        let stored = request.clone();
        self.persist(move |store| store.put_requested(&stored)).await?;
        self.decide(request).await
    }

    /// Applies the policy to a stored request: accepted ones become swaps,
    /// rejected ones stay on record and the peer is told.
    async fn decide(&self, request: RequestedSwap) -> Result<(), SwapError> {
        let decision = match self.inner.ctx.chains.get(request.asset) {
            None => Decision::Reject(format!("asset {} is not enabled", request.asset)),
            Some(_) => self.inner.policy.evaluate(&request),
        };

        let id = request.swap_id.clone();
        match decision {
            Decision::Reject(reason) => {
                let rejected = RequestedSwap {
                    rejection: Some(reason.clone()),
                    ..request.clone()
                };
                self.persist(move |store| store.put_requested(&rejected)).await?;
                warn!(
                    swap_id = %request.swap_id,
                    peer_id = %request.peer_id,
                    asset = %request.asset,
                    amount_sat = request.amount_sat,
                    reason = %reason,
                    "swap request rejected"
                );
                let cancel = WireMessage::Swap(SwapMessage::new(
                    &request.swap_id,
                    SwapMessageBody::Cancel {
                        reason: reason.clone(),
                    },
                ));
                if let Err(err) =
                    send_wire(self.inner.ctx.messenger.as_ref(), &request.peer_id, &cancel).await
                {
                    warn!(swap_id = %request.swap_id, error = %err, "send rejection failed");
                }
                Err(SwapError::PolicyRejected(reason))
            }
            Decision::Accept => {
                let swap = Swap::new_responder(&request, Utc::now());
                self.persist_created(&swap).await?;
                self.persist(move |store| store.remove_requested(&id)).await?;
                info!(
                    swap_id = %swap.id,
                    peer_id = %swap.peer_id,
                    asset = %swap.asset,
                    kind = %swap.kind,
                    amount_sat = swap.amount_sat,
                    "swap request accepted"
                );
                self.spawn_unit(swap, true);
                Ok(())
            }
        }
    }

    async fn persist_created(&self, swap: &Swap) -> Result<(), SwapError> {
        let record = swap.clone();
        self.persist(move |store| {
            let created = Transition::Created {
                swap: Box::new(record.clone()),
            };
            store.record_transition(&record, &created, record.created_at)
        })
        .await
        .map(|_| ())
    }

    fn spawn_unit(&self, swap: Swap, kick: bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        if kick {
            let _ = tx.send(SwapInput::Kick);
        }
        let machine = SwapMachine::new(swap, self.inner.ctx.clone(), tx.clone());
        self.run_unit(machine, tx, rx);
    }

    fn run_unit(
        &self,
        mut machine: SwapMachine,
        tx: mpsc::UnboundedSender<SwapInput>,
        mut rx: mpsc::UnboundedReceiver<SwapInput>,
    ) {
        let swap_id = machine.swap().id.clone();
        self.units().insert(
            swap_id.clone(),
            Unit {
                peer_id: machine.swap().peer_id.clone(),
                inbox: tx,
            },
        );

        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    input = rx.recv() => match input {
                        Some(input) => input,
                        None => break,
                    },
                };
                match machine.process(input).await {
                    Ok(()) => {}
                    Err(err @ (SwapError::PersistenceFailure(_) | SwapError::Halted)) => {
                        error!(swap_id = %swap_id, error = %err, "swap unit stopped");
                        break;
                    }
                    Err(err) => warn!(swap_id = %swap_id, error = %err, "swap input rejected"),
                }
                if machine.swap().state.is_terminal() {
                    info!(swap_id = %swap_id, state = %machine.swap().state, "swap finished");
                    break;
                }
            }
            inner
                .units
                .lock()
                .expect("registry mutex poisoned")
                .remove(&swap_id);
        });
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Whether a swap with this id is live or stored.
    async fn is_known(&self, swap_id: &str) -> Result<bool, SwapError> {
        let active = self.units().contains_key(swap_id);
        if active {
            return Ok(true);
        }
        let id = swap_id.to_string();
        let stored = self
            .blocking(move |store| store.get(&id))
            .await
            .map_err(SwapError::Other)?;
        Ok(stored.is_some())
    }

    fn ensure_running(&self) -> Result<(), SwapError> {
        if self.is_halted() {
            return Err(SwapError::Halted);
        }
        Ok(())
    }

    /// Runs a store call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SwapStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.inner.ctx.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .context("store task failed")?
    }

    /// Like `blocking`, for writes: a failure halts the service.
    async fn persist<T, F>(&self, f: F) -> Result<T, SwapError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SwapStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.blocking(f).await.map_err(|err| {
            self.inner.ctx.halted.store(true, Ordering::SeqCst);
            error!(error = %format!("{err:#}"), "swap store write failed; halting");
            SwapError::PersistenceFailure(err)
        })
    }

    fn units(&self) -> std::sync::MutexGuard<'_, HashMap<String, Unit>> {
        self.inner.units.lock().expect("registry mutex poisoned")
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().expect("task mutex poisoned")
    }
}
