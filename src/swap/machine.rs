use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitcoin::hashes::{Hash as _, sha256};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{SwapMessage, SwapMessageBody, WireMessage};
use super::store::SwapStore;
use super::{Asset, HtlcParams, OpeningTx, Role, Swap, SwapState, Transition, decode_32};
use crate::config::SwapServiceConfig;
use crate::error::SwapError;
use crate::lightning::Lightning;
use crate::onchain::{OnChain, OnChainServices, OpeningCheck, SignedTx};
use crate::peer::{PeerMessenger, send_wire};
use crate::retry::{retry_with_timeout, with_timeout};
use crate::txwatcher::{ChainEventKind, ChainWatcher};

/// Collaborators shared by every swap unit.
pub struct MachineContext {
    pub cfg: SwapServiceConfig,
    pub store: Arc<dyn SwapStore>,
    pub chains: OnChainServices,
    pub watchers: HashMap<Asset, ChainWatcher>,
    pub lightning: Arc<dyn Lightning>,
    pub messenger: Arc<dyn PeerMessenger>,
    /// Set after a failed durable write; no swap advances until restart.
    pub halted: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub enum SwapInput {
    /// Re-run the automatic steps, e.g. after a backoff delay.
    Kick,
    Message(SwapMessageBody),
    Chain(ChainEventKind),
    InvoiceSettled { preimage: String },
}

/// One swap's state machine. Owned by a single task, so at most one
/// transition runs per swap at a time.
pub struct SwapMachine {
    swap: Swap,
    ctx: Arc<MachineContext>,
    inbox: mpsc::UnboundedSender<SwapInput>,
    attempts: u32,
    refund_due: bool,
    settled_preimage: Option<String>,
    pending_claim_txid: Option<String>,
    settlement_watch: Option<JoinHandle<()>>,
}

impl Drop for SwapMachine {
    fn drop(&mut self) {
        if let Some(task) = self.settlement_watch.take() {
            task.abort();
        }
    }
}

impl SwapMachine {
    pub fn new(swap: Swap, ctx: Arc<MachineContext>, inbox: mpsc::UnboundedSender<SwapInput>) -> Self {
        Self {
            swap,
            ctx,
            inbox,
            attempts: 0,
            refund_due: false,
            settled_preimage: None,
            pending_claim_txid: None,
            settlement_watch: None,
        }
    }

    pub fn swap(&self) -> &Swap {
        &self.swap
    }

    /// Prepares a swap loaded from the store: re-arms its watches and reports
    /// whether a local step is waiting to run.
    pub async fn resume(&mut self) -> bool {
        use SwapState::*;

        self.arm_watches();
        let state = self.swap.state;
        let funder = self.swap.is_funder();

        if funder && self.swap.prepared_spend.is_some() && state.can_transition_to(RefundTxBroadcast) {
            self.refund_due = true;
        }
        if !funder && state == ClaimTxBroadcast
            && let Some(txid) = self.swap.claim_tx_id.clone()
        {
            self.notify(SwapMessageBody::ClaimTxBroadcast { txid }).await;
        }

        match state {
            Created | RequestReceived => true,
            Agreed => funder,
            OpeningTxConfirmed | ClaimInvoicePaid => !funder,
            _ => self.refund_due,
        }
    }

    /// Applies one input, then runs every automatic step that follows from it.
    /// Transient failures are rescheduled with backoff instead of returned.
    pub async fn process(&mut self, input: SwapInput) -> Result<(), SwapError> {
        if let Err(err) = self.handle(input.clone()).await {
            if !err.is_transient() {
                return Err(err);
            }
            return self.retry_later(input, err).await;
        }
        match self.drive().await {
            Ok(()) => {
                self.attempts = 0;
                Ok(())
            }
            Err(err) if err.is_transient() => self.retry_later(SwapInput::Kick, err).await,
            Err(err) => Err(err),
        }
    }

    async fn retry_later(&mut self, input: SwapInput, err: SwapError) -> Result<(), SwapError> {
        if self.swap.state.is_terminal() {
            return Ok(());
        }
        self.attempts = self.attempts.saturating_add(1);

        // Nothing is locked on chain yet, so giving up is safe.
        let give_up = !self.swap.state.is_post_opening()
            && self.swap.opening_tx.is_none()
            && self.attempts as usize > self.ctx.cfg.retry.max_retries;
        if give_up {
            warn!(swap_id = %self.swap.id, error = %err, "retries exhausted; canceling swap");
            return self.cancel_with_notice(err.to_string()).await;
        }

        let delay = self.ctx.cfg.retry.backoff(self.attempts - 1);
        warn!(
            swap_id = %self.swap.id,
            state = %self.swap.state,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "swap step failed; retrying"
        );
        self.schedule(input, delay);
        Ok(())
    }

    fn schedule(&self, input: SwapInput, delay: Duration) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(input);
        });
    }

    async fn handle(&mut self, input: SwapInput) -> Result<(), SwapError> {
        match input {
            SwapInput::Kick => Ok(()),
            SwapInput::Message(body) => self.on_message(body).await,
            SwapInput::Chain(kind) => self.on_chain_event(kind).await,
            SwapInput::InvoiceSettled { preimage } => {
                self.on_invoice_settled(preimage);
                Ok(())
            }
        }
    }

    async fn on_message(&mut self, body: SwapMessageBody) -> Result<(), SwapError> {
        use SwapState::*;

        if self.swap.state.is_terminal() {
            debug!(swap_id = %self.swap.id, "message for finished swap ignored");
            return Ok(());
        }
        match body {
            SwapMessageBody::Request { .. } => Err(SwapError::InvalidMessage(
                "request for an existing swap".into(),
            )),
            SwapMessageBody::Agreement { kind, claim_pubkey } => {
                if self.swap.role != Role::Initiator || self.swap.state != RequestSent {
                    return Err(SwapError::InvalidMessage(format!(
                        "unexpected agreement in state {}",
                        self.swap.state
                    )));
                }
                if kind != self.swap.kind {
                    return Err(SwapError::InvalidMessage(format!(
                        "agreement for a {kind} swap, requested {}",
                        self.swap.kind
                    )));
                }
                self.commit(Transition::Agreed {
                    peer_pubkey: claim_pubkey,
                })
                .await
            }
            SwapMessageBody::OpeningTxBroadcast {
                htlc_hash,
                claim_pubkey,
                funder_pubkey,
                timeout_height,
                txid,
                vout,
                invoice,
            } => {
                if self.swap.is_funder() || self.swap.state != Agreed {
                    return Err(SwapError::InvalidMessage(format!(
                        "unexpected opening tx in state {}",
                        self.swap.state
                    )));
                }
                let htlc = HtlcParams {
                    payment_hash: htlc_hash,
                    claimer_pubkey: claim_pubkey,
                    funder_pubkey,
                    timeout_height,
                };
                let opening = OpeningTx {
                    txid,
                    vout,
                    tx_hex: None,
                };
                self.accept_opening(htlc, invoice, opening).await
            }
            SwapMessageBody::ClaimTxBroadcast { txid } => self.on_claim_message(txid).await,
            SwapMessageBody::Cancel { reason } => self.on_cancel(reason).await,
        }
    }

    /// Claimer side: checks the funder's opening announcement before recording it.
    async fn accept_opening(
        &mut self,
        htlc: HtlcParams,
        invoice: String,
        opening: OpeningTx,
    ) -> Result<(), SwapError> {
        let local = self.swap.local_pubkey()?;
        let problem = if htlc.claimer_pubkey != local {
            Some("htlc claim key is not ours".to_string())
        } else if self.swap.peer_pubkey.as_deref() != Some(htlc.funder_pubkey.as_str()) {
            Some("htlc funder key differs from the agreed key".to_string())
        } else {
            match self.ctx.lightning.decode_invoice(&invoice) {
                Err(err) => Some(format!("undecodable invoice: {err:#}")),
                Ok(decoded) if decoded.payment_hash != htlc.payment_hash => {
                    Some("invoice hash differs from htlc hash".to_string())
                }
                Ok(decoded) if decoded.amount_msat != Some(self.swap.amount_msat()) => Some(format!(
                    "invoice amount {:?} msat, expected {}",
                    decoded.amount_msat,
                    self.swap.amount_msat()
                )),
                Ok(_) => None,
            }
        };

        // The timeout is checked again before paying, so an unreachable chain is not fatal here.
        let problem = match problem {
            Some(problem) => Some(problem),
            None => match self.current_height().await {
                Ok(height) if htlc.is_expired_at(height) => Some(format!(
                    "htlc timeout {} already reached at height {height}",
                    htlc.timeout_height
                )),
                Ok(_) => None,
                Err(err) => {
                    debug!(swap_id = %self.swap.id, error = %err, "height check deferred");
                    None
                }
            },
        };

        if let Some(reason) = problem {
            warn!(swap_id = %self.swap.id, reason = %reason, "rejecting opening tx");
            return self.cancel_with_notice(reason).await;
        }
        self.commit(Transition::OpeningBroadcast {
            htlc,
            invoice,
            opening,
        })
        .await
    }

    async fn on_claim_message(&mut self, txid: String) -> Result<(), SwapError> {
        use SwapState::*;

        if !self.swap.is_funder() {
            return Err(SwapError::InvalidMessage("claim tx sent to the claimer".into()));
        }
        if self.swap.state == ClaimTxBroadcast && self.swap.claim_tx_id.as_deref() == Some(txid.as_str()) {
            return Ok(());
        }
        if !self.learn_claim(txid).await? {
            return Err(SwapError::InvalidMessage(format!(
                "unexpected claim tx in state {}",
                self.swap.state
            )));
        }
        Ok(())
    }

    /// Funder: remembers the claim txid until the invoice settlement lets it be
    /// recorded. Returns false when the state has no room for a claim.
    async fn learn_claim(&mut self, txid: String) -> Result<bool, SwapError> {
        use SwapState::*;

        if !matches!(self.swap.state, OpeningTxBroadcast | OpeningTxConfirmed | ClaimInvoicePaid) {
            return Ok(false);
        }
        self.pending_claim_txid = Some(txid);
        if self.settled_preimage.is_none()
            && let Some(htlc) = self.swap.htlc.clone()
        {
            let preimage = self
                .call("received_preimage", self.ctx.lightning.received_preimage(&htlc.payment_hash))
                .await?;
            if let Some(preimage) = preimage {
                self.on_invoice_settled(preimage);
            }
        }
        Ok(true)
    }

    /// Whether `txid` is the refund this funder prepared.
    fn is_own_refund(&self, txid: &str) -> bool {
        self.swap.is_funder() && self.swap.prepared_spend.as_ref().is_some_and(|tx| tx.txid == txid)
    }

    async fn on_cancel(&mut self, reason: String) -> Result<(), SwapError> {
        use SwapState::*;

        let state = self.swap.state;
        let reason = format!("canceled by peer: {reason}");
        if !state.is_post_opening() {
            if self.swap.is_funder()
                && let (Some(htlc), Some(opening)) = (self.swap.htlc.clone(), self.swap.opening_tx.clone())
                && self.is_on_chain(&htlc, &opening.txid).await?
            {
                warn!(swap_id = %self.swap.id, "peer canceled but our opening tx is out; waiting for refund");
                return self.record_opening_broadcast().await;
            }
            return self.commit(Transition::Canceled { reason }).await;
        }
        if !self.swap.is_funder() && matches!(state, OpeningTxBroadcast | OpeningTxConfirmed) {
            return self.commit(Transition::Canceled { reason }).await;
        }
        info!(swap_id = %self.swap.id, state = %state, "cancel ignored after opening tx");
        Ok(())
    }

    async fn on_chain_event(&mut self, kind: ChainEventKind) -> Result<(), SwapError> {
        use SwapState::*;

        let swap_id = self.swap.id.clone();
        match kind {
            ChainEventKind::Confirmed { txid, height, .. } => {
                let s = &self.swap;
                let is = |id: &Option<String>| id.as_deref() == Some(txid.as_str());
                let transition = match s.state {
                    OpeningTxBroadcast if is(&s.opening_tx_id) => Transition::OpeningConfirmed { height },
                    ClaimTxBroadcast if is(&s.claim_tx_id) => Transition::ClaimConfirmed,
                    RefundTxBroadcast if is(&s.refund_tx_id) => Transition::RefundConfirmed,
                    state => {
                        debug!(swap_id = %swap_id, txid = %txid, state = %state, "confirmation not relevant");
                        return Ok(());
                    }
                };
                self.commit(transition).await
            }
            ChainEventKind::Spent { spender } => {
                if !self.swap.is_funder() || self.is_own_refund(&spender) {
                    return Ok(());
                }
                info!(swap_id = %swap_id, txid = %spender, state = %self.swap.state, "htlc output spent by claim tx");
                if !self.learn_claim(spender).await? {
                    debug!(swap_id = %swap_id, state = %self.swap.state, "htlc spend not relevant");
                }
                Ok(())
            }
            ChainEventKind::Vanished { txid } => {
                let err = SwapError::Reorg { txid };
                warn!(swap_id = %swap_id, state = %self.swap.state, error = %err, "waiting for tx to be mined again");
                Ok(())
            }
            ChainEventKind::HeightReached { height } => {
                let Some(htlc) = self.swap.htlc.clone() else {
                    return Ok(());
                };
                if !htlc.is_expired_at(height) {
                    return Ok(());
                }
                let err = SwapError::HtlcTimeoutExceeded {
                    timeout_height: htlc.timeout_height,
                    current_height: height,
                };
                let state = self.swap.state;
                if self.swap.is_funder() {
                    if state.can_transition_to(RefundTxBroadcast) {
                        warn!(swap_id = %swap_id, error = %err, "refunding");
                        self.refund_due = true;
                    }
                } else if matches!(state, OpeningTxBroadcast | OpeningTxConfirmed) {
                    warn!(swap_id = %swap_id, error = %err, "abandoning unpaid swap");
                    return self.commit(Transition::Canceled {
                        reason: err.to_string(),
                    })
                    .await;
                }
                Ok(())
            }
        }
    }

    fn on_invoice_settled(&mut self, preimage: String) {
        let Some(htlc) = &self.swap.htlc else {
            return;
        };
        match preimage_matches(&preimage, &htlc.payment_hash) {
            true => {
                debug!(swap_id = %self.swap.id, "swap invoice settled");
                self.settled_preimage = Some(preimage);
            }
            false => warn!(swap_id = %self.swap.id, "settled preimage does not match htlc hash"),
        }
    }

    async fn drive(&mut self) -> Result<(), SwapError> {
        while self.step().await? {}
        Ok(())
    }

    /// Runs the next automatic move, if any. Returns false when the swap
    /// waits for an outside event.
    async fn step(&mut self) -> Result<bool, SwapError> {
        use SwapState::*;

        let state = self.swap.state;
        if state.is_terminal() {
            return Ok(false);
        }
        let funder = self.swap.is_funder();

        if funder && self.refund_due {
            if state.can_transition_to(RefundTxBroadcast) {
                return self.refund().await;
            }
            self.refund_due = false;
        }

        match (state, self.swap.role) {
            (Created, Role::Initiator) => self.send_request().await,
            (Created, Role::Responder) => {
                self.commit(Transition::RequestReceived).await?;
                Ok(true)
            }
            (RequestReceived, _) => self.send_agreement().await,
            (Agreed, _) if funder && self.swap.htlc.is_none() => self.prepare_opening().await,
            (Agreed, _) if funder => self.broadcast_opening().await,
            (OpeningTxConfirmed, _) if !funder => self.pay_invoice().await,
            (ClaimInvoicePaid, _) if !funder => self.claim().await,
            (OpeningTxConfirmed, _) if self.settled_preimage.is_some() => {
                let preimage = self.settled_preimage.clone().unwrap_or_default();
                self.commit(Transition::InvoicePaid { preimage }).await?;
                Ok(true)
            }
            (ClaimInvoicePaid, _) if self.pending_claim_txid.is_some() => {
                let txid = self.pending_claim_txid.take().unwrap_or_default();
                self.commit(Transition::ClaimBroadcast { txid }).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn send_request(&mut self) -> Result<bool, SwapError> {
        let body = SwapMessageBody::Request {
            kind: self.swap.kind,
            asset: self.swap.asset,
            amount_sat: self.swap.amount_sat,
            claim_pubkey: self.swap.local_pubkey()?,
        };
        match self.send(body).await {
            Ok(()) => self.commit(Transition::RequestSent).await?,
            Err(err) => {
                self.commit(Transition::Canceled {
                    reason: format!("send request: {err}"),
                })
                .await?
            }
        }
        Ok(true)
    }

    async fn send_agreement(&mut self) -> Result<bool, SwapError> {
        let peer_pubkey = self
            .swap
            .peer_pubkey
            .clone()
            .ok_or_else(|| SwapError::Other(anyhow::anyhow!("responder without peer pubkey")))?;
        let body = SwapMessageBody::Agreement {
            kind: self.swap.kind,
            claim_pubkey: self.swap.local_pubkey()?,
        };
        match self.send(body).await {
            Ok(()) => self.commit(Transition::Agreed { peer_pubkey }).await?,
            Err(err) => {
                self.commit(Transition::Canceled {
                    reason: format!("send agreement: {err}"),
                })
                .await?
            }
        }
        Ok(true)
    }

    /// Funder: creates the invoice and signs the opening transaction. Nothing
    /// is broadcast yet.
    async fn prepare_opening(&mut self) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let params = self.ctx.cfg.asset(self.swap.asset).clone();
        let height = self.current_height().await?;

        let description = format!("peerswap {} {}", self.swap.asset, self.swap.id);
        let invoice = self
            .call(
                "create_invoice",
                self.ctx.lightning.create_invoice(
                    self.swap.amount_msat(),
                    &description,
                    self.ctx.cfg.invoice_expiry_secs,
                ),
            )
            .await?;

        let htlc = HtlcParams {
            payment_hash: invoice.payment_hash,
            claimer_pubkey: self
                .swap
                .peer_pubkey
                .clone()
                .ok_or_else(|| SwapError::Other(anyhow::anyhow!("funder without peer pubkey")))?,
            funder_pubkey: self.swap.local_pubkey()?,
            timeout_height: height.saturating_add(params.timeout_delta_blocks),
        };

        let opening = match self
            .call("build_opening_tx", chain.build_opening_tx(&htlc, self.swap.amount_sat))
            .await
        {
            Ok(opening) => opening,
            Err(err) => {
                let err = SwapError::InsufficientFunds(format!("{err}"));
                warn!(swap_id = %self.swap.id, error = %err, "cannot fund opening tx");
                self.cancel_with_notice(err.to_string()).await?;
                return Ok(true);
            }
        };

        self.commit(Transition::OpeningPrepared {
            htlc,
            invoice: invoice.bolt11,
            opening,
        })
        .await?;
        Ok(true)
    }

    async fn broadcast_opening(&mut self) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let (htlc, opening) = self.htlc_and_opening()?;

        if !self.is_on_chain(&htlc, &opening.txid).await? {
            let tx = SignedTx::from_opening(&opening)
                .ok_or_else(|| SwapError::Other(anyhow::anyhow!("prepared opening tx has no raw tx")))?;
            if let Err(err) = self.call("broadcast", chain.broadcast(&tx)).await {
                // A timed-out broadcast may still have reached the mempool.
                if !self.is_on_chain(&htlc, &opening.txid).await? {
                    let err = SwapError::BroadcastFailed(format!("{err}"));
                    warn!(swap_id = %self.swap.id, error = %err, "opening tx not broadcast");
                    self.cancel_with_notice(err.to_string()).await?;
                    if let Err(err) = chain.release_opening_tx(&opening).await {
                        warn!(swap_id = %self.swap.id, error = %format!("{err:#}"), "releasing opening inputs failed");
                    }
                    return Ok(true);
                }
            }
        } else {
            info!(swap_id = %self.swap.id, txid = %opening.txid, "opening tx already on chain");
        }

        self.record_opening_broadcast().await?;
        let invoice = self.swap.invoice.clone().unwrap_or_default();
        self.notify(SwapMessageBody::OpeningTxBroadcast {
            htlc_hash: htlc.payment_hash,
            claim_pubkey: htlc.claimer_pubkey,
            funder_pubkey: htlc.funder_pubkey,
            timeout_height: htlc.timeout_height,
            txid: opening.txid,
            vout: opening.vout,
            invoice,
        })
        .await;
        Ok(true)
    }

    async fn record_opening_broadcast(&mut self) -> Result<(), SwapError> {
        let (htlc, opening) = self.htlc_and_opening()?;
        let invoice = self
            .swap
            .invoice
            .clone()
            .ok_or_else(|| SwapError::Other(anyhow::anyhow!("prepared opening without invoice")))?;
        self.commit(Transition::OpeningBroadcast {
            htlc,
            invoice,
            opening,
        })
        .await
    }

    /// Claimer: verifies the confirmed opening output, then pays the invoice.
    async fn pay_invoice(&mut self) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let (htlc, opening) = self.htlc_and_opening()?;

        let height = self.current_height().await?;
        if htlc.is_expired_at(height) {
            let err = SwapError::HtlcTimeoutExceeded {
                timeout_height: htlc.timeout_height,
                current_height: height,
            };
            self.cancel_with_notice(err.to_string()).await?;
            return Ok(true);
        }

        let amount_sat = self.swap.amount_sat;
        let check = self
            .query("verify_opening_tx", || {
                let (chain, htlc, opening) = (chain.clone(), htlc.clone(), opening.clone());
                async move { chain.verify_opening_tx(&htlc, &opening, amount_sat).await }
            })
            .await?;
        if let OpeningCheck::Mismatch(reason) = check {
            warn!(swap_id = %self.swap.id, reason = %reason, "opening tx does not match agreement");
            self.cancel_with_notice(format!("opening tx mismatch: {reason}")).await?;
            return Ok(true);
        }

        let lightning = self.ctx.lightning.clone();
        let preimage = match self
            .call("paid_preimage", lightning.paid_preimage(&htlc.payment_hash))
            .await?
        {
            Some(preimage) => {
                info!(swap_id = %self.swap.id, "invoice already paid");
                preimage
            }
            None => {
                let invoice = self
                    .swap
                    .invoice
                    .clone()
                    .ok_or_else(|| SwapError::Other(anyhow::anyhow!("missing invoice")))?;
                info!(swap_id = %self.swap.id, amount_sat = self.swap.amount_sat, "paying swap invoice");
                self.call("pay_invoice", lightning.pay_invoice(&invoice)).await?
            }
        };
        if !preimage_matches(&preimage, &htlc.payment_hash) {
            return Err(SwapError::Other(anyhow::anyhow!(
                "payment preimage does not match htlc hash"
            )));
        }

        self.commit(Transition::InvoicePaid { preimage }).await?;
        Ok(true)
    }

    async fn claim(&mut self) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let (htlc, opening) = self.htlc_and_opening()?;

        let Some(tx) = self.swap.prepared_spend.clone() else {
            let preimage = self
                .swap
                .preimage
                .as_deref()
                .ok_or_else(|| SwapError::Other(anyhow::anyhow!("claim without preimage")))
                .and_then(|p| decode_32(p).map_err(SwapError::Other))?;
            let tx = self
                .call(
                    "build_claim_tx",
                    chain.build_claim_tx(
                        &htlc,
                        &opening,
                        self.swap.amount_sat,
                        &preimage,
                        &self.swap.local_secret,
                    ),
                )
                .await?;
            self.commit(Transition::SpendPrepared { tx }).await?;
            return Ok(true);
        };

        self.publish(chain.as_ref(), &htlc, &tx).await?;
        self.commit(Transition::ClaimBroadcast {
            txid: tx.txid.clone(),
        })
        .await?;
        self.notify(SwapMessageBody::ClaimTxBroadcast { txid: tx.txid }).await;
        Ok(true)
    }

    async fn refund(&mut self) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let (htlc, opening) = self.htlc_and_opening()?;

        if let Some(spender) = self.find_spend(&htlc, &opening).await?
            && !self.is_own_refund(&spender)
        {
            info!(swap_id = %self.swap.id, txid = %spender, "htlc already claimed; no refund");
            self.refund_due = false;
            self.learn_claim(spender).await?;
            return Ok(true);
        }

        let Some(tx) = self.swap.prepared_spend.clone() else {
            let height = self.current_height().await?;
            if !htlc.is_expired_at(height) {
                self.refund_due = false;
                return Ok(false);
            }
            let tx = self
                .call(
                    "build_refund_tx",
                    chain.build_refund_tx(&htlc, &opening, self.swap.amount_sat, &self.swap.local_secret),
                )
                .await?;
            self.commit(Transition::SpendPrepared { tx }).await?;
            return Ok(true);
        };

        self.publish(chain.as_ref(), &htlc, &tx).await?;
        self.commit(Transition::RefundBroadcast { txid: tx.txid }).await?;
        self.refund_due = false;
        Ok(true)
    }

    /// Broadcasts `tx` unless the chain already knows it.
    async fn publish(&self, chain: &dyn OnChain, htlc: &HtlcParams, tx: &SignedTx) -> Result<(), SwapError> {
        if self.is_on_chain(htlc, &tx.txid).await? {
            info!(swap_id = %self.swap.id, txid = %tx.txid, "tx already on chain");
            return Ok(());
        }
        self.call("broadcast", chain.broadcast(tx))
            .await
            .map_err(|e| SwapError::BroadcastFailed(format!("{e}")))?;
        Ok(())
    }

    /// Validates, persists and then adopts one transition.
    async fn commit(&mut self, transition: Transition) -> Result<(), SwapError> {
        if self.ctx.halted.load(Ordering::SeqCst) {
            return Err(SwapError::Halted);
        }
        let at = Utc::now();
        let mut next = self.swap.clone();
        next.apply(&transition, at)?;

        let store = self.ctx.store.clone();
        let (record, step) = (next.clone(), transition.clone());
        let persisted = tokio::task::spawn_blocking(move || store.record_transition(&record, &step, at))
            .await
            .map_err(|e| anyhow::anyhow!("store task failed: {e}"))
            .and_then(|res| res);
        let seq = match persisted {
            Ok(seq) => seq,
            Err(err) => {
                self.ctx.halted.store(true, Ordering::SeqCst);
                error!(
                    swap_id = %self.swap.id,
                    transition = transition.name(),
                    error = %format!("{err:#}"),
                    "persisting swap transition failed; halting"
                );
                return Err(SwapError::PersistenceFailure(err));
            }
        };

        info!(
            swap_id = %self.swap.id,
            peer_id = %self.swap.peer_id,
            asset = %self.swap.asset,
            from = %self.swap.state,
            to = %next.state,
            transition = transition.name(),
            seq,
            "swap transition"
        );
        self.swap = next;
        self.after_commit(&transition);
        Ok(())
    }

    fn after_commit(&mut self, transition: &Transition) {
        if self.swap.state.is_terminal() {
            if let Some(watcher) = self.watcher() {
                watcher.unwatch_swap(&self.swap.id);
            }
            if let Some(task) = self.settlement_watch.take() {
                task.abort();
            }
            return;
        }
        match transition {
            Transition::OpeningBroadcast { .. }
            | Transition::ClaimBroadcast { .. }
            | Transition::RefundBroadcast { .. } => self.arm_watches(),
            Transition::InvoicePaid { .. } => {
                if let Some(task) = self.settlement_watch.take() {
                    task.abort();
                }
            }
            _ => {}
        }
    }

    /// Registers the chain watches the current state depends on. Idempotent.
    fn arm_watches(&mut self) {
        use SwapState::*;

        let state = self.swap.state;
        if !state.is_post_opening() {
            return;
        }
        let (Some(watcher), Some(chain), Some(htlc)) = (self.watcher(), self.chain().ok(), self.swap.htlc.clone())
        else {
            return;
        };
        let spk = match chain.htlc_script_pubkey(&htlc) {
            Ok(spk) => spk,
            Err(err) => {
                error!(swap_id = %self.swap.id, error = %format!("{err:#}"), "cannot derive htlc script");
                return;
            }
        };

        let id = self.swap.id.clone();
        let txid = match state {
            OpeningTxBroadcast => self.swap.opening_tx_id.clone(),
            ClaimTxBroadcast => self.swap.claim_tx_id.clone(),
            RefundTxBroadcast => self.swap.refund_tx_id.clone(),
            _ => None,
        };
        if let Some(txid) = txid {
            watcher.watch_tx(&id, &txid, &spk);
        }
        if state != RefundTxBroadcast {
            watcher.watch_height(&id, htlc.timeout_height);
        }

        // The claimer's notice is best effort; the funder also watches the
        // htlc output itself.
        let funder = self.swap.is_funder();
        match &self.swap.opening_tx {
            Some(opening) if funder && matches!(state, OpeningTxBroadcast | OpeningTxConfirmed | ClaimInvoicePaid) => {
                watcher.watch_spend(&id, &opening.txid, opening.vout, &spk);
            }
            _ => watcher.unwatch_spend(&id),
        }
        if funder && matches!(state, OpeningTxBroadcast | OpeningTxConfirmed) {
            self.start_settlement_watch(htlc.payment_hash);
        }
    }

    /// Funder: polls the Lightning backend until the swap invoice settles.
    fn start_settlement_watch(&mut self, payment_hash: String) {
        if self.settlement_watch.is_some() || self.settled_preimage.is_some() {
            return;
        }
        let lightning = self.ctx.lightning.clone();
        let inbox = self.inbox.clone();
        let interval = self.ctx.cfg.invoice_poll_interval;
        let limit = self.ctx.cfg.rpc_timeout;
        let swap_id = self.swap.id.clone();
        self.settlement_watch = Some(tokio::spawn(async move {
            loop {
                match with_timeout("received_preimage", limit, lightning.received_preimage(&payment_hash)).await {
                    Ok(Some(preimage)) => {
                        let _ = inbox.send(SwapInput::InvoiceSettled { preimage });
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(swap_id = %swap_id, error = %format!("{err:#}"), "settlement check failed")
                    }
                }
                if inbox.is_closed() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    async fn cancel_with_notice(&mut self, reason: String) -> Result<(), SwapError> {
        self.commit(Transition::Canceled {
            reason: reason.clone(),
        })
        .await?;
        self.notify(SwapMessageBody::Cancel { reason }).await;
        Ok(())
    }

    async fn send(&self, body: SwapMessageBody) -> Result<(), SwapError> {
        let message = WireMessage::Swap(SwapMessage::new(&self.swap.id, body));
        send_wire(self.ctx.messenger.as_ref(), &self.swap.peer_id, &message).await
    }

    /// Best-effort send; the peer learns the outcome from the chain otherwise.
    async fn notify(&self, body: SwapMessageBody) {
        if let Err(err) = self.send(body).await {
            warn!(swap_id = %self.swap.id, peer_id = %self.swap.peer_id, error = %err, "peer notification failed");
        }
    }

    async fn is_on_chain(&self, htlc: &HtlcParams, txid: &str) -> Result<bool, SwapError> {
        let chain = self.chain()?;
        let spk = chain.htlc_script_pubkey(htlc)?;
        let confs = self
            .query("get_confirmations", || {
                let (chain, txid, spk) = (chain.clone(), txid.to_string(), spk.clone());
                async move { chain.get_confirmations(&txid, &spk).await }
            })
            .await?;
        Ok(confs.is_some())
    }

    async fn find_spend(&self, htlc: &HtlcParams, opening: &OpeningTx) -> Result<Option<String>, SwapError> {
        let chain = self.chain()?;
        let spk = chain.htlc_script_pubkey(htlc)?;
        self.query("find_spend", || {
            let (chain, txid, spk) = (chain.clone(), opening.txid.clone(), spk.clone());
            let vout = opening.vout;
            async move { chain.find_spend(&txid, vout, &spk).await }
        })
        .await
    }

    async fn current_height(&self) -> Result<u32, SwapError> {
        let chain = self.chain()?;
        self.query("current_height", || {
            let chain = chain.clone();
            async move { chain.current_height().await }
        })
        .await
    }

    /// Idempotent chain read, retried before it counts as unavailable.
    async fn query<T, F, Fut>(&self, label: &str, action: F) -> Result<T, SwapError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        retry_with_timeout(label, &self.ctx.cfg.retry, action)
            .await
            .map_err(|e| SwapError::ChainQueryUnavailable(format!("{e:#}")))
    }

    async fn call<T>(&self, label: &str, fut: impl Future<Output = anyhow::Result<T>>) -> Result<T, SwapError> {
        with_timeout(label, self.ctx.cfg.rpc_timeout, fut)
            .await
            .map_err(SwapError::Other)
    }

    fn chain(&self) -> Result<Arc<dyn OnChain>, SwapError> {
        self.ctx
            .chains
            .get(self.swap.asset)
            .cloned()
            .ok_or(SwapError::UnsupportedAsset(self.swap.asset))
    }

    fn watcher(&self) -> Option<ChainWatcher> {
        self.ctx.watchers.get(&self.swap.asset).cloned()
    }

    fn htlc_and_opening(&self) -> Result<(HtlcParams, OpeningTx), SwapError> {
        match (&self.swap.htlc, &self.swap.opening_tx) {
            (Some(htlc), Some(opening)) => Ok((htlc.clone(), opening.clone())),
            _ => Err(SwapError::Other(anyhow::anyhow!(
                "swap {} has no opening tx in state {}",
                self.swap.id,
                self.swap.state
            ))),
        }
    }
}

fn preimage_matches(preimage_hex: &str, payment_hash_hex: &str) -> bool {
    match hex::decode(preimage_hex) {
        Ok(bytes) => hex::encode(sha256::Hash::hash(&bytes).to_byte_array()) == payment_hash_hex,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_check_uses_sha256() {
        let preimage = [7u8; 32];
        let hash = hex::encode(sha256::Hash::hash(&preimage).to_byte_array());
        assert!(preimage_matches(&hex::encode(preimage), &hash));
        assert!(!preimage_matches(&hex::encode([8u8; 32]), &hash));
        assert!(!preimage_matches("zz", &hash));
    }
}
