use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};

use peerswap::onchain::{ChainSource, OnChain, OpeningCheck, SignedTx};
use peerswap::swap::{Asset, HtlcParams, OpeningTx};

pub const START_HEIGHT: u32 = 100;

#[derive(Debug, Clone)]
struct MinedTx {
    tx_hex: String,
    /// `None` while in the mempool.
    height: Option<u32>,
}

#[derive(Default)]
struct State {
    height: u32,
    txs: HashMap<String, MinedTx>,
    dropped: HashMap<String, MinedTx>,
    /// Opening txid -> the txid that spent it.
    spends: HashMap<String, String>,
    broadcasts: Vec<String>,
    nonce: u64,
}

/// In-memory chain shared by every node of a test. Transactions are plain
/// strings; their txid is the sha256 of that string.
pub struct MockChain {
    asset: Asset,
    unavailable: AtomicBool,
    empty_wallet: AtomicBool,
    reject_broadcasts: AtomicBool,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            unavailable: AtomicBool::new(false),
            empty_wallet: AtomicBool::new(false),
            reject_broadcasts: AtomicBool::new(false),
            state: Mutex::new(State {
                height: START_HEIGHT,
                ..State::default()
            }),
        }
    }

    pub fn height(&self) -> u32 {
        self.lock().height
    }

    /// Mines `blocks` blocks, confirming everything in the mempool.
    pub fn mine(&self, blocks: u32) {
        let mut state = self.lock();
        for _ in 0..blocks {
            state.height += 1;
            let height = state.height;
            for tx in state.txs.values_mut() {
                if tx.height.is_none() {
                    tx.height = Some(height);
                }
            }
        }
    }

    /// Drops a transaction from the chain and the mempool, as if reorged out
    /// and evicted.
    pub fn reorg_out(&self, txid: &str) {
        let mut state = self.lock();
        if let Some(mut tx) = state.txs.remove(txid) {
            tx.height = None;
            state.dropped.insert(txid.to_string(), tx);
        }
        state.spends.retain(|_, spender| spender.as_str() != txid);
    }

    /// Puts every reorged transaction back into the mempool.
    pub fn restore_dropped(&self) {
        let mut state = self.lock();
        let dropped: Vec<(String, MinedTx)> = state.dropped.drain().collect();
        for (txid, tx) in dropped {
            if let Some(opening) = spent_opening(&tx.tx_hex) {
                state.spends.insert(opening, txid.clone());
            }
            state.txs.insert(txid, tx);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Opening transactions can no longer be funded.
    pub fn set_empty_wallet(&self, empty: bool) {
        self.empty_wallet.store(empty, Ordering::SeqCst);
    }

    /// Every broadcast is refused, as by a node that rejects the tx.
    pub fn set_reject_broadcasts(&self, reject: bool) {
        self.reject_broadcasts.store(reject, Ordering::SeqCst);
    }

    /// Txid that spent the output of `opening_txid`, if any.
    pub fn spender_of(&self, opening_txid: &str) -> Option<String> {
        self.lock().spends.get(opening_txid).cloned()
    }

    /// How many times `txid` was handed to `broadcast`.
    pub fn broadcast_count(&self, txid: &str) -> usize {
        self.lock().broadcasts.iter().filter(|t| *t == txid).count()
    }

    pub fn confirmations(&self, txid: &str) -> Option<u32> {
        let state = self.lock();
        confs(&state, txid)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("chain mutex poisoned")
    }

    fn check_available(&self) -> Result<()> {
        anyhow::ensure!(!self.unavailable.load(Ordering::SeqCst), "chain backend unreachable");
        Ok(())
    }
}

fn confs(state: &State, txid: &str) -> Option<u32> {
    let tx = state.txs.get(txid)?;
    Some(match tx.height {
        Some(h) => state.height - h + 1,
        None => 0,
    })
}

/// Opening txid spent by a claim or refund tx string.
fn spent_opening(tx_hex: &str) -> Option<String> {
    let mut parts = tx_hex.split('|');
    match parts.next() {
        Some("claim" | "refund") => parts.next().map(str::to_string),
        _ => None,
    }
}

fn txid_of(tx_hex: &str) -> String {
    hex::encode(sha256::Hash::hash(tx_hex.as_bytes()).to_byte_array())
}

fn signed(tx_hex: String) -> SignedTx {
    SignedTx {
        txid: txid_of(&tx_hex),
        tx_hex,
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn current_height(&self) -> Result<u32> {
        self.check_available()?;
        Ok(self.height())
    }

    async fn get_confirmations(&self, txid: &str, _script_pubkey: &str) -> Result<Option<u32>> {
        self.check_available()?;
        Ok(self.confirmations(txid))
    }

    async fn find_spend(&self, txid: &str, vout: u32, _script_pubkey: &str) -> Result<Option<String>> {
        self.check_available()?;
        if vout != 0 {
            return Ok(None);
        }
        Ok(self.spender_of(txid))
    }
}

#[async_trait]
impl OnChain for MockChain {
    fn asset(&self) -> Asset {
        self.asset
    }

    fn htlc_script_pubkey(&self, htlc: &HtlcParams) -> Result<String> {
        let script = format!(
            "htlc:{}:{}:{}:{}",
            htlc.payment_hash, htlc.claimer_pubkey, htlc.funder_pubkey, htlc.timeout_height
        );
        Ok(txid_of(&script))
    }

    async fn build_opening_tx(&self, htlc: &HtlcParams, amount_sat: u64) -> Result<OpeningTx> {
        self.check_available()?;
        anyhow::ensure!(!self.empty_wallet.load(Ordering::SeqCst), "insufficient funds");
        let spk = self.htlc_script_pubkey(htlc)?;
        let nonce = {
            let mut state = self.lock();
            state.nonce += 1;
            state.nonce
        };
        let tx = signed(format!("open|{spk}|{amount_sat}|{nonce}"));
        Ok(OpeningTx {
            txid: tx.txid,
            vout: 0,
            tx_hex: Some(tx.tx_hex),
        })
    }

    async fn verify_opening_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
    ) -> Result<OpeningCheck> {
        self.check_available()?;
        let state = self.lock();
        let tx = state
            .txs
            .get(&opening.txid)
            .with_context(|| format!("unknown tx {}", opening.txid))?;
        let mut parts = tx.tx_hex.split('|').skip(1);
        let spk = parts.next().unwrap_or_default();
        let amount: u64 = parts.next().unwrap_or_default().parse().unwrap_or(0);
        if spk != self.htlc_script_pubkey(htlc)? {
            return Ok(OpeningCheck::Mismatch("output does not pay the htlc".into()));
        }
        if amount != amount_sat {
            return Ok(OpeningCheck::Mismatch(format!(
                "output value {amount}, expected {amount_sat}"
            )));
        }
        Ok(OpeningCheck::Valid)
    }

    async fn build_claim_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        _amount_sat: u64,
        preimage: &[u8; 32],
        _secret_key_hex: &str,
    ) -> Result<SignedTx> {
        let hash = hex::encode(sha256::Hash::hash(preimage).to_byte_array());
        anyhow::ensure!(hash == htlc.payment_hash, "preimage does not match htlc");
        Ok(signed(format!("claim|{}|{}", opening.txid, hex::encode(preimage))))
    }

    async fn build_refund_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        _amount_sat: u64,
        _secret_key_hex: &str,
    ) -> Result<SignedTx> {
        Ok(signed(format!("refund|{}|{}", opening.txid, htlc.timeout_height)))
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String> {
        self.check_available()?;
        let mut state = self.lock();
        state.broadcasts.push(tx.txid.clone());
        anyhow::ensure!(!self.reject_broadcasts.load(Ordering::SeqCst), "tx rejected by node");
        if state.txs.contains_key(&tx.txid) {
            return Ok(tx.txid.clone());
        }

        let mut parts = tx.tx_hex.split('|');
        let kind = parts.next().unwrap_or_default();
        if kind == "claim" || kind == "refund" {
            let opening = parts.next().unwrap_or_default().to_string();
            anyhow::ensure!(state.txs.contains_key(&opening), "missing inputs");
            if kind == "refund" {
                let timeout: u32 = parts.next().unwrap_or_default().parse().unwrap_or(u32::MAX);
                anyhow::ensure!(state.height >= timeout, "non-final");
            }
            if let Some(spender) = state.spends.get(&opening) {
                anyhow::bail!("input already spent by {spender}");
            }
            state.spends.insert(opening, tx.txid.clone());
        }

        state.txs.insert(
            tx.txid.clone(),
            MinedTx {
                tx_hex: tx.tx_hex.clone(),
                height: None,
            },
        );
        Ok(tx.txid.clone())
    }
}
