use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::swap::{Asset, HtlcParams, OpeningTx};

/// Read side of a chain backend, used by the chain watcher.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn current_height(&self) -> Result<u32>;

    /// `None` when the chain does not know the transaction, `Some(0)` while it
    /// sits in the mempool. `script_pubkey` is the hex HTLC script the
    /// transaction creates or spends.
    async fn get_confirmations(&self, txid: &str, script_pubkey: &str) -> Result<Option<u32>>;

    /// Txid of the transaction spending output `vout` of `txid`, in the mempool
    /// or in a block. `script_pubkey` is the hex script of that output.
    async fn find_spend(&self, txid: &str, vout: u32, script_pubkey: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub txid: String,
    pub tx_hex: String,
}

impl SignedTx {
    pub fn from_opening(opening: &OpeningTx) -> Option<Self> {
        opening.tx_hex.as_ref().map(|tx_hex| Self {
            txid: opening.txid.clone(),
            tx_hex: tx_hex.clone(),
        })
    }
}

/// Outcome of checking a counterparty's opening transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpeningCheck {
    Valid,
    Mismatch(String),
}

/// Builds, signs and broadcasts the HTLC transactions of one asset.
#[async_trait]
pub trait OnChain: ChainSource {
    fn asset(&self) -> Asset;

    /// Hex script_pubkey of the HTLC output.
    fn htlc_script_pubkey(&self, htlc: &HtlcParams) -> Result<String>;

    /// Funds the HTLC output from the node wallet and signs, without broadcasting.
    async fn build_opening_tx(&self, htlc: &HtlcParams, amount_sat: u64) -> Result<OpeningTx>;

    /// Checks that the opening output pays the HTLC script with `amount_sat`.
    async fn verify_opening_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
    ) -> Result<OpeningCheck>;

    async fn build_claim_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
        preimage: &[u8; 32],
        secret_key_hex: &str,
    ) -> Result<SignedTx>;

    async fn build_refund_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
        secret_key_hex: &str,
    ) -> Result<SignedTx>;

    /// Releases wallet inputs reserved by an opening tx that will never be
    /// broadcast.
    async fn release_opening_tx(&self, _opening: &OpeningTx) -> Result<()> {
        Ok(())
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String>;
}

/// On-chain services of the enabled assets, selected by a swap's `asset`.
#[derive(Clone, Default)]
pub struct OnChainServices {
    services: HashMap<Asset, Arc<dyn OnChain>>,
}

impl OnChainServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Arc<dyn OnChain>) {
        self.services.insert(service.asset(), service);
    }

    pub fn get(&self, asset: Asset) -> Option<&Arc<dyn OnChain>> {
        self.services.get(&asset)
    }

    /// Enabled assets in stable order.
    pub fn assets(&self) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self.services.keys().copied().collect();
        assets.sort();
        assets
    }
}
