pub mod htlc;
pub mod wallet;

use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use lwk_wollet::elements::confidential;
use lwk_wollet::elements::encode;
use lwk_wollet::elements::{OutPoint, Script, Transaction, Txid};

use self::htlc::{HtlcOutput, HtlcSpec, claim_tx, refund_tx, secret_key_from_hex};
use self::wallet::LiquidWallet;
use crate::onchain::{ChainSource, OnChain, OpeningCheck, SignedTx};
use crate::swap::{Asset, HtlcParams, OpeningTx};

/// Liquid on-chain service. The wallet is blocking and guarded by a mutex;
/// calls run on the blocking pool.
#[derive(Clone)]
pub struct LiquidChain {
    wallet: Arc<Mutex<LiquidWallet>>,
    spend_fee_sat: u64,
}

impl LiquidChain {
    pub fn new(wallet: LiquidWallet, spend_fee_sat: u64) -> Self {
        Self {
            wallet: Arc::new(Mutex::new(wallet)),
            spend_fee_sat,
        }
    }

    async fn with_wallet<T, F>(&self, label: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LiquidWallet) -> Result<T> + Send + 'static,
    {
        let wallet = self.wallet.clone();
        tokio::task::spawn_blocking(move || {
            let mut wallet = wallet.lock().expect("wallet mutex poisoned");
            f(&mut wallet)
        })
        .await
        .with_context(|| format!("join {label}"))?
        .with_context(|| label.to_string())
    }

    async fn htlc_output(&self, opening: &OpeningTx, amount_sat: u64) -> Result<HtlcOutput> {
        let txid = Txid::from_str(&opening.txid).context("parse opening txid")?;
        let vout = opening.vout;
        let policy_asset = self
            .with_wallet("policy asset", |wallet| Ok(wallet.policy_asset()))
            .await?;
        Ok(HtlcOutput {
            txid,
            vout,
            amount_sat,
            policy_asset,
        })
    }
}

fn signed(tx: &Transaction) -> SignedTx {
    SignedTx {
        txid: tx.txid().to_string(),
        tx_hex: hex::encode(encode::serialize(tx)),
    }
}

#[async_trait]
impl ChainSource for LiquidChain {
    async fn current_height(&self) -> Result<u32> {
        self.with_wallet("liquid tip", |wallet| {
            wallet.sync()?;
            Ok(wallet.tip_height())
        })
        .await
    }

    async fn get_confirmations(&self, txid: &str, script_pubkey: &str) -> Result<Option<u32>> {
        let txid = Txid::from_str(txid).context("parse txid")?;
        let script = Script::from(hex::decode(script_pubkey).context("decode script_pubkey")?);
        self.with_wallet("liquid confirmations", move |wallet| {
            wallet.tx_confirmations_for_script(&script, &txid)
        })
        .await
    }

    async fn find_spend(&self, txid: &str, vout: u32, script_pubkey: &str) -> Result<Option<String>> {
        let outpoint = OutPoint::new(Txid::from_str(txid).context("parse txid")?, vout);
        let script = Script::from(hex::decode(script_pubkey).context("decode script_pubkey")?);
        let spender = self
            .with_wallet("liquid htlc spend", move |wallet| {
                wallet.find_spend_for_script(&script, outpoint)
            })
            .await?;
        Ok(spender.map(|txid| txid.to_string()))
    }
}

#[async_trait]
impl OnChain for LiquidChain {
    fn asset(&self) -> Asset {
        Asset::Liquid
    }

    fn htlc_script_pubkey(&self, htlc: &HtlcParams) -> Result<String> {
        let spec = HtlcSpec::from_params(htlc)?;
        Ok(hex::encode(spec.script_pubkey().as_bytes()))
    }

    async fn build_opening_tx(&self, htlc: &HtlcParams, amount_sat: u64) -> Result<OpeningTx> {
        let spec = HtlcSpec::from_params(htlc)?;
        let (tx, vout) = self
            .with_wallet("build liquid opening tx", move |wallet| {
                let address = spec.p2wsh_address(wallet.network().address_params());
                wallet.build_funding(&address, amount_sat)
            })
            .await?;
        let signed = signed(&tx);
        Ok(OpeningTx {
            txid: signed.txid,
            vout,
            tx_hex: Some(signed.tx_hex),
        })
    }

    async fn verify_opening_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
    ) -> Result<OpeningCheck> {
        let expected = HtlcSpec::from_params(htlc)?.script_pubkey();
        let txid = Txid::from_str(&opening.txid).context("parse opening txid")?;
        let vout = opening.vout as usize;

        self.with_wallet("verify liquid opening tx", move |wallet| {
            let Some(tx) = wallet.get_transaction(&txid)? else {
                return Ok(OpeningCheck::Mismatch(format!("opening tx {txid} not found")));
            };
            let Some(output) = tx.output.get(vout) else {
                return Ok(OpeningCheck::Mismatch(format!("opening tx has no output {vout}")));
            };
            if output.script_pubkey != expected {
                return Ok(OpeningCheck::Mismatch("output does not pay the htlc script".into()));
            }
            if output.asset != confidential::Asset::Explicit(wallet.policy_asset()) {
                return Ok(OpeningCheck::Mismatch("output is not explicit L-BTC".into()));
            }
            if output.value != confidential::Value::Explicit(amount_sat) {
                return Ok(OpeningCheck::Mismatch(format!(
                    "output value does not match {amount_sat} sat"
                )));
            }
            Ok(OpeningCheck::Valid)
        })
        .await
    }

    async fn build_claim_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
        preimage: &[u8; 32],
        secret_key_hex: &str,
    ) -> Result<SignedTx> {
        let spec = HtlcSpec::from_params(htlc)?;
        let key = secret_key_from_hex(secret_key_hex)?;
        let output = self.htlc_output(opening, amount_sat).await?;
        let destination = self
            .with_wallet("claim address", |wallet| wallet.new_address())
            .await?;
        let tx = claim_tx(&spec, &output, &destination, &key, *preimage, self.spend_fee_sat)?;
        Ok(signed(&tx))
    }

    async fn build_refund_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
        secret_key_hex: &str,
    ) -> Result<SignedTx> {
        let spec = HtlcSpec::from_params(htlc)?;
        let key = secret_key_from_hex(secret_key_hex)?;
        let output = self.htlc_output(opening, amount_sat).await?;
        let destination = self
            .with_wallet("refund address", |wallet| wallet.new_address())
            .await?;
        let tx = refund_tx(&spec, &output, &destination, &key, self.spend_fee_sat)?;
        Ok(signed(&tx))
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String> {
        let bytes = hex::decode(&tx.tx_hex).context("decode tx hex")?;
        let decoded: Transaction = encode::deserialize(&bytes).context("decode liquid tx")?;
        let txid = self
            .with_wallet("broadcast liquid tx", move |wallet| {
                wallet.broadcast_transaction(&decoded)
            })
            .await?;
        Ok(txid.to_string())
    }
}
