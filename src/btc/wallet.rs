use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::{Amount, Network, Transaction, TxOut, Txid};
use bitcoincore_rpc::json::FundRawTransactionOptions;
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use serde_json::json;

use super::htlc::{HtlcScript, claim_tx, refund_tx, secret_key_from_hex};
use crate::onchain::{ChainSource, OnChain, OpeningCheck, SignedTx};
use crate::swap::{Asset, HtlcParams, OpeningTx};

/// JSON-RPC error code bitcoind returns for unknown transactions.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

#[derive(Debug, Clone)]
pub enum BitcoinAuth {
    UserPass { user: String, password: String },
    CookieFile(PathBuf),
}

/// Bitcoin on-chain service backed by a bitcoind wallet.
///
/// The RPC client is blocking; every call runs on the blocking pool.
pub struct BitcoinWallet {
    client: Arc<Client>,
    network: Network,
    spend_fee_sat: u64,
}

impl BitcoinWallet {
    pub fn new(rpc_url: &str, auth: BitcoinAuth, network: Network, spend_fee_sat: u64) -> Result<Self> {
        let auth = match auth {
            BitcoinAuth::UserPass { user, password } => Auth::UserPass(user, password),
            BitcoinAuth::CookieFile(path) => Auth::CookieFile(path),
        };
        let client = Client::new(rpc_url, auth)
            .with_context(|| format!("create bitcoind rpc client {rpc_url}"))?;
        Ok(Self {
            client: Arc::new(client),
            network,
            spend_fee_sat,
        })
    }

    async fn rpc<T, F>(&self, label: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(client.as_ref()))
            .await
            .with_context(|| format!("join {label}"))?
            .with_context(|| label.to_string())
    }

    fn wallet_address(client: &Client, network: Network) -> Result<bitcoin::Address> {
        client
            .get_new_address(None, Some(bitcoincore_rpc::json::AddressType::Bech32))
            .context("getnewaddress")?
            .require_network(network)
            .context("wallet address network mismatch")
    }
}

fn is_not_found(err: &bitcoincore_rpc::Error) -> bool {
    matches!(
        err,
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::error::Error::Rpc(e))
            if e.code == RPC_INVALID_ADDRESS_OR_KEY
    )
}

#[async_trait]
impl ChainSource for BitcoinWallet {
    async fn current_height(&self) -> Result<u32> {
        let height = self
            .rpc("getblockcount", |client| {
                client.get_block_count().map_err(Into::into)
            })
            .await?;
        u32::try_from(height).context("block height out of range")
    }

    async fn get_confirmations(&self, txid: &str, _script_pubkey: &str) -> Result<Option<u32>> {
        let txid = Txid::from_str(txid).context("parse txid")?;
        self.rpc("getrawtransaction", move |client| {
            match client.get_raw_transaction_info(&txid, None) {
                Ok(info) => Ok(Some(info.confirmations.unwrap_or(0))),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn find_spend(&self, txid: &str, vout: u32, _script_pubkey: &str) -> Result<Option<String>> {
        let txid = Txid::from_str(txid).context("parse txid")?;
        self.rpc("find htlc spend", move |client| {
            if client
                .get_tx_out(&txid, vout, Some(true))
                .context("gettxout")?
                .is_some()
            {
                return Ok(None);
            }

            let prevout = json!([{ "txid": txid.to_string(), "vout": vout }]);
            let spending: Vec<serde_json::Value> = client
                .call("gettxspendingprevout", &[prevout])
                .context("gettxspendingprevout")?;
            if let Some(spender) = spending
                .iter()
                .find_map(|entry| entry.get("spendingtxid").and_then(|v| v.as_str()))
            {
                return Ok(Some(spender.to_string()));
            }

            // Spent in a block: scan from the block that confirmed the output.
            let info = match client.get_raw_transaction_info(&txid, None) {
                Ok(info) => info,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let Some(block_hash) = info.blockhash else {
                return Ok(None);
            };
            let start = client
                .get_block_header_info(&block_hash)
                .context("getblockheader")?
                .height as u64;
            let tip = client.get_block_count().context("getblockcount")?;
            for height in start..=tip {
                let hash = client.get_block_hash(height).context("getblockhash")?;
                let block = client.get_block(&hash).context("getblock")?;
                let spender = block.txdata.iter().find(|tx| {
                    tx.input.iter().any(|input| {
                        input.previous_output.txid == txid && input.previous_output.vout == vout
                    })
                });
                if let Some(tx) = spender {
                    return Ok(Some(tx.compute_txid().to_string()));
                }
            }
            Ok(None)
        })
        .await
    }
}

#[async_trait]
impl OnChain for BitcoinWallet {
    fn asset(&self) -> Asset {
        Asset::Bitcoin
    }

    fn htlc_script_pubkey(&self, htlc: &HtlcParams) -> Result<String> {
        let spk = HtlcScript::from_params(htlc)?.script_pubkey()?;
        Ok(hex::encode(spk.as_bytes()))
    }

    async fn build_opening_tx(&self, htlc: &HtlcParams, amount_sat: u64) -> Result<OpeningTx> {
        let script_pubkey = HtlcScript::from_params(htlc)?.script_pubkey()?;
        let unfunded = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(amount_sat),
                script_pubkey: script_pubkey.clone(),
            }],
        };

        let tx = self
            .rpc("fund opening tx", move |client| {
                // Inputs stay reserved until the opening tx is broadcast or released.
                let options = FundRawTransactionOptions {
                    lock_unspents: Some(true),
                    ..FundRawTransactionOptions::default()
                };
                let funded = client
                    .fund_raw_transaction(&unfunded, Some(&options), Some(true))
                    .context("fundrawtransaction (insufficient funds?)")?;
                let signed = client
                    .sign_raw_transaction_with_wallet(&funded.hex[..], None, None)
                    .context("signrawtransactionwithwallet")?;
                anyhow::ensure!(signed.complete, "wallet could not sign opening tx");
                signed.transaction().context("decode signed opening tx")
            })
            .await?;

        let vout = tx
            .output
            .iter()
            .position(|out| out.script_pubkey == script_pubkey)
            .context("htlc output missing from funded tx")?;

        Ok(OpeningTx {
            txid: tx.compute_txid().to_string(),
            vout: u32::try_from(vout).context("vout out of range")?,
            tx_hex: Some(serialize_hex(&tx)),
        })
    }

    async fn verify_opening_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
    ) -> Result<OpeningCheck> {
        let expected = HtlcScript::from_params(htlc)?.script_pubkey()?;
        let txid = Txid::from_str(&opening.txid).context("parse opening txid")?;
        let vout = opening.vout;

        self.rpc("verify opening tx", move |client| {
            let info = match client.get_raw_transaction_info(&txid, None) {
                Ok(info) => info,
                Err(err) if is_not_found(&err) => {
                    return Ok(OpeningCheck::Mismatch(format!("opening tx {txid} not found")));
                }
                Err(err) => return Err(err.into()),
            };
            let Some(out) = info.vout.iter().find(|out| out.n == vout) else {
                return Ok(OpeningCheck::Mismatch(format!("opening tx has no output {vout}")));
            };
            if out.script_pub_key.hex != expected.as_bytes() {
                return Ok(OpeningCheck::Mismatch("output does not pay the htlc script".into()));
            }
            if out.value != Amount::from_sat(amount_sat) {
                return Ok(OpeningCheck::Mismatch(format!(
                    "output value {} != {amount_sat} sat",
                    out.value.to_sat()
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
        let script = HtlcScript::from_params(htlc)?;
        let key = secret_key_from_hex(secret_key_hex)?;
        let network = self.network;
        let destination = self
            .rpc("claim address", move |client| Self::wallet_address(client, network))
            .await?;
        let tx = claim_tx(
            &script,
            opening,
            amount_sat,
            &destination,
            &key,
            preimage,
            self.spend_fee_sat,
        )?;
        Ok(signed(&tx))
    }

    async fn build_refund_tx(
        &self,
        htlc: &HtlcParams,
        opening: &OpeningTx,
        amount_sat: u64,
        secret_key_hex: &str,
    ) -> Result<SignedTx> {
        let script = HtlcScript::from_params(htlc)?;
        let key = secret_key_from_hex(secret_key_hex)?;
        let network = self.network;
        let destination = self
            .rpc("refund address", move |client| Self::wallet_address(client, network))
            .await?;
        let tx = refund_tx(
            &script,
            opening,
            amount_sat,
            &destination,
            &key,
            self.spend_fee_sat,
        )?;
        Ok(signed(&tx))
    }

    async fn release_opening_tx(&self, opening: &OpeningTx) -> Result<()> {
        let Some(tx_hex) = opening.tx_hex.as_deref() else {
            return Ok(());
        };
        let tx: Transaction = deserialize_hex(tx_hex).context("decode opening tx hex")?;
        let outpoints: Vec<bitcoin::OutPoint> = tx.input.iter().map(|input| input.previous_output).collect();
        self.rpc("lockunspent", move |client| {
            client.unlock_unspent(&outpoints).context("unlock opening inputs")?;
            Ok(())
        })
        .await
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String> {
        let decoded: Transaction = deserialize_hex(&tx.tx_hex).context("decode tx hex")?;
        let txid = self
            .rpc("sendrawtransaction", move |client| {
                client.send_raw_transaction(&decoded).map_err(Into::into)
            })
            .await?;
        Ok(txid.to_string())
    }
}

fn signed(tx: &Transaction) -> SignedTx {
    SignedTx {
        txid: tx.compute_txid().to_string(),
        tx_hex: serialize_hex(tx),
    }
}
