use std::path::Path;

use anyhow::{Context as _, Result};
use lwk_common::Signer as _;
use lwk_signer::SwSigner;
use lwk_wollet::blocking::BlockchainBackend as _;
use lwk_wollet::{
    ElectrumClient, ElectrumUrl, ElementsNetwork, History, Wollet, WolletDescriptor,
    elements::{Address, AssetId, OutPoint, Script, Transaction, Txid, confidential},
    full_scan_with_electrum_client,
};

pub struct LiquidWallet {
    signer: SwSigner,
    wollet: Wollet,
    client: ElectrumClient,
    network: ElementsNetwork,
}

impl LiquidWallet {
    pub fn new(
        mnemonic: &str,
        slip77_key: &str,
        electrum_url: &str,
        persist_dir: &Path,
        network: ElementsNetwork,
    ) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, false).context("create SwSigner")?;
        let xpub = signer.xpub();

        let desc_str = format!("ct(slip77({slip77_key}),elwpkh({xpub}/*))");
        let descriptor: WolletDescriptor = desc_str.parse().context("parse wollet descriptor")?;

        let wollet =
            Wollet::with_fs_persist(network, descriptor, persist_dir).context("create wollet")?;

        let client = electrum_client(electrum_url).context("create electrum client")?;

        let mut wallet = Self {
            signer,
            wollet,
            client,
            network,
        };
        wallet.sync().context("initial sync")?;
        Ok(wallet)
    }

    pub fn network(&self) -> ElementsNetwork {
        self.network
    }

    pub fn policy_asset(&self) -> AssetId {
        self.wollet.policy_asset()
    }

    pub fn tip_height(&self) -> u32 {
        self.wollet.tip().height()
    }

    pub fn new_address(&self) -> Result<Address> {
        Ok(self
            .wollet
            .address(None)
            .context("get wollet address")?
            .address()
            .clone())
    }

    pub fn sync(&mut self) -> Result<()> {
        full_scan_with_electrum_client(&mut self.wollet, &mut self.client)
            .context("sync wollet via electrum")
    }

    /// Builds and signs a transaction paying `amount_sat` explicit L-BTC to the
    /// HTLC address. Returns the transaction and the HTLC output index.
    pub fn build_funding(&mut self, htlc_address: &Address, amount_sat: u64) -> Result<(Transaction, u32)> {
        self.sync()
            .context("sync wallet before building funding tx")?;

        let policy_asset = self.policy_asset();

        let mut pset = self
            .wollet
            .tx_builder()
            .add_explicit_recipient(htlc_address, amount_sat, policy_asset)
            .context("add htlc output")?
            .finish()
            .context("finalize funding pset")?;

        let sigs = self.signer.sign(&mut pset).context("sign funding pset")?;
        anyhow::ensure!(sigs > 0, "no signatures added for funding");

        let tx = self
            .wollet
            .finalize(&mut pset)
            .context("finalize funding tx")?;

        let htlc_spk = htlc_address.script_pubkey();
        let vout = tx
            .output
            .iter()
            .position(|output| {
                output.script_pubkey == htlc_spk
                    && matches!(output.asset, confidential::Asset::Explicit(a) if a == policy_asset)
            })
            .context("htlc output not found")?;

        Ok((tx, u32::try_from(vout).context("vout out of range")?))
    }

    pub fn tx_confirmations_for_script(
        &self,
        script_pubkey: &Script,
        txid: &Txid,
    ) -> Result<Option<u32>> {
        let mut histories = self
            .client
            .get_scripts_history(&[script_pubkey])
            .context("get script history")?;
        let history: Vec<History> = histories.pop().unwrap_or_default();
        let Some(entry) = history.into_iter().find(|h| &h.txid == txid) else {
            return Ok(None);
        };

        if entry.height <= 0 {
            return Ok(Some(0));
        }

        let height = u32::try_from(entry.height).context("history height must be positive")?;
        let tip = self.tip_height();
        if tip < height {
            return Ok(Some(0));
        }
        Ok(Some(tip - height + 1))
    }

    /// Scans the history of `script_pubkey` for a transaction spending `outpoint`.
    pub fn find_spend_for_script(&self, script_pubkey: &Script, outpoint: OutPoint) -> Result<Option<Txid>> {
        let mut histories = self
            .client
            .get_scripts_history(&[script_pubkey])
            .context("get script history")?;
        let candidates: Vec<Txid> = histories
            .pop()
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.txid)
            .filter(|txid| *txid != outpoint.txid)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let txs = self
            .client
            .get_transactions(&candidates)
            .context("get spending candidates")?;
        Ok(txs
            .iter()
            .find(|tx| tx.input.iter().any(|input| input.previous_output == outpoint))
            .map(|tx| tx.txid()))
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid> {
        self.client.broadcast(tx).context("broadcast tx")
    }

    pub fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>> {
        let mut txs = self
            .client
            .get_transactions(&[*txid])
            .context("get transaction")?;
        Ok(txs.pop())
    }
}

fn electrum_client(url: &str) -> Result<ElectrumClient> {
    let endpoint = url.trim_start_matches("tcp://");
    let electrum_url = ElectrumUrl::new(endpoint, false, false)
        .with_context(|| format!("parse electrum url {endpoint}"))?;
    ElectrumClient::new(&electrum_url).context("create electrum client")
}
