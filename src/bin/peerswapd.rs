use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use lwk_wollet::ElementsNetwork;
use peerswap::btc::wallet::{BitcoinAuth, BitcoinWallet};
use peerswap::config::{AssetParams, SwapServiceConfig};
use peerswap::lightning::ldk::LdkLightningClient;
use peerswap::liquid::LiquidChain;
use peerswap::liquid::wallet::LiquidWallet;
use peerswap::onchain::OnChainServices;
use peerswap::policy::{Policy, PolicyConfig};
use peerswap::poll::PollService;
use peerswap::proto::v1::peer_swap_service_server::PeerSwapServiceServer;
use peerswap::rpc::{GrpcPeerMessenger, PeerSwapRpc};
use peerswap::swap::Asset;
use peerswap::swap::service::SwapService;
use peerswap::swap::store::SqliteStore;
use peerswap::txwatcher::ChainWatcher;
use tokio::sync::{mpsc, watch};
use tonic::transport::Server;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50061")]
    listen_addr: String,

    /// This node's id as seen by its peers.
    #[arg(long)]
    node_id: String,

    /// Peer transport endpoint, `<node_id>=<grpc_url>`. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, String)>,

    #[arg(long, default_value = "peerswap.sqlite")]
    db_path: PathBuf,

    #[arg(long, default_value = "policy.json")]
    policy_file: PathBuf,

    #[arg(long)]
    ldk_rest_addr: String,

    #[arg(long, default_value_t = 60)]
    payment_timeout_secs: u64,

    #[arg(long, default_value_t = 3600)]
    invoice_expiry_secs: u32,

    #[arg(long, default_value_t = 3600)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    chain_poll_interval_secs: u64,

    #[arg(long)]
    bitcoin_rpc_url: Option<String>,

    #[arg(long)]
    bitcoin_rpc_user: Option<String>,

    #[arg(long)]
    bitcoin_rpc_password: Option<String>,

    #[arg(long)]
    bitcoin_rpc_cookie: Option<PathBuf>,

    #[arg(long, default_value = "regtest")]
    bitcoin_network: bitcoin::Network,

    #[arg(long, default_value_t = 1008)]
    bitcoin_timeout_delta_blocks: u32,

    #[arg(long, default_value_t = 1_000)]
    bitcoin_claim_fee_sat: u64,

    #[arg(long)]
    liquid_electrum_url: Option<String>,

    #[arg(long, default_value = "regtest")]
    liquid_network: String,

    #[arg(long)]
    liquid_mnemonic: Option<String>,

    #[arg(long)]
    liquid_slip77: Option<String>,

    #[arg(long, default_value = "liquid-wallet")]
    liquid_wallet_dir: PathBuf,

    #[arg(long, default_value_t = 60)]
    liquid_timeout_delta_blocks: u32,

    #[arg(long, default_value_t = 300)]
    liquid_claim_fee_sat: u64,
}

impl Args {
    /// Assets whose backend is configured, in stable order.
    fn enabled_assets(&self) -> Vec<Asset> {
        let mut assets = Vec::new();
        if self.bitcoin_rpc_url.is_some() {
            assets.push(Asset::Bitcoin);
        }
        if self.liquid_electrum_url.is_some() {
            assets.push(Asset::Liquid);
        }
        assets
    }

    fn bitcoin_auth(&self) -> Result<BitcoinAuth> {
        if let Some(cookie) = &self.bitcoin_rpc_cookie {
            return Ok(BitcoinAuth::CookieFile(cookie.clone()));
        }
        match (&self.bitcoin_rpc_user, &self.bitcoin_rpc_password) {
            (Some(user), Some(password)) => Ok(BitcoinAuth::UserPass {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!(
                "bitcoind auth missing: set --bitcoin-rpc-cookie or --bitcoin-rpc-user/--bitcoin-rpc-password"
            ),
        }
    }
}

fn parse_peer(s: &str) -> Result<(String, String), String> {
    let (id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <node_id>=<grpc_url>, got {s}"))?;
    if id.is_empty() || url.is_empty() {
        return Err(format!("expected <node_id>=<grpc_url>, got {s}"));
    }
    Ok((id.to_string(), url.to_string()))
}

fn liquid_network(name: &str) -> Result<ElementsNetwork> {
    match name {
        "liquid" | "mainnet" => Ok(ElementsNetwork::Liquid),
        "liquid-testnet" | "testnet" => Ok(ElementsNetwork::LiquidTestnet),
        "regtest" => Ok(ElementsNetwork::default_regtest()),
        other => anyhow::bail!("unknown liquid network: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    peerswap::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;

    let assets = args.enabled_assets();
    anyhow::ensure!(
        !assets.is_empty(),
        "no asset enabled: set --bitcoin-rpc-url and/or --liquid-electrum-url"
    );
    let peers: HashMap<String, String> = args.peers.iter().cloned().collect();

    if let Some(parent) = args.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("create db parent dir")?;
    }
    let store = Arc::new(SqliteStore::open(args.db_path.clone()).context("open sqlite store")?);

    let policy_cfg = PolicyConfig::from_file(&args.policy_file).context("load policy")?;
    tracing::info!(
        policy_file = %args.policy_file.display(),
        accept_all_peers = policy_cfg.accept_all_peers,
        allowlisted = policy_cfg.allowlisted_peers.len(),
        denylisted = policy_cfg.denylisted_peers.len(),
        min_swap_amount_sat = policy_cfg.min_swap_amount_sat,
        max_swap_amount_sat = policy_cfg.max_swap_amount_sat,
        "policy loaded"
    );
    let policy = Arc::new(Policy::new(policy_cfg, assets.clone()));

    let cfg = SwapServiceConfig {
        bitcoin: AssetParams {
            timeout_delta_blocks: args.bitcoin_timeout_delta_blocks,
            spend_fee_sat: args.bitcoin_claim_fee_sat,
        },
        liquid: AssetParams {
            timeout_delta_blocks: args.liquid_timeout_delta_blocks,
            spend_fee_sat: args.liquid_claim_fee_sat,
        },
        invoice_expiry_secs: args.invoice_expiry_secs,
        ..SwapServiceConfig::default()
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let chain_interval = Duration::from_secs(args.chain_poll_interval_secs);
    let mut chains = OnChainServices::new();
    let mut watchers = HashMap::new();

    if let Some(url) = &args.bitcoin_rpc_url {
        let wallet = Arc::new(
            BitcoinWallet::new(
                url,
                args.bitcoin_auth()?,
                args.bitcoin_network,
                args.bitcoin_claim_fee_sat,
            )
            .context("create bitcoin wallet")?,
        );
        chains.insert(wallet.clone());
        watchers.insert(
            Asset::Bitcoin,
            ChainWatcher::new(Asset::Bitcoin, wallet, chain_interval, events_tx.clone()),
        );
        tracing::info!(network = %args.bitcoin_network, "bitcoin backend ready");
    }

    if let Some(url) = &args.liquid_electrum_url {
        let mnemonic = args
            .liquid_mnemonic
            .as_deref()
            .context("--liquid-mnemonic is required with --liquid-electrum-url")?;
        let slip77 = args
            .liquid_slip77
            .as_deref()
            .context("--liquid-slip77 is required with --liquid-electrum-url")?;
        std::fs::create_dir_all(&args.liquid_wallet_dir).context("create liquid_wallet_dir")?;
        let wallet = LiquidWallet::new(
            mnemonic,
            slip77,
            url,
            &args.liquid_wallet_dir,
            liquid_network(&args.liquid_network)?,
        )
        .context("create liquid wallet")?;
        let chain = Arc::new(LiquidChain::new(wallet, args.liquid_claim_fee_sat));
        chains.insert(chain.clone());
        watchers.insert(
            Asset::Liquid,
            ChainWatcher::new(Asset::Liquid, chain, chain_interval, events_tx.clone()),
        );
        tracing::info!(network = %args.liquid_network, "liquid backend ready");
    }
    drop(events_tx);

    let lightning = Arc::new(LdkLightningClient::new(
        args.ldk_rest_addr.clone(),
        Duration::from_secs(args.payment_timeout_secs),
    ));
    let messenger = Arc::new(
        GrpcPeerMessenger::new(args.node_id.clone(), &peers).context("create peer messenger")?,
    );

    let poll = PollService::new(
        policy.clone(),
        messenger.clone(),
        store.clone(),
        Duration::from_secs(args.poll_interval_secs),
    );
    let restored = poll.load().context("restore peer polls")?;

    let swaps = SwapService::new(
        cfg,
        store,
        chains,
        watchers.clone(),
        lightning,
        messenger,
        policy,
        poll.clone(),
    );
    let dispatcher = swaps.start(events_rx);
    let recovered = swaps.recover_swaps().await.context("recover swaps")?;
    tracing::info!(recovered, restored_polls = restored, "swap service ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<_> = watchers
        .values()
        .map(|w| w.spawn(shutdown_rx.clone()))
        .collect();
    background.push(poll.spawn(shutdown_rx));

    tracing::info!(%listen_addr, node_id = %args.node_id, peers = peers.len(), "starting peerswap gRPC server");

    Server::builder()
        .add_service(PeerSwapServiceServer::new(PeerSwapRpc::new(swaps.clone(), poll)))
        .serve_with_shutdown(listen_addr, async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown requested");
        })
        .await
        .context("serve gRPC")?;

    let _ = shutdown_tx.send(true);
    swaps.shutdown().await;
    for task in background {
        task.await.ok();
    }
    dispatcher.await.ok();
    Ok(())
}
