use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use peerswap::proto::v1::peer_swap_service_client::PeerSwapServiceClient;
use peerswap::proto::v1::{
    CreateSwapRequest, GetSwapRequest, ListPeersRequest, ListRequestedSwapsRequest,
    ListSwapsRequest, Swap,
};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:50061")]
    grpc_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pay a Lightning invoice to receive on-chain funds from the peer.
    SwapOut {
        #[arg(long)]
        peer_id: String,

        #[arg(long)]
        asset: String,

        #[arg(long)]
        amount_sat: u64,
    },
    /// Lock on-chain funds to receive a Lightning payment from the peer.
    SwapIn {
        #[arg(long)]
        peer_id: String,

        #[arg(long)]
        asset: String,

        #[arg(long)]
        amount_sat: u64,
    },
    GetSwap {
        #[arg(long)]
        swap_id: String,
    },
    ListSwaps,
    ListPeers,
    /// Inbound swap requests that are pending or were rejected.
    ListRequestedSwaps,
}

fn swap_json(swap: &Swap) -> serde_json::Value {
    json!({
      "swap_id": swap.swap_id,
      "role": swap.role,
      "kind": swap.kind,
      "asset": swap.asset,
      "amount_sat": swap.amount_sat,
      "peer_id": swap.peer_id,
      "state": swap.state,
      "opening_txid": swap.opening_txid,
      "claim_txid": swap.claim_txid,
      "refund_txid": swap.refund_txid,
      "confirmation_height": swap.confirmation_height,
      "timeout_height": swap.timeout_height,
      "cancel_reason": swap.cancel_reason,
      "created_at": swap.created_at,
      "updated_at": swap.updated_at,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    peerswap::logging::init().ok();
    let args = Args::parse();

    let mut client = PeerSwapServiceClient::connect(args.grpc_url)
        .await
        .context("connect gRPC")?;

    let out = match args.command {
        Command::SwapOut {
            peer_id,
            asset,
            amount_sat,
        } => {
            let resp = client
                .swap_out(CreateSwapRequest {
                    peer_id,
                    asset,
                    amount_sat,
                })
                .await
                .context("SwapOut")?
                .into_inner();
            json!({ "swap_id": resp.swap_id })
        }
        Command::SwapIn {
            peer_id,
            asset,
            amount_sat,
        } => {
            let resp = client
                .swap_in(CreateSwapRequest {
                    peer_id,
                    asset,
                    amount_sat,
                })
                .await
                .context("SwapIn")?
                .into_inner();
            json!({ "swap_id": resp.swap_id })
        }
        Command::GetSwap { swap_id } => {
            let swap = client
                .get_swap(GetSwapRequest { swap_id })
                .await
                .context("GetSwap")?
                .into_inner();
            swap_json(&swap)
        }
        Command::ListSwaps => {
            let resp = client
                .list_swaps(ListSwapsRequest {})
                .await
                .context("ListSwaps")?
                .into_inner();
            json!({ "swaps": resp.swaps.iter().map(swap_json).collect::<Vec<_>>() })
        }
        Command::ListPeers => {
            let resp = client
                .list_peers(ListPeersRequest {})
                .await
                .context("ListPeers")?
                .into_inner();
            json!({
              "peers": resp.peers.iter().map(|p| json!({
                "peer_id": p.peer_id,
                "supported_assets": p.supported_assets,
                "min_swap_amount_sat": p.min_swap_amount_sat,
                "max_swap_amount_sat": p.max_swap_amount_sat,
                "peer_allowed": p.peer_allowed,
                "last_seen": p.last_seen,
                "stale": p.stale,
              })).collect::<Vec<_>>(),
            })
        }
        Command::ListRequestedSwaps => {
            let resp = client
                .list_requested_swaps(ListRequestedSwapsRequest {})
                .await
                .context("ListRequestedSwaps")?
                .into_inner();
            json!({
              "requests": resp.requests.iter().map(|r| json!({
                "swap_id": r.swap_id,
                "peer_id": r.peer_id,
                "kind": r.kind,
                "asset": r.asset,
                "amount_sat": r.amount_sat,
                "received_at": r.received_at,
                "rejection": r.rejection,
              })).collect::<Vec<_>>(),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
