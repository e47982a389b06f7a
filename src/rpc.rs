use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::error::SwapError;
use crate::peer::{PeerMessageRouter, PeerMessenger};
use crate::poll::PollService;
use crate::proto::v1 as pb;
use crate::proto::v1::peer_swap_service_client::PeerSwapServiceClient;
use crate::swap::service::SwapService;
use crate::swap::{Asset, RequestedSwap, Swap, SwapKind};

/// gRPC front of the daemon: local control calls plus the peer transport.
#[derive(Clone)]
pub struct PeerSwapRpc {
    swaps: SwapService,
    poll: PollService,
    router: PeerMessageRouter,
}

impl PeerSwapRpc {
    pub fn new(swaps: SwapService, poll: PollService) -> Self {
        let router = PeerMessageRouter::new(swaps.clone(), poll.clone());
        Self {
            swaps,
            poll,
            router,
        }
    }

    async fn create(&self, kind: SwapKind, req: pb::CreateSwapRequest) -> Result<Response<pb::CreateSwapResponse>, Status> {
        if req.amount_sat == 0 {
            return Err(Status::invalid_argument("amount_sat must be > 0"));
        }
        if req.peer_id.is_empty() {
            return Err(Status::invalid_argument("peer_id is required"));
        }
        let asset: Asset = req
            .asset
            .parse()
            .map_err(|e| Status::invalid_argument(format!("invalid asset: {e}")))?;

        let swap_id = self
            .swaps
            .create_swap(kind, asset, &req.peer_id, req.amount_sat)
            .await
            .map_err(to_status)?;
        Ok(Response::new(pb::CreateSwapResponse { swap_id }))
    }
}

pub fn swap_to_proto(swap: &Swap) -> pb::Swap {
    pb::Swap {
        swap_id: swap.id.clone(),
        role: swap.role.to_string(),
        kind: swap.kind.to_string(),
        asset: swap.asset.to_string(),
        amount_sat: swap.amount_sat,
        peer_id: swap.peer_id.clone(),
        state: swap.state.to_string(),
        opening_txid: swap.opening_tx_id.clone(),
        claim_txid: swap.claim_tx_id.clone(),
        refund_txid: swap.refund_tx_id.clone(),
        confirmation_height: swap.confirmation_height,
        timeout_height: swap.htlc.as_ref().map(|h| h.timeout_height),
        cancel_reason: swap.cancel_reason.clone(),
        created_at: swap.created_at.to_rfc3339(),
        updated_at: swap.updated_at.to_rfc3339(),
    }
}

pub fn requested_to_proto(request: &RequestedSwap) -> pb::RequestedSwap {
    pb::RequestedSwap {
        swap_id: request.swap_id.clone(),
        peer_id: request.peer_id.clone(),
        kind: request.kind.to_string(),
        asset: request.asset.to_string(),
        amount_sat: request.amount_sat,
        received_at: request.received_at.to_rfc3339(),
        rejection: request.rejection.clone(),
    }
}

fn to_status(err: SwapError) -> Status {
    match &err {
        SwapError::PolicyRejected(_)
        | SwapError::UnsupportedAsset(_)
        | SwapError::InvalidMessage(_) => Status::invalid_argument(err.to_string()),
        SwapError::PeerNotEligible { .. } => Status::failed_precondition(err.to_string()),
        SwapError::UnknownSwap(_) => Status::not_found(err.to_string()),
        SwapError::Halted | SwapError::PersistenceFailure(_) => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl pb::peer_swap_service_server::PeerSwapService for PeerSwapRpc {
    async fn deliver_message(
        &self,
        request: Request<pb::DeliverMessageRequest>,
    ) -> Result<Response<pb::DeliverMessageResponse>, Status> {
        let req = request.into_inner();
        if req.sender_node_id.is_empty() {
            return Err(Status::invalid_argument("sender_node_id is required"));
        }
        // Delivery is acknowledged regardless of how the message is handled;
        // protocol errors travel back as Cancel messages.
        let _ = self
            .router
            .route(&req.sender_node_id, req.message_type, &req.payload)
            .await;
        Ok(Response::new(pb::DeliverMessageResponse {}))
    }

    async fn swap_out(
        &self,
        request: Request<pb::CreateSwapRequest>,
    ) -> Result<Response<pb::CreateSwapResponse>, Status> {
        self.create(SwapKind::SwapOut, request.into_inner()).await
    }

    async fn swap_in(
        &self,
        request: Request<pb::CreateSwapRequest>,
    ) -> Result<Response<pb::CreateSwapResponse>, Status> {
        self.create(SwapKind::SwapIn, request.into_inner()).await
    }

    async fn get_swap(
        &self,
        request: Request<pb::GetSwapRequest>,
    ) -> Result<Response<pb::Swap>, Status> {
        let req = request.into_inner();
        let swap = self.swaps.get_swap(&req.swap_id).await.map_err(to_status)?;
        Ok(Response::new(swap_to_proto(&swap)))
    }

    async fn list_swaps(
        &self,
        _request: Request<pb::ListSwapsRequest>,
    ) -> Result<Response<pb::ListSwapsResponse>, Status> {
        let swaps = self.swaps.list_swaps().await.map_err(to_status)?;
        Ok(Response::new(pb::ListSwapsResponse {
            swaps: swaps.iter().map(swap_to_proto).collect(),
        }))
    }

    async fn list_peers(
        &self,
        _request: Request<pb::ListPeersRequest>,
    ) -> Result<Response<pb::ListPeersResponse>, Status> {
        let peers = self
            .poll
            .peer_statuses(Utc::now())
            .into_iter()
            .map(|status| pb::PeerInfo {
                peer_id: status.poll.peer_id,
                supported_assets: status
                    .poll
                    .poll
                    .supported_assets
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
                min_swap_amount_sat: status.poll.poll.min_swap_amount_sat,
                max_swap_amount_sat: status.poll.poll.max_swap_amount_sat,
                peer_allowed: status.poll.poll.peer_allowed,
                last_seen: status.poll.received_at.to_rfc3339(),
                stale: status.stale,
            })
            .collect();
        Ok(Response::new(pb::ListPeersResponse { peers }))
    }

    async fn list_requested_swaps(
        &self,
        _request: Request<pb::ListRequestedSwapsRequest>,
    ) -> Result<Response<pb::ListRequestedSwapsResponse>, Status> {
        let requests = self.swaps.list_requested_swaps().await.map_err(to_status)?;
        Ok(Response::new(pb::ListRequestedSwapsResponse {
            requests: requests.iter().map(requested_to_proto).collect(),
        }))
    }
}

/// Sends custom messages to peers' `DeliverMessage` endpoints.
pub struct GrpcPeerMessenger {
    node_id: String,
    peers: HashMap<String, Channel>,
}

impl GrpcPeerMessenger {
    /// `peers` maps node ids to gRPC URLs. Connections are established lazily.
    pub fn new(node_id: String, peers: &HashMap<String, String>) -> Result<Self> {
        let mut channels = HashMap::new();
        for (peer_id, url) in peers {
            let channel = Endpoint::from_shared(url.clone())
                .with_context(|| format!("parse peer url {url}"))?
                .connect_lazy();
            channels.insert(peer_id.clone(), channel);
        }
        Ok(Self {
            node_id,
            peers: channels,
        })
    }
}

#[async_trait]
impl PeerMessenger for GrpcPeerMessenger {
    async fn send_message(&self, peer_id: &str, message_type: u32, payload: Vec<u8>) -> Result<()> {
        let channel = self
            .peers
            .get(peer_id)
            .with_context(|| format!("unknown peer {peer_id}"))?
            .clone();
        let mut client = PeerSwapServiceClient::new(channel);
        client
            .deliver_message(pb::DeliverMessageRequest {
                sender_node_id: self.node_id.clone(),
                message_type,
                payload,
            })
            .await
            .with_context(|| format!("DeliverMessage to {peer_id}"))?;
        debug!(peer_id, message_type, "message delivered");
        Ok(())
    }

    async fn connected_peers(&self) -> Result<Vec<String>> {
        let mut peers: Vec<String> = self.peers.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }
}
