use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::error::SwapError;
use crate::poll::PollService;
use crate::swap::messages::{self, WireMessage};
use crate::swap::service::SwapService;

/// Custom-message transport to Lightning peers.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    async fn send_message(&self, peer_id: &str, message_type: u32, payload: Vec<u8>) -> Result<()>;

    async fn connected_peers(&self) -> Result<Vec<String>>;
}

pub async fn send_wire(
    messenger: &dyn PeerMessenger,
    peer_id: &str,
    message: &WireMessage,
) -> Result<(), SwapError> {
    let (message_type, payload) = messages::encode(message)?;
    messenger
        .send_message(peer_id, message_type, payload)
        .await
        .map_err(|e| SwapError::Other(e.context(format!("send message {message_type} to {peer_id}"))))
}

/// Decodes inbound custom messages and hands them to the swap or poll service.
#[derive(Clone)]
pub struct PeerMessageRouter {
    swaps: SwapService,
    poll: PollService,
}

impl PeerMessageRouter {
    pub fn new(swaps: SwapService, poll: PollService) -> Self {
        Self { swaps, poll }
    }

    pub async fn route(&self, sender: &str, message_type: u32, payload: &[u8]) -> Result<(), SwapError> {
        let result = match messages::decode(message_type, payload) {
            Ok(WireMessage::Swap(msg)) => self.swaps.handle_peer_message(sender, msg).await,
            Ok(other) => self.poll.handle_message(sender, other).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(peer_id = sender, message_type, error = %err, "peer message rejected");
        }
        result
    }
}
