use thiserror::Error;

use crate::swap::{Asset, SwapState};

/// Failure taxonomy of the swap core.
///
/// Plumbing below the swap service reports `anyhow::Error`; it is classified into
/// one of these variants where the swap service has to act on the difference.
#[derive(Debug, Error)]
pub enum SwapError {
    /// The policy engine refused an inbound request. Nothing is persisted.
    #[error("swap rejected by policy: {0}")]
    PolicyRejected(String),

    /// Malformed, unknown or out-of-place peer message. Dropped without state change.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Transient chain backend failure; retried with backoff.
    #[error("chain query unavailable: {0}")]
    ChainQueryUnavailable(String),

    #[error("transaction {txid} was reorganized out")]
    Reorg { txid: String },

    #[error("htlc timeout height {timeout_height} reached at height {current_height}")]
    HtlcTimeoutExceeded {
        timeout_height: u32,
        current_height: u32,
    },

    /// Durable write failed. The swap service halts until restarted.
    #[error("persistence failure: {0:#}")]
    PersistenceFailure(anyhow::Error),

    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: SwapState,
        to: SwapState,
        reason: String,
    },

    #[error("unknown swap {0}")]
    UnknownSwap(String),

    #[error("asset {0} is not enabled on this node")]
    UnsupportedAsset(Asset),

    #[error("peer {peer_id} is not eligible: {reason}")]
    PeerNotEligible { peer_id: String, reason: String },

    #[error("swap service halted after a persistence failure")]
    Halted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwapError {
    /// Errors worth retrying later without any state change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChainQueryUnavailable(_) | Self::BroadcastFailed(_) | Self::Other(_)
        )
    }
}
