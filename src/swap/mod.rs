pub mod machine;
pub mod messages;
pub mod service;
pub mod state;
pub mod store;

use std::fmt;
use std::str::FromStr;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, rand};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use state::{SwapState, Transition, TransitionRecord};

use crate::onchain::SignedTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    Bitcoin,
    Liquid,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::Bitcoin, Asset::Liquid];

    /// Depth at which a transaction on this chain is treated as final.
    pub fn required_confirmations(self) -> u32 {
        match self {
            Asset::Bitcoin => 3,
            Asset::Liquid => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Asset::Bitcoin => "btc",
            Asset::Liquid => "lbtc",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Asset::Bitcoin),
            "lbtc" | "l-btc" | "liquid" => Ok(Asset::Liquid),
            other => anyhow::bail!("unknown asset: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        })
    }
}

/// Direction of a swap, always named from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    /// Initiator pays over Lightning and receives on-chain funds.
    SwapOut,
    /// Initiator pays on-chain and receives over Lightning.
    SwapIn,
}

impl fmt::Display for SwapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwapKind::SwapOut => "swap_out",
            SwapKind::SwapIn => "swap_in",
        })
    }
}

/// Script parameters of the HTLC output. Fixed once the opening transaction is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcParams {
    /// Hex SHA256 payment hash; the claim branch requires its preimage.
    pub payment_hash: String,
    pub claimer_pubkey: String,
    pub funder_pubkey: String,
    /// Absolute height from which the funder may refund.
    pub timeout_height: u32,
}

impl HtlcParams {
    pub fn payment_hash_bytes(&self) -> Result<[u8; 32]> {
        decode_32(&self.payment_hash).context("decode htlc payment_hash")
    }

    pub fn is_expired_at(&self, height: u32) -> bool {
        height >= self.timeout_height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningTx {
    pub txid: String,
    pub vout: u32,
    /// Raw signed transaction, only known to the funder.
    pub tx_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub id: String,
    pub role: Role,
    pub kind: SwapKind,
    pub asset: Asset,
    pub amount_sat: u64,
    pub peer_id: String,
    pub state: SwapState,

    /// Hex secret key used for this swap's claim or refund signature.
    pub local_secret: String,
    pub peer_pubkey: Option<String>,

    pub htlc: Option<HtlcParams>,
    pub invoice: Option<String>,
    pub opening_tx: Option<OpeningTx>,
    pub opening_tx_id: Option<String>,
    pub claim_tx_id: Option<String>,
    pub refund_tx_id: Option<String>,
    /// Signed claim or refund, persisted before its first broadcast.
    #[serde(default)]
    pub prepared_spend: Option<SignedTx>,
    pub preimage: Option<String>,
    pub confirmation_height: Option<u32>,
    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Swap {
    pub fn new_initiator(
        kind: SwapKind,
        asset: Asset,
        peer_id: &str,
        amount_sat: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            Role::Initiator,
            kind,
            asset,
            peer_id,
            amount_sat,
            None,
            now,
        )
    }

    pub fn new_responder(request: &RequestedSwap, now: DateTime<Utc>) -> Self {
        Self::new(
            request.swap_id.clone(),
            Role::Responder,
            request.kind,
            request.asset,
            &request.peer_id,
            request.amount_sat,
            Some(request.peer_pubkey.clone()),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: String,
        role: Role,
        kind: SwapKind,
        asset: Asset,
        peer_id: &str,
        amount_sat: u64,
        peer_pubkey: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            role,
            kind,
            asset,
            amount_sat,
            peer_id: peer_id.to_string(),
            state: SwapState::Created,
            local_secret: generate_secret_key(),
            peer_pubkey,
            htlc: None,
            invoice: None,
            opening_tx: None,
            opening_tx_id: None,
            claim_tx_id: None,
            refund_tx_id: None,
            prepared_spend: None,
            preimage: None,
            confirmation_height: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The funder locks the on-chain leg: swap-out responder or swap-in initiator.
    pub fn is_funder(&self) -> bool {
        matches!(
            (self.kind, self.role),
            (SwapKind::SwapOut, Role::Responder) | (SwapKind::SwapIn, Role::Initiator)
        )
    }

    pub fn local_pubkey(&self) -> Result<String> {
        pubkey_from_secret(&self.local_secret)
    }

    pub fn amount_msat(&self) -> u64 {
        self.amount_sat.saturating_mul(1000)
    }
}

/// Inbound swap proposal. Kept while the policy decision is pending, and
/// afterwards as a record when the policy turned it down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedSwap {
    pub swap_id: String,
    pub peer_id: String,
    pub kind: SwapKind,
    pub asset: Asset,
    pub amount_sat: u64,
    pub peer_pubkey: String,
    pub protocol_version: u32,
    pub received_at: DateTime<Utc>,
    /// Policy reason; `None` while undecided.
    #[serde(default)]
    pub rejection: Option<String>,
}

impl RequestedSwap {
    pub fn is_pending(&self) -> bool {
        self.rejection.is_none()
    }
}

pub fn generate_secret_key() -> String {
    let key = SecretKey::new(&mut rand::thread_rng());
    hex::encode(key.secret_bytes())
}

pub fn pubkey_from_secret(secret_hex: &str) -> Result<String> {
    let bytes = hex::decode(secret_hex).context("decode secret key hex")?;
    let key = SecretKey::from_slice(&bytes).context("parse secret key")?;
    let secp = Secp256k1::signing_only();
    Ok(PublicKey::from_secret_key(&secp, &key).to_string())
}

pub fn parse_pubkey(pubkey_hex: &str) -> Result<PublicKey> {
    PublicKey::from_str(pubkey_hex).with_context(|| format!("parse public key {pubkey_hex}"))
}

pub fn decode_32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decode hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}
