use serde::{Deserialize, Serialize};

use super::{Asset, SwapKind, parse_pubkey};
use crate::error::SwapError;
use crate::poll::PollMessage;

pub const PROTOCOL_VERSION: u32 = 1;

pub const SWAP_IN_REQUEST: u32 = 42069;
pub const SWAP_OUT_REQUEST: u32 = 42071;
pub const SWAP_IN_AGREEMENT: u32 = 42073;
pub const SWAP_OUT_AGREEMENT: u32 = 42075;
pub const OPENING_TX_BROADCAST: u32 = 42077;
pub const CANCEL: u32 = 42079;
pub const CLAIM_TX_BROADCAST: u32 = 42081;
pub const POLL: u32 = 42083;
pub const REQUEST_POLL: u32 = 42085;

const MAX_SWAP_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapMessage {
    pub swap_id: String,
    pub protocol_version: u32,
    pub body: SwapMessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapMessageBody {
    Request {
        kind: SwapKind,
        asset: Asset,
        amount_sat: u64,
        /// Initiator's per-swap public key.
        claim_pubkey: String,
    },
    Agreement {
        kind: SwapKind,
        /// Responder's per-swap public key.
        claim_pubkey: String,
    },
    OpeningTxBroadcast {
        htlc_hash: String,
        claim_pubkey: String,
        funder_pubkey: String,
        timeout_height: u32,
        txid: String,
        vout: u32,
        invoice: String,
    },
    ClaimTxBroadcast {
        txid: String,
    },
    Cancel {
        reason: String,
    },
}

impl SwapMessage {
    pub fn new(swap_id: &str, body: SwapMessageBody) -> Self {
        Self {
            swap_id: swap_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            body,
        }
    }

    pub fn message_type(&self) -> u32 {
        match &self.body {
            SwapMessageBody::Request {
                kind: SwapKind::SwapIn,
                ..
            } => SWAP_IN_REQUEST,
            SwapMessageBody::Request {
                kind: SwapKind::SwapOut,
                ..
            } => SWAP_OUT_REQUEST,
            SwapMessageBody::Agreement {
                kind: SwapKind::SwapIn,
                ..
            } => SWAP_IN_AGREEMENT,
            SwapMessageBody::Agreement {
                kind: SwapKind::SwapOut,
                ..
            } => SWAP_OUT_AGREEMENT,
            SwapMessageBody::OpeningTxBroadcast { .. } => OPENING_TX_BROADCAST,
            SwapMessageBody::ClaimTxBroadcast { .. } => CLAIM_TX_BROADCAST,
            SwapMessageBody::Cancel { .. } => CANCEL,
        }
    }

    fn validate(&self) -> Result<(), SwapError> {
        let invalid = |reason: String| Err(SwapError::InvalidMessage(reason));

        if self.protocol_version != PROTOCOL_VERSION {
            return invalid(format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                self.protocol_version
            ));
        }
        if self.swap_id.is_empty() || self.swap_id.len() > MAX_SWAP_ID_LEN {
            return invalid(format!("bad swap id {:?}", self.swap_id));
        }

        match &self.body {
            SwapMessageBody::Request {
                amount_sat,
                claim_pubkey,
                ..
            } => {
                if *amount_sat == 0 {
                    return invalid("amount must be > 0".into());
                }
                check_pubkey(claim_pubkey)?;
            }
            SwapMessageBody::Agreement { claim_pubkey, .. } => check_pubkey(claim_pubkey)?,
            SwapMessageBody::OpeningTxBroadcast {
                htlc_hash,
                claim_pubkey,
                funder_pubkey,
                txid,
                invoice,
                ..
            } => {
                check_hex32("htlc_hash", htlc_hash)?;
                check_hex32("txid", txid)?;
                check_pubkey(claim_pubkey)?;
                check_pubkey(funder_pubkey)?;
                if invoice.is_empty() {
                    return invalid("missing invoice".into());
                }
            }
            SwapMessageBody::ClaimTxBroadcast { txid } => check_hex32("txid", txid)?,
            SwapMessageBody::Cancel { .. } => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Swap(SwapMessage),
    Poll(PollMessage),
    RequestPoll,
}

impl WireMessage {
    pub fn message_type(&self) -> u32 {
        match self {
            WireMessage::Swap(msg) => msg.message_type(),
            WireMessage::Poll(_) => POLL,
            WireMessage::RequestPoll => REQUEST_POLL,
        }
    }
}

pub fn encode(message: &WireMessage) -> Result<(u32, Vec<u8>), SwapError> {
    let payload = match message {
        WireMessage::Swap(msg) => serde_json::to_vec(msg),
        WireMessage::Poll(poll) => serde_json::to_vec(poll),
        WireMessage::RequestPoll => serde_json::to_vec(&serde_json::json!({})),
    }
    .map_err(|e| SwapError::Other(anyhow::anyhow!("encode peer message: {e}")))?;
    Ok((message.message_type(), payload))
}

/// Decodes and validates an inbound custom message.
pub fn decode(message_type: u32, payload: &[u8]) -> Result<WireMessage, SwapError> {
    let malformed = |e: serde_json::Error| {
        SwapError::InvalidMessage(format!("undecodable payload for type {message_type}: {e}"))
    };

    match message_type {
        POLL => {
            let poll: PollMessage = serde_json::from_slice(payload).map_err(malformed)?;
            poll.validate()?;
            Ok(WireMessage::Poll(poll))
        }
        REQUEST_POLL => Ok(WireMessage::RequestPoll),
        SWAP_IN_REQUEST | SWAP_OUT_REQUEST | SWAP_IN_AGREEMENT | SWAP_OUT_AGREEMENT
        | OPENING_TX_BROADCAST | CANCEL | CLAIM_TX_BROADCAST => {
            let msg: SwapMessage = serde_json::from_slice(payload).map_err(malformed)?;
            if msg.message_type() != message_type {
                return Err(SwapError::InvalidMessage(format!(
                    "payload of type {} sent as {message_type}",
                    msg.message_type()
                )));
            }
            msg.validate()?;
            Ok(WireMessage::Swap(msg))
        }
        other => Err(SwapError::InvalidMessage(format!(
            "unknown message type {other}"
        ))),
    }
}

fn check_pubkey(pubkey: &str) -> Result<(), SwapError> {
    parse_pubkey(pubkey)
        .map(|_| ())
        .map_err(|e| SwapError::InvalidMessage(format!("{e:#}")))
}

fn check_hex32(field: &str, value: &str) -> Result<(), SwapError> {
    match hex::decode(value) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(SwapError::InvalidMessage(format!(
            "{field} must be 32 hex-encoded bytes"
        ))),
    }
}
