use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::swap::{Asset, RequestedSwap};

pub const DEFAULT_MIN_SWAP_AMOUNT_SAT: u64 = 100_000;
pub const DEFAULT_MAX_SWAP_AMOUNT_SAT: u64 = 10_000_000;

/// Operator policy, read once at startup. Changing it means restarting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub accept_all_peers: bool,
    pub allowlisted_peers: Vec<String>,
    pub denylisted_peers: Vec<String>,
    pub min_swap_amount_sat: u64,
    pub max_swap_amount_sat: u64,
    /// Per-peer maximum swap amount, tighter than the global one.
    pub peer_limits: HashMap<String, u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            accept_all_peers: false,
            allowlisted_peers: Vec::new(),
            denylisted_peers: Vec::new(),
            min_swap_amount_sat: DEFAULT_MIN_SWAP_AMOUNT_SAT,
            max_swap_amount_sat: DEFAULT_MAX_SWAP_AMOUNT_SAT,
            peer_limits: HashMap::new(),
        }
    }
}

impl PolicyConfig {
    /// Reads a JSON policy file. A missing file yields the default policy.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read policy {}", path.display()));
            }
        };
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse policy {}", path.display()))?;
        anyhow::ensure!(
            cfg.min_swap_amount_sat <= cfg.max_swap_amount_sat,
            "min_swap_amount_sat exceeds max_swap_amount_sat"
        );
        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(String),
}

/// Decides on swap requests. Pure: no I/O, no interior mutability.
#[derive(Debug, Clone)]
pub struct Policy {
    cfg: PolicyConfig,
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
    supported_assets: Vec<Asset>,
}

impl Policy {
    pub fn new(cfg: PolicyConfig, supported_assets: Vec<Asset>) -> Self {
        Self {
            allowlist: cfg.allowlisted_peers.iter().cloned().collect(),
            denylist: cfg.denylisted_peers.iter().cloned().collect(),
            cfg,
            supported_assets,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    pub fn supported_assets(&self) -> &[Asset] {
        &self.supported_assets
    }

    /// Whether swap requests from `peer_id` are accepted at all.
    pub fn is_peer_allowed(&self, peer_id: &str) -> bool {
        !self.denylist.contains(peer_id)
            && (self.cfg.accept_all_peers || self.allowlist.contains(peer_id))
    }

    /// Largest amount acceptable with `peer_id`.
    pub fn max_amount_for(&self, peer_id: &str) -> u64 {
        match self.cfg.peer_limits.get(peer_id) {
            Some(limit) => (*limit).min(self.cfg.max_swap_amount_sat),
            None => self.cfg.max_swap_amount_sat,
        }
    }

    pub fn evaluate(&self, request: &RequestedSwap) -> Decision {
        if !self.supported_assets.contains(&request.asset) {
            return Decision::Reject(format!("asset {} is not supported", request.asset));
        }
        if self.denylist.contains(&request.peer_id) {
            return Decision::Reject("peer is denylisted".into());
        }
        if !self.is_peer_allowed(&request.peer_id) {
            return Decision::Reject("peer is not allowlisted".into());
        }
        self.check_amount(&request.peer_id, request.amount_sat)
            .map_or_else(Decision::Reject, |()| Decision::Accept)
    }

    /// Local checks for a swap this node initiates.
    pub fn check_outbound(&self, peer_id: &str, asset: Asset, amount_sat: u64) -> Result<(), SwapError> {
        if !self.supported_assets.contains(&asset) {
            return Err(SwapError::UnsupportedAsset(asset));
        }
        if self.denylist.contains(peer_id) {
            return Err(SwapError::PolicyRejected("peer is denylisted".into()));
        }
        self.check_amount(peer_id, amount_sat)
            .map_err(SwapError::PolicyRejected)
    }

    fn check_amount(&self, peer_id: &str, amount_sat: u64) -> Result<(), String> {
        if amount_sat < self.cfg.min_swap_amount_sat {
            return Err(format!(
                "amount {amount_sat} below minimum {}",
                self.cfg.min_swap_amount_sat
            ));
        }
        let max = self.max_amount_for(peer_id);
        if amount_sat > max {
            return Err(format!("amount {amount_sat} above maximum {max}"));
        }
        Ok(())
    }
}
