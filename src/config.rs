use std::time::Duration;

use crate::retry::RetryConfig;
use crate::swap::Asset;

#[derive(Debug, Clone)]
pub struct AssetParams {
    /// Blocks between the opening height and the HTLC refund height.
    pub timeout_delta_blocks: u32,
    /// Flat fee paid by claim and refund transactions.
    pub spend_fee_sat: u64,
}

impl AssetParams {
    pub fn default_for(asset: Asset) -> Self {
        match asset {
            Asset::Bitcoin => Self {
                timeout_delta_blocks: 1008,
                spend_fee_sat: 1_000,
            },
            Asset::Liquid => Self {
                timeout_delta_blocks: 60,
                spend_fee_sat: 300,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwapServiceConfig {
    pub bitcoin: AssetParams,
    pub liquid: AssetParams,
    pub invoice_expiry_secs: u32,
    /// Upper bound for a single chain or Lightning call.
    pub rpc_timeout: Duration,
    /// Backoff for steps that failed transiently.
    pub retry: RetryConfig,
    /// How often the funder asks its node whether the swap invoice settled.
    pub invoice_poll_interval: Duration,
}

impl Default for SwapServiceConfig {
    fn default() -> Self {
        Self {
            bitcoin: AssetParams::default_for(Asset::Bitcoin),
            liquid: AssetParams::default_for(Asset::Liquid),
            invoice_expiry_secs: 3600,
            rpc_timeout: Duration::from_secs(60),
            retry: RetryConfig {
                timeout: Duration::from_secs(60),
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter_ms: 500,
            },
            invoice_poll_interval: Duration::from_secs(5),
        }
    }
}

impl SwapServiceConfig {
    pub fn asset(&self, asset: Asset) -> &AssetParams {
        match asset {
            Asset::Bitcoin => &self.bitcoin,
            Asset::Liquid => &self.liquid,
        }
    }
}
