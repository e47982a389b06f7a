pub mod invoice;
pub mod ldk;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub bolt11: String,
    /// Hex SHA256 payment hash.
    pub payment_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash: String,
    pub amount_msat: Option<u64>,
}

/// The node's Lightning backend.
#[async_trait]
pub trait Lightning: Send + Sync {
    async fn create_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<Invoice>;

    fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice>;

    /// Pays the invoice and returns the hex preimage.
    async fn pay_invoice(&self, bolt11: &str) -> Result<String>;

    /// Preimage of a successful outbound payment with this hash, if any.
    async fn paid_preimage(&self, payment_hash: &str) -> Result<Option<String>>;

    /// Preimage of a settled inbound payment with this hash, if any.
    async fn received_preimage(&self, payment_hash: &str) -> Result<Option<String>>;
}
