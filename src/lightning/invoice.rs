use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr as _;

use super::DecodedInvoice;

pub fn decode_bolt11(invoice: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(DecodedInvoice {
        payment_hash: hex::encode(invoice.payment_hash().to_byte_array()),
        amount_msat: invoice.amount_milli_satoshis(),
    })
}
