use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};

use peerswap::lightning::{DecodedInvoice, Invoice, Lightning};

#[derive(Debug, Clone)]
struct InvoiceRecord {
    payee: String,
    amount_msat: u64,
    preimage: String,
    paid: bool,
}

/// Invoices of every test node, keyed by payment hash. Paying one settles
/// it for the payee at once.
#[derive(Clone, Default)]
pub struct InvoiceNetwork {
    invoices: Arc<Mutex<HashMap<String, InvoiceRecord>>>,
}

impl InvoiceNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, node_id: &str) -> Arc<MockLightning> {
        Arc::new(MockLightning {
            node_id: node_id.to_string(),
            network: self.clone(),
            refuse_payments: AtomicBool::new(false),
            payments: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_paid(&self, payment_hash: &str) -> bool {
        self.lock().get(payment_hash).is_some_and(|r| r.paid)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InvoiceRecord>> {
        self.invoices.lock().expect("invoice mutex poisoned")
    }
}

pub struct MockLightning {
    node_id: String,
    network: InvoiceNetwork,
    refuse_payments: AtomicBool,
    /// Outbound payments: hash -> preimage.
    payments: Mutex<HashMap<String, String>>,
}

impl MockLightning {
    /// Makes every later `pay_invoice` fail, as if no route existed.
    pub fn refuse_payments(&self, refuse: bool) {
        self.refuse_payments.store(refuse, Ordering::SeqCst);
    }

    pub fn payment_count(&self) -> usize {
        self.payments.lock().expect("payments mutex poisoned").len()
    }
}

#[async_trait]
impl Lightning for MockLightning {
    async fn create_invoice(
        &self,
        amount_msat: u64,
        _description: &str,
        _expiry_secs: u32,
    ) -> Result<Invoice> {
        let preimage: [u8; 32] = rand::random();
        let payment_hash = hex::encode(sha256::Hash::hash(&preimage).to_byte_array());
        self.network.lock().insert(
            payment_hash.clone(),
            InvoiceRecord {
                payee: self.node_id.clone(),
                amount_msat,
                preimage: hex::encode(preimage),
                paid: false,
            },
        );
        Ok(Invoice {
            bolt11: format!("lnmock{amount_msat}x{payment_hash}"),
            payment_hash,
        })
    }

    fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice> {
        let rest = bolt11.strip_prefix("lnmock").context("not a mock invoice")?;
        let (amount, hash) = rest.split_once('x').context("malformed mock invoice")?;
        Ok(DecodedInvoice {
            payment_hash: hash.to_string(),
            amount_msat: Some(amount.parse().context("parse invoice amount")?),
        })
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<String> {
        anyhow::ensure!(!self.refuse_payments.load(Ordering::SeqCst), "no route found");
        let decoded = self.decode_invoice(bolt11)?;
        let preimage = {
            let mut invoices = self.network.lock();
            let record = invoices
                .get_mut(&decoded.payment_hash)
                .context("unknown invoice")?;
            anyhow::ensure!(record.payee != self.node_id, "cannot pay own invoice");
            anyhow::ensure!(Some(record.amount_msat) == decoded.amount_msat, "amount mismatch");
            record.paid = true;
            record.preimage.clone()
        };
        self.payments
            .lock()
            .expect("payments mutex poisoned")
            .insert(decoded.payment_hash, preimage.clone());
        Ok(preimage)
    }

    async fn paid_preimage(&self, payment_hash: &str) -> Result<Option<String>> {
        Ok(self
            .payments
            .lock()
            .expect("payments mutex poisoned")
            .get(payment_hash)
            .cloned())
    }

    async fn received_preimage(&self, payment_hash: &str) -> Result<Option<String>> {
        Ok(self
            .network
            .lock()
            .get(payment_hash)
            .filter(|r| r.paid && r.payee == self.node_id)
            .map(|r| r.preimage.clone()))
    }
}
