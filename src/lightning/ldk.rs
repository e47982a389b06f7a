use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11ReceiveRequest, Bolt11SendRequest, ListPaymentsRequest};
use ldk_server_protos::types::{
    Bolt11InvoiceDescription, Payment, PaymentDirection, PaymentStatus,
    bolt11_invoice_description, payment_kind,
};

use super::invoice::decode_bolt11;
use super::{DecodedInvoice, Invoice, Lightning};

#[derive(Clone)]
pub struct LdkLightningClient {
    client: LdkServerClient,
    payment_timeout: Duration,
}

impl LdkLightningClient {
    pub fn new(rest_service_address: String, payment_timeout: Duration) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
            payment_timeout,
        }
    }

    async fn list_payments(&self) -> Result<Vec<Payment>> {
        collect_pages(|page_token| async move {
            let resp = self
                .client
                .list_payments(ListPaymentsRequest { page_token })
                .await
                .context("ListPayments")?;
            Ok((resp.payments, resp.next_page_token))
        })
        .await
    }

    async fn find_preimage(
        &self,
        direction: PaymentDirection,
        payment_hash: &str,
    ) -> Result<Option<String>> {
        let payments = self.list_payments().await?;
        for p in payments {
            if p.direction != direction as i32 || p.status != PaymentStatus::Succeeded as i32 {
                continue;
            }
            let Some(payment_kind::Kind::Bolt11(b)) = p.kind.as_ref().and_then(|k| k.kind.as_ref())
            else {
                continue;
            };
            if b.hash == payment_hash {
                return Ok(b.preimage.clone());
            }
        }
        Ok(None)
    }
}

/// Fetches pages until no next token comes back. An empty page also ends
/// the walk.
async fn collect_pages<T, P, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<P>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<P>)>>,
{
    let mut items = Vec::new();
    let mut token = None;
    loop {
        let (page, next) = fetch(token).await?;
        let empty = page.is_empty();
        items.extend(page);
        match next {
            Some(next) if !empty => token = Some(next),
            _ => return Ok(items),
        }
    }
}

#[async_trait]
impl Lightning for LdkLightningClient {
    async fn create_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<Invoice> {
        let description = Bolt11InvoiceDescription {
            kind: Some(bolt11_invoice_description::Kind::Direct(
                description.to_string(),
            )),
        };

        let resp = self
            .client
            .bolt11_receive(Bolt11ReceiveRequest {
                amount_msat: Some(amount_msat),
                description: Some(description),
                expiry_secs,
            })
            .await
            .context("Bolt11Receive")?;

        let decoded = decode_bolt11(&resp.invoice)?;
        Ok(Invoice {
            bolt11: resp.invoice,
            payment_hash: decoded.payment_hash,
        })
    }

    fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice> {
        decode_bolt11(bolt11)
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<String> {
        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: bolt11.to_string(),
                amount_msat: None,
                route_parameters: None,
            })
            .await
            .context("Bolt11Send")?;
        let payment_id = resp.payment_id;

        let deadline = Instant::now() + self.payment_timeout;
        loop {
            let payment = self
                .list_payments()
                .await?
                .into_iter()
                .find(|p| p.id == payment_id);

            if let Some(p) = payment {
                if p.status == PaymentStatus::Failed as i32 {
                    anyhow::bail!("payment {payment_id} failed");
                }
                if p.status == PaymentStatus::Succeeded as i32
                    && let Some(payment_kind::Kind::Bolt11(b)) = p.kind.and_then(|k| k.kind)
                {
                    return b.preimage.context("missing payment preimage");
                }
            }

            if Instant::now() >= deadline {
                anyhow::bail!("timeout waiting for preimage: payment_id={payment_id}");
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn paid_preimage(&self, payment_hash: &str) -> Result<Option<String>> {
        self.find_preimage(PaymentDirection::Outbound, payment_hash)
            .await
    }

    async fn received_preimage(&self, payment_hash: &str) -> Result<Option<String>> {
        self.find_preimage(PaymentDirection::Inbound, payment_hash)
            .await
    }
}
