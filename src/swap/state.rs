use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HtlcParams, OpeningTx, Swap};
use crate::error::SwapError;
use crate::onchain::SignedTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    RequestSent,
    RequestReceived,
    Agreed,
    OpeningTxBroadcast,
    OpeningTxConfirmed,
    ClaimInvoicePaid,
    ClaimTxBroadcast,
    ClaimTxConfirmed,
    RefundTxBroadcast,
    RefundTxConfirmed,
    Canceled,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapState::ClaimTxConfirmed | SwapState::RefundTxConfirmed | SwapState::Canceled
        )
    }

    /// True once an opening transaction may exist on chain.
    pub fn is_post_opening(self) -> bool {
        matches!(
            self,
            SwapState::OpeningTxBroadcast
                | SwapState::OpeningTxConfirmed
                | SwapState::ClaimInvoicePaid
                | SwapState::ClaimTxBroadcast
                | SwapState::RefundTxBroadcast
        )
    }

    pub fn can_transition_to(self, next: SwapState) -> bool {
        use SwapState::*;
        matches!(
            (self, next),
            (Created, RequestSent)
                | (Created, RequestReceived)
                | (RequestSent, Agreed)
                | (RequestReceived, Agreed)
                | (Created | RequestSent | RequestReceived | Agreed, Canceled)
                | (Agreed, OpeningTxBroadcast)
                | (OpeningTxBroadcast, OpeningTxConfirmed)
                | (OpeningTxBroadcast | OpeningTxConfirmed, Canceled)
                | (OpeningTxConfirmed, ClaimInvoicePaid)
                | (ClaimInvoicePaid, ClaimTxBroadcast)
                | (ClaimTxBroadcast, ClaimTxConfirmed)
                | (
                    OpeningTxBroadcast | OpeningTxConfirmed | ClaimInvoicePaid | ClaimTxBroadcast,
                    RefundTxBroadcast
                )
                | (RefundTxBroadcast, RefundTxConfirmed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Created => "created",
            SwapState::RequestSent => "request_sent",
            SwapState::RequestReceived => "request_received",
            SwapState::Agreed => "agreed",
            SwapState::OpeningTxBroadcast => "opening_tx_broadcast",
            SwapState::OpeningTxConfirmed => "opening_tx_confirmed",
            SwapState::ClaimInvoicePaid => "claim_invoice_paid",
            SwapState::ClaimTxBroadcast => "claim_tx_broadcast",
            SwapState::ClaimTxConfirmed => "claim_tx_confirmed",
            SwapState::RefundTxBroadcast => "refund_tx_broadcast",
            SwapState::RefundTxConfirmed => "refund_tx_confirmed",
            SwapState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<SwapState> {
        use SwapState::*;
        [
            Created,
            RequestSent,
            RequestReceived,
            Agreed,
            OpeningTxBroadcast,
            OpeningTxConfirmed,
            ClaimInvoicePaid,
            ClaimTxBroadcast,
            ClaimTxConfirmed,
            RefundTxBroadcast,
            RefundTxConfirmed,
            Canceled,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted step of a swap. Applying the recorded sequence to nothing
/// rebuilds the swap record exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Created { swap: Box<Swap> },
    RequestSent,
    RequestReceived,
    Agreed { peer_pubkey: String },
    /// Funder built and signed the opening transaction; state stays `Agreed`.
    OpeningPrepared {
        htlc: HtlcParams,
        invoice: String,
        opening: OpeningTx,
    },
    OpeningBroadcast {
        htlc: HtlcParams,
        invoice: String,
        opening: OpeningTx,
    },
    OpeningConfirmed { height: u32 },
    /// Signed claim (claimer) or refund (funder) stored before broadcasting;
    /// state is unchanged.
    SpendPrepared { tx: SignedTx },
    InvoicePaid { preimage: String },
    ClaimBroadcast { txid: String },
    ClaimConfirmed,
    RefundBroadcast { txid: String },
    RefundConfirmed,
    Canceled { reason: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Created { .. } => "created",
            Transition::RequestSent => "request_sent",
            Transition::RequestReceived => "request_received",
            Transition::Agreed { .. } => "agreed",
            Transition::OpeningPrepared { .. } => "opening_prepared",
            Transition::OpeningBroadcast { .. } => "opening_broadcast",
            Transition::OpeningConfirmed { .. } => "opening_confirmed",
            Transition::SpendPrepared { .. } => "spend_prepared",
            Transition::InvoicePaid { .. } => "invoice_paid",
            Transition::ClaimBroadcast { .. } => "claim_broadcast",
            Transition::ClaimConfirmed => "claim_confirmed",
            Transition::RefundBroadcast { .. } => "refund_broadcast",
            Transition::RefundConfirmed => "refund_confirmed",
            Transition::Canceled { .. } => "canceled",
        }
    }

    fn target(&self, current: SwapState) -> SwapState {
        match self {
            Transition::Created { .. } => SwapState::Created,
            Transition::RequestSent => SwapState::RequestSent,
            Transition::RequestReceived => SwapState::RequestReceived,
            Transition::Agreed { .. } => SwapState::Agreed,
            Transition::OpeningPrepared { .. } => current,
            Transition::OpeningBroadcast { .. } => SwapState::OpeningTxBroadcast,
            Transition::OpeningConfirmed { .. } => SwapState::OpeningTxConfirmed,
            Transition::SpendPrepared { .. } => current,
            Transition::InvoicePaid { .. } => SwapState::ClaimInvoicePaid,
            Transition::ClaimBroadcast { .. } => SwapState::ClaimTxBroadcast,
            Transition::ClaimConfirmed => SwapState::ClaimTxConfirmed,
            Transition::RefundBroadcast { .. } => SwapState::RefundTxBroadcast,
            Transition::RefundConfirmed => SwapState::RefundTxConfirmed,
            Transition::Canceled { .. } => SwapState::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub transition: Transition,
}

impl Swap {
    /// Applies one transition, enforcing the edge set, role constraints and
    /// set-once fields. On error the record is left untouched.
    pub fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<(), SwapError> {
        let from = self.state;
        let to = transition.target(from);
        let reject = |reason: &str| SwapError::InvalidTransition {
            from,
            to,
            reason: reason.to_string(),
        };

        match transition {
            Transition::Created { .. } => return Err(reject("swap already exists")),
            Transition::OpeningPrepared { .. } => {
                if from != SwapState::Agreed || !self.is_funder() {
                    return Err(reject("only an agreed funder prepares the opening tx"));
                }
                if self.htlc.is_some() {
                    return Err(reject("opening tx already prepared"));
                }
            }
            Transition::SpendPrepared { .. } => {
                let allowed = if self.is_funder() {
                    from.can_transition_to(SwapState::RefundTxBroadcast)
                } else {
                    from == SwapState::ClaimInvoicePaid
                };
                if !allowed {
                    return Err(reject("no spend is due in this state"));
                }
                if self.prepared_spend.is_some() {
                    return Err(reject("spend already prepared"));
                }
            }
            _ => {
                if !from.can_transition_to(to) {
                    return Err(reject("not an edge of the swap state graph"));
                }
            }
        }

        let mut next = self.clone();
        match transition {
            Transition::Created { .. }
            | Transition::ClaimConfirmed
            | Transition::RefundConfirmed => {}
            Transition::RequestSent => {
                if next.role != super::Role::Initiator {
                    return Err(reject("only the initiator sends a request"));
                }
            }
            Transition::RequestReceived => {
                if next.role != super::Role::Responder {
                    return Err(reject("only the responder receives a request"));
                }
            }
            Transition::Agreed { peer_pubkey } => match &next.peer_pubkey {
                Some(existing) if existing != peer_pubkey => {
                    return Err(reject("peer pubkey changed"));
                }
                _ => next.peer_pubkey = Some(peer_pubkey.clone()),
            },
            Transition::OpeningPrepared {
                htlc,
                invoice,
                opening,
            } => {
                next.htlc = Some(htlc.clone());
                next.invoice = Some(invoice.clone());
                next.opening_tx = Some(opening.clone());
            }
            Transition::OpeningBroadcast {
                htlc,
                invoice,
                opening,
            } => {
                if let Some(existing) = &next.htlc
                    && existing != htlc
                {
                    return Err(reject("htlc params are immutable"));
                }
                if next.opening_tx_id.is_some() {
                    return Err(reject("opening txid already set"));
                }
                next.htlc = Some(htlc.clone());
                next.invoice = Some(invoice.clone());
                next.opening_tx = Some(opening.clone());
                next.opening_tx_id = Some(opening.txid.clone());
            }
            Transition::OpeningConfirmed { height } => {
                next.confirmation_height = Some(*height);
            }
            Transition::SpendPrepared { tx } => {
                next.prepared_spend = Some(tx.clone());
            }
            Transition::InvoicePaid { preimage } => {
                next.preimage = Some(preimage.clone());
            }
            Transition::ClaimBroadcast { txid } => {
                if next.claim_tx_id.is_some() {
                    return Err(reject("claim txid already set"));
                }
                if !next.is_funder() && !prepared_matches(&next, txid) {
                    return Err(reject("claim differs from the prepared spend"));
                }
                next.claim_tx_id = Some(txid.clone());
            }
            Transition::RefundBroadcast { txid } => {
                if !next.is_funder() {
                    return Err(reject("only the funder refunds"));
                }
                if next.refund_tx_id.is_some() {
                    return Err(reject("refund txid already set"));
                }
                if !prepared_matches(&next, txid) {
                    return Err(reject("refund differs from the prepared spend"));
                }
                next.refund_tx_id = Some(txid.clone());
            }
            Transition::Canceled { reason } => {
                if from.is_post_opening() && next.is_funder() {
                    return Err(reject("funder with an opening tx must refund"));
                }
                next.cancel_reason = Some(reason.clone());
            }
        }

        next.state = to;
        next.updated_at = at;
        *self = next;
        Ok(())
    }

    /// Rebuilds a swap from its transition log.
    pub fn replay(records: &[TransitionRecord]) -> Result<Swap, SwapError> {
        let mut iter = records.iter();
        let mut swap = match iter.next().map(|r| &r.transition) {
            Some(Transition::Created { swap }) => (**swap).clone(),
            _ => {
                return Err(SwapError::Other(anyhow::anyhow!(
                    "transition log must start with created"
                )));
            }
        };
        for record in iter {
            swap.apply(&record.transition, record.at)?;
        }
        Ok(swap)
    }
}

fn prepared_matches(swap: &Swap, txid: &str) -> bool {
    swap.prepared_spend
        .as_ref()
        .is_none_or(|tx| tx.txid == txid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{Asset, SwapKind};

    fn htlc() -> HtlcParams {
        HtlcParams {
            payment_hash: "11".repeat(32),
            claimer_pubkey: "02".to_string() + &"aa".repeat(32),
            funder_pubkey: "03".to_string() + &"bb".repeat(32),
            timeout_height: 500,
        }
    }

    fn opening() -> OpeningTx {
        OpeningTx {
            txid: "ab".repeat(32),
            vout: 0,
            tx_hex: None,
        }
    }

    fn claimer() -> Swap {
        Swap::new_initiator(SwapKind::SwapOut, Asset::Bitcoin, "bob", 100_000, Utc::now())
    }

    fn funder() -> Swap {
        Swap::new_initiator(SwapKind::SwapIn, Asset::Liquid, "bob", 100_000, Utc::now())
    }

    fn happy_path() -> Vec<Transition> {
        vec![
            Transition::RequestSent,
            Transition::Agreed {
                peer_pubkey: htlc().funder_pubkey,
            },
            Transition::OpeningBroadcast {
                htlc: htlc(),
                invoice: "lnbc".to_string(),
                opening: opening(),
            },
            Transition::OpeningConfirmed { height: 103 },
            Transition::InvoicePaid {
                preimage: "22".repeat(32),
            },
            Transition::ClaimBroadcast {
                txid: "cd".repeat(32),
            },
            Transition::ClaimConfirmed,
        ]
    }

    #[test]
    fn happy_path_is_a_path_through_the_graph() {
        let mut swap = claimer();
        let mut previous = swap.state;
        for t in happy_path() {
            swap.apply(&t, Utc::now()).unwrap();
            assert!(previous.can_transition_to(swap.state));
            previous = swap.state;
        }
        assert_eq!(swap.state, SwapState::ClaimTxConfirmed);
        assert!(swap.state.is_terminal());
        assert_eq!(swap.confirmation_height, Some(103));
    }

    #[test]
    fn skipping_or_reversing_is_rejected() {
        let mut swap = claimer();
        let err = swap
            .apply(&Transition::OpeningConfirmed { height: 1 }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));
        assert_eq!(swap.state, SwapState::Created);

        for t in happy_path().into_iter().take(4) {
            swap.apply(&t, Utc::now()).unwrap();
        }
        let err = swap
            .apply(&Transition::RequestSent, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));
        assert_eq!(swap.state, SwapState::OpeningTxConfirmed);
    }

    #[test]
    fn only_the_funder_refunds() {
        let mut swap = claimer();
        for t in happy_path().into_iter().take(3) {
            swap.apply(&t, Utc::now()).unwrap();
        }
        let err = swap
            .apply(
                &Transition::RefundBroadcast {
                    txid: "ef".repeat(32),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));

        // Claimer may still abandon before paying.
        swap.apply(
            &Transition::Canceled {
                reason: "timeout".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(swap.state, SwapState::Canceled);
    }

    #[test]
    fn funder_cannot_cancel_after_opening() {
        let mut swap = funder();
        swap.apply(&Transition::RequestSent, Utc::now()).unwrap();
        swap.apply(
            &Transition::Agreed {
                peer_pubkey: htlc().claimer_pubkey,
            },
            Utc::now(),
        )
        .unwrap();
        swap.apply(
            &Transition::OpeningPrepared {
                htlc: htlc(),
                invoice: "lnbc".into(),
                opening: opening(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(swap.state, SwapState::Agreed);
        swap.apply(
            &Transition::OpeningBroadcast {
                htlc: htlc(),
                invoice: "lnbc".into(),
                opening: opening(),
            },
            Utc::now(),
        )
        .unwrap();

        let err = swap
            .apply(
                &Transition::Canceled {
                    reason: "peer gone".into(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));

        swap.apply(
            &Transition::RefundBroadcast {
                txid: "ef".repeat(32),
            },
            Utc::now(),
        )
        .unwrap();
        swap.apply(&Transition::RefundConfirmed, Utc::now()).unwrap();
        assert_eq!(swap.state, SwapState::RefundTxConfirmed);
    }

    #[test]
    fn htlc_params_cannot_change_after_prepare() {
        let mut swap = funder();
        swap.apply(&Transition::RequestSent, Utc::now()).unwrap();
        swap.apply(
            &Transition::Agreed {
                peer_pubkey: htlc().claimer_pubkey,
            },
            Utc::now(),
        )
        .unwrap();
        swap.apply(
            &Transition::OpeningPrepared {
                htlc: htlc(),
                invoice: "lnbc".into(),
                opening: opening(),
            },
            Utc::now(),
        )
        .unwrap();

        let mut other = htlc();
        other.timeout_height += 1;
        let err = swap
            .apply(
                &Transition::OpeningBroadcast {
                    htlc: other,
                    invoice: "lnbc".into(),
                    opening: opening(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));
    }

    #[test]
    fn replaying_the_log_rebuilds_the_same_record() {
        let start = claimer();
        let mut live = start.clone();
        let mut records = vec![TransitionRecord {
            seq: 1,
            at: start.created_at,
            transition: Transition::Created {
                swap: Box::new(start.clone()),
            },
        }];
        for (i, t) in happy_path().into_iter().enumerate() {
            let at = Utc::now();
            live.apply(&t, at).unwrap();
            records.push(TransitionRecord {
                seq: i as u64 + 2,
                at,
                transition: t,
            });
        }

        let first = Swap::replay(&records).unwrap();
        let second = Swap::replay(&records).unwrap();
        assert_eq!(first, live);
        assert_eq!(first, second);
    }

    #[test]
    fn refund_must_match_the_prepared_spend() {
        let mut swap = funder();
        swap.apply(&Transition::RequestSent, Utc::now()).unwrap();
        swap.apply(
            &Transition::Agreed {
                peer_pubkey: htlc().claimer_pubkey,
            },
            Utc::now(),
        )
        .unwrap();
        let spend = SignedTx {
            txid: "ef".repeat(32),
            tx_hex: "00".into(),
        };
        let err = swap
            .apply(&Transition::SpendPrepared { tx: spend.clone() }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));

        swap.apply(
            &Transition::OpeningBroadcast {
                htlc: htlc(),
                invoice: "lnbc".into(),
                opening: opening(),
            },
            Utc::now(),
        )
        .unwrap();
        swap.apply(&Transition::SpendPrepared { tx: spend }, Utc::now())
            .unwrap();
        assert_eq!(swap.state, SwapState::OpeningTxBroadcast);

        let err = swap
            .apply(
                &Transition::RefundBroadcast {
                    txid: "aa".repeat(32),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidTransition { .. }));
        swap.apply(
            &Transition::RefundBroadcast {
                txid: "ef".repeat(32),
            },
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn state_names_parse_back() {
        for t in happy_path() {
            let state = t.target(SwapState::Created);
            assert_eq!(SwapState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SwapState::parse("nope"), None);
    }
}
