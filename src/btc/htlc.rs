use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::opcodes::all as op;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness, ecdsa,
};

use crate::swap::{HtlcParams, OpeningTx, decode_32, parse_pubkey};

#[derive(Debug, Clone)]
pub struct HtlcScript {
    pub payment_hash: [u8; 32],
    pub claimer: PublicKey,
    pub funder: PublicKey,
    pub timeout_height: u32,
}

impl HtlcScript {
    pub fn from_params(params: &HtlcParams) -> Result<Self> {
        Ok(Self {
            payment_hash: params.payment_hash_bytes()?,
            claimer: PublicKey::new(parse_pubkey(&params.claimer_pubkey)?),
            funder: PublicKey::new(parse_pubkey(&params.funder_pubkey)?),
            timeout_height: params.timeout_height,
        })
    }

    pub fn witness_script(&self) -> Result<ScriptBuf> {
        let hash = PushBytesBuf::try_from(self.payment_hash.to_vec())
            .context("payment hash push")?;
        Ok(Builder::new()
            .push_opcode(op::OP_IF)
            .push_opcode(op::OP_SIZE)
            .push_int(32)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_SHA256)
            .push_slice(&hash)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_key(&self.claimer)
            .push_opcode(op::OP_ELSE)
            .push_int(i64::from(self.timeout_height))
            .push_opcode(op::OP_CLTV)
            .push_opcode(op::OP_DROP)
            .push_key(&self.funder)
            .push_opcode(op::OP_ENDIF)
            .push_opcode(op::OP_CHECKSIG)
            .into_script())
    }

    pub fn script_pubkey(&self) -> Result<ScriptBuf> {
        Ok(ScriptBuf::new_p2wsh(&self.witness_script()?.wscript_hash()))
    }
}

/// Spends the HTLC output through the preimage branch.
pub fn claim_tx(
    htlc: &HtlcScript,
    opening: &OpeningTx,
    amount_sat: u64,
    destination: &Address,
    secret_key: &SecretKey,
    preimage: &[u8; 32],
    fee_sat: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        sha256::Hash::hash(preimage).to_byte_array() == htlc.payment_hash,
        "preimage does not match htlc payment hash"
    );
    let witness_script = htlc.witness_script()?;
    let mut tx = spend_tx(
        opening,
        amount_sat,
        destination,
        fee_sat,
        LockTime::ZERO,
        Sequence::MAX,
    )?;
    let sig = sign_input(&tx, &witness_script, amount_sat, secret_key)?;
    tx.input[0].witness = Witness::from_slice(&[
        sig,
        preimage.to_vec(),
        vec![1u8],
        witness_script.to_bytes(),
    ]);
    Ok(tx)
}

/// Spends the HTLC output through the timeout branch. Only valid from `timeout_height` on.
pub fn refund_tx(
    htlc: &HtlcScript,
    opening: &OpeningTx,
    amount_sat: u64,
    destination: &Address,
    secret_key: &SecretKey,
    fee_sat: u64,
) -> Result<Transaction> {
    let witness_script = htlc.witness_script()?;
    let lock_time = LockTime::from_height(htlc.timeout_height)
        .context("timeout_height is invalid locktime")?;
    let mut tx = spend_tx(
        opening,
        amount_sat,
        destination,
        fee_sat,
        lock_time,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )?;
    let sig = sign_input(&tx, &witness_script, amount_sat, secret_key)?;
    tx.input[0].witness =
        Witness::from_slice(&[sig, Vec::new(), witness_script.to_bytes()]);
    Ok(tx)
}

fn spend_tx(
    opening: &OpeningTx,
    amount_sat: u64,
    destination: &Address,
    fee_sat: u64,
    lock_time: LockTime,
    sequence: Sequence,
) -> Result<Transaction> {
    anyhow::ensure!(
        fee_sat < amount_sat,
        "fee {fee_sat} must be below htlc amount {amount_sat}"
    );
    let txid = Txid::from_str(&opening.txid).context("parse opening txid")?;

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid,
                vout: opening.vout,
            },
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(amount_sat - fee_sat),
            script_pubkey: destination.script_pubkey(),
        }],
    })
}

fn sign_input(
    tx: &Transaction,
    witness_script: &ScriptBuf,
    amount_sat: u64,
    secret_key: &SecretKey,
) -> Result<Vec<u8>> {
    let sighash_type = EcdsaSighashType::All;
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(0, witness_script, Amount::from_sat(amount_sat), sighash_type)
        .context("compute p2wsh sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = Secp256k1::signing_only().sign_ecdsa(&msg, secret_key);
    Ok(ecdsa::Signature {
        signature,
        sighash_type,
    }
    .to_vec())
}

pub fn secret_key_from_hex(secret_hex: &str) -> Result<SecretKey> {
    let bytes = decode_32(secret_hex).context("decode swap secret key")?;
    SecretKey::from_slice(&bytes).context("parse swap secret key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{generate_secret_key, pubkey_from_secret};
    use bitcoin::Network;

    fn params(preimage: &[u8; 32], claimer: &str, funder: &str) -> HtlcParams {
        HtlcParams {
            payment_hash: hex::encode(sha256::Hash::hash(preimage).to_byte_array()),
            claimer_pubkey: pubkey_from_secret(claimer).unwrap(),
            funder_pubkey: pubkey_from_secret(funder).unwrap(),
            timeout_height: 800,
        }
    }

    fn destination() -> Address {
        let key = secret_key_from_hex(&generate_secret_key()).unwrap();
        let pubkey = bitcoin::CompressedPublicKey::from_private_key(
            &Secp256k1::new(),
            &bitcoin::PrivateKey::new(key, Network::Regtest),
        )
        .unwrap();
        Address::p2wpkh(&pubkey, Network::Regtest)
    }

    fn opening() -> OpeningTx {
        OpeningTx {
            txid: "11".repeat(32),
            vout: 1,
            tx_hex: None,
        }
    }

    #[test]
    fn script_pubkey_is_p2wsh_and_depends_on_timeout() {
        let preimage = [7u8; 32];
        let mut p = params(&preimage, &generate_secret_key(), &generate_secret_key());
        let a = HtlcScript::from_params(&p).unwrap().script_pubkey().unwrap();
        assert!(a.is_p2wsh());
        p.timeout_height += 1;
        let b = HtlcScript::from_params(&p).unwrap().script_pubkey().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn claim_witness_carries_preimage_and_script() {
        let preimage = [9u8; 32];
        let claimer = generate_secret_key();
        let p = params(&preimage, &claimer, &generate_secret_key());
        let htlc = HtlcScript::from_params(&p).unwrap();
        let key = secret_key_from_hex(&claimer).unwrap();

        let tx = claim_tx(&htlc, &opening(), 100_000, &destination(), &key, &preimage, 500)
            .unwrap();
        assert_eq!(tx.output[0].value, Amount::from_sat(99_500));
        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 4);
        assert_eq!(witness[1], &preimage[..]);
        assert_eq!(witness[3], htlc.witness_script().unwrap().as_bytes());
    }

    #[test]
    fn claim_rejects_wrong_preimage() {
        let p = params(&[1u8; 32], &generate_secret_key(), &generate_secret_key());
        let htlc = HtlcScript::from_params(&p).unwrap();
        let key = secret_key_from_hex(&generate_secret_key()).unwrap();
        assert!(claim_tx(&htlc, &opening(), 100_000, &destination(), &key, &[2u8; 32], 500).is_err());
    }

    #[test]
    fn refund_is_time_locked_to_timeout_height() {
        let funder = generate_secret_key();
        let p = params(&[3u8; 32], &generate_secret_key(), &funder);
        let htlc = HtlcScript::from_params(&p).unwrap();
        let key = secret_key_from_hex(&funder).unwrap();

        let tx = refund_tx(&htlc, &opening(), 50_000, &destination(), &key, 300).unwrap();
        assert_eq!(tx.lock_time, LockTime::from_height(800).unwrap());
        assert!(tx.input[0].sequence.enables_absolute_lock_time());
        assert!(tx.input[0].witness.nth(1).unwrap().is_empty());
    }
}
