use anyhow::{Context as _, Result};
use lwk_wollet::elements::bitcoin::hashes::{Hash as _, sha256};
use lwk_wollet::elements::bitcoin::secp256k1::Message as BitcoinMessage;
use lwk_wollet::elements::bitcoin::secp256k1::PublicKey as BitcoinPublicKey;
use lwk_wollet::elements::bitcoin::secp256k1::Secp256k1 as BitcoinSecp256k1;
use lwk_wollet::elements::bitcoin::secp256k1::SecretKey as BitcoinSecretKey;
use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::opcodes;
use lwk_wollet::elements::script::{Builder, Script};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{
    Address, AddressParams, AssetId, EcdsaSighashType, LockTime, OutPoint, Sequence, Transaction,
    TxIn, TxInWitness, TxOut, TxOutWitness, Txid,
};

use crate::swap::HtlcParams;

/// Liquid flavour of the swap HTLC. Same script shape as the Bitcoin one,
/// locking an explicit L-BTC output.
#[derive(Debug, Clone)]
pub struct HtlcSpec {
    pub payment_hash: [u8; 32],
    pub claimer_pubkey: [u8; 33],
    pub funder_pubkey: [u8; 33],
    pub timeout_height: u32,
}

impl HtlcSpec {
    pub fn from_params(params: &HtlcParams) -> Result<Self> {
        Ok(Self {
            payment_hash: params.payment_hash_bytes()?,
            claimer_pubkey: parse_pubkey(&params.claimer_pubkey).context("claimer pubkey")?,
            funder_pubkey: parse_pubkey(&params.funder_pubkey).context("funder pubkey")?,
            timeout_height: params.timeout_height,
        })
    }

    pub fn witness_script(&self) -> Script {
        Builder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(&self.payment_hash)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_slice(&self.claimer_pubkey)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.timeout_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_slice(&self.funder_pubkey)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }

    pub fn p2wsh_address(&self, params: &'static AddressParams) -> Address {
        Address::p2wsh(&self.witness_script(), None, params)
    }

    /// Output script of the HTLC; identical on every Elements network.
    pub fn script_pubkey(&self) -> Script {
        self.p2wsh_address(&AddressParams::ELEMENTS).script_pubkey()
    }
}

/// The HTLC output as found in the opening transaction.
#[derive(Debug, Clone)]
pub struct HtlcOutput {
    pub txid: Txid,
    pub vout: u32,
    pub amount_sat: u64,
    pub policy_asset: AssetId,
}

pub fn claim_tx(
    spec: &HtlcSpec,
    output: &HtlcOutput,
    destination: &Address,
    claimer_secret_key: &BitcoinSecretKey,
    preimage: [u8; 32],
    fee_sats: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        sha256_preimage(&preimage) == spec.payment_hash,
        "preimage does not match htlc payment hash"
    );
    let witness_script = spec.witness_script();
    let mut tx = spend_tx(output, destination, fee_sats, LockTime::ZERO, Sequence::MAX)?;

    let sig = sign_input(&tx, &witness_script, output.amount_sat, claimer_secret_key)
        .context("sign claim input")?;
    tx.input[0].witness.script_witness = vec![
        sig,
        preimage.to_vec(),
        vec![1u8],
        witness_script.to_bytes(),
    ];
    Ok(tx)
}

pub fn refund_tx(
    spec: &HtlcSpec,
    output: &HtlcOutput,
    destination: &Address,
    funder_secret_key: &BitcoinSecretKey,
    fee_sats: u64,
) -> Result<Transaction> {
    let witness_script = spec.witness_script();
    let lock_time = LockTime::from_height(spec.timeout_height)
        .context("timeout_height is invalid locktime")?;
    let mut tx = spend_tx(
        output,
        destination,
        fee_sats,
        lock_time,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )?;

    let sig = sign_input(&tx, &witness_script, output.amount_sat, funder_secret_key)
        .context("sign refund input")?;
    tx.input[0].witness.script_witness = vec![sig, vec![], witness_script.to_bytes()];
    Ok(tx)
}

fn spend_tx(
    output: &HtlcOutput,
    destination: &Address,
    fee_sats: u64,
    lock_time: LockTime,
    sequence: Sequence,
) -> Result<Transaction> {
    anyhow::ensure!(
        fee_sats < output.amount_sat,
        "fee_sats must be less than the htlc amount"
    );

    Ok(Transaction {
        version: 2,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: output.txid,
                vout: output.vout,
            },
            is_pegin: false,
            script_sig: Script::new(),
            sequence,
            asset_issuance: Default::default(),
            witness: TxInWitness::default(),
        }],
        output: vec![
            TxOut {
                asset: Asset::Explicit(output.policy_asset),
                value: Value::Explicit(output.amount_sat - fee_sats),
                nonce: Nonce::Null,
                script_pubkey: destination.script_pubkey(),
                witness: TxOutWitness::default(),
            },
            TxOut::new_fee(fee_sats, output.policy_asset),
        ],
    })
}

fn sign_input(
    tx: &Transaction,
    witness_script: &Script,
    value: u64,
    secret_key: &BitcoinSecretKey,
) -> Result<Vec<u8>> {
    let secp = BitcoinSecp256k1::signing_only();
    let sighash_type = EcdsaSighashType::All;
    let sighash = SighashCache::new(tx).segwitv0_sighash(
        0,
        witness_script,
        Value::Explicit(value),
        sighash_type,
    );

    let msg = BitcoinMessage::from_digest_slice(&sighash.to_byte_array())
        .context("create sighash message")?;
    let mut sig = secp.sign_ecdsa(&msg, secret_key).serialize_der().to_vec();
    sig.push(sighash_type.as_u32() as u8);
    Ok(sig)
}

pub fn secret_key_from_hex(secret_hex: &str) -> Result<BitcoinSecretKey> {
    let bytes = hex::decode(secret_hex).context("decode swap secret key")?;
    BitcoinSecretKey::from_slice(&bytes).context("parse swap secret key")
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

fn parse_pubkey(pubkey_hex: &str) -> Result<[u8; 33]> {
    let bytes = hex::decode(pubkey_hex).context("decode pubkey hex")?;
    let key = BitcoinPublicKey::from_slice(&bytes).context("parse pubkey")?;
    Ok(key.serialize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{generate_secret_key, pubkey_from_secret};
    use std::str::FromStr as _;

    fn spec(preimage: &[u8; 32], claimer: &str, funder: &str) -> HtlcSpec {
        HtlcSpec::from_params(&HtlcParams {
            payment_hash: hex::encode(sha256_preimage(preimage)),
            claimer_pubkey: pubkey_from_secret(claimer).unwrap(),
            funder_pubkey: pubkey_from_secret(funder).unwrap(),
            timeout_height: 250,
        })
        .unwrap()
    }

    fn output() -> HtlcOutput {
        HtlcOutput {
            txid: Txid::from_str(&"22".repeat(32)).unwrap(),
            vout: 0,
            amount_sat: 20_000,
            policy_asset: AssetId::from_slice(&[5u8; 32]).unwrap(),
        }
    }

    fn destination(s: &HtlcSpec) -> Address {
        s.p2wsh_address(&AddressParams::ELEMENTS)
    }

    #[test]
    fn claim_spends_with_preimage_branch() {
        let preimage = [4u8; 32];
        let claimer = generate_secret_key();
        let s = spec(&preimage, &claimer, &generate_secret_key());
        let key = secret_key_from_hex(&claimer).unwrap();

        let tx = claim_tx(&s, &output(), &destination(&s), &key, preimage, 100).unwrap();
        let witness = &tx.input[0].witness.script_witness;
        assert_eq!(witness[1], preimage.to_vec());
        assert_eq!(witness[2], vec![1u8]);
        assert_eq!(tx.output.len(), 2);
        assert!(tx.output[1].is_fee());
    }

    #[test]
    fn refund_sets_locktime() {
        let funder = generate_secret_key();
        let s = spec(&[6u8; 32], &generate_secret_key(), &funder);
        let key = secret_key_from_hex(&funder).unwrap();

        let tx = refund_tx(&s, &output(), &destination(&s), &key, 100).unwrap();
        assert_eq!(tx.lock_time, LockTime::from_height(250).unwrap());
        assert!(tx.input[0].witness.script_witness[1].is_empty());
    }

    #[test]
    fn wrong_preimage_is_rejected() {
        let claimer = generate_secret_key();
        let s = spec(&[1u8; 32], &claimer, &generate_secret_key());
        let key = secret_key_from_hex(&claimer).unwrap();
        assert!(claim_tx(&s, &output(), &destination(&s), &key, [2u8; 32], 100).is_err());
    }
}
