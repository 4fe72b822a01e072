// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Script handling
//!
//! This module is a thin adapter over the script primitives of the
//! [`bitcoin`] crate and the [`bitcoinconsensus`] verifier. It knows how to
//! recognize the standard previous-output script templates, build
//! pay-to-address scripts, produce P2PKH signature scripts and check a signed
//! input against the script it spends.

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, PublicKey, Script, SigHashType, Transaction};

use crate::error::Error;
use crate::types::Amount;

/// The standard previous-output script templates recognized by the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    /// Pay to public key hash
    PubKeyHash,
    /// Pay to script hash
    ScriptHash,
    /// Pay to raw public key
    PubKey,
    /// M-of-N bare multisig
    MultiSig,
    /// Anything else
    NonStandard,
}

/// Recognize the template of a previous-output script.
///
/// Returns the script class, the addresses the script pays to and the number
/// of signatures required to satisfy it. Non-standard scripts yield an empty
/// address list and a zero signature count.
pub fn classify_script(script: &Script, network: Network) -> (ScriptClass, Vec<Address>, usize) {
    if script.is_p2pkh() {
        let addrs = Address::from_script(script, network)
            .into_iter()
            .collect::<Vec<_>>();
        return (ScriptClass::PubKeyHash, addrs, 1);
    }
    if script.is_p2sh() {
        let addrs = Address::from_script(script, network)
            .into_iter()
            .collect::<Vec<_>>();
        return (ScriptClass::ScriptHash, addrs, 1);
    }
    if script.is_p2pk() {
        // The address of a P2PK output is the pubkey-hash address of the
        // embedded key.
        if let Some(Ok(Instruction::PushBytes(raw))) = script.instructions().next() {
            if let Ok(pubkey) = PublicKey::from_slice(raw) {
                return (
                    ScriptClass::PubKey,
                    vec![Address::p2pkh(&pubkey, network)],
                    1,
                );
            }
        }
        return (ScriptClass::PubKey, vec![], 1);
    }
    if let Some((required, addrs)) = parse_multisig(script, network) {
        return (ScriptClass::MultiSig, addrs, required);
    }

    (ScriptClass::NonStandard, vec![], 0)
}

// OP_m <pubkey>... OP_n OP_CHECKMULTISIG
fn parse_multisig(script: &Script, network: Network) -> Option<(usize, Vec<Address>)> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    if instructions.len() < 4 {
        return None;
    }

    let required = match &instructions[0] {
        Instruction::Op(op) => small_int(*op)?,
        _ => return None,
    };
    match &instructions[instructions.len() - 1] {
        Instruction::Op(op) if *op == opcodes::all::OP_CHECKMULTISIG => {}
        _ => return None,
    }
    let total = match &instructions[instructions.len() - 2] {
        Instruction::Op(op) => small_int(*op)?,
        _ => return None,
    };

    let pushes = &instructions[1..instructions.len() - 2];
    if pushes.len() != total || required > total {
        return None;
    }
    let mut addrs = Vec::with_capacity(total);
    for push in pushes {
        match push {
            Instruction::PushBytes(raw) => {
                let pubkey = PublicKey::from_slice(raw).ok()?;
                addrs.push(Address::p2pkh(&pubkey, network));
            }
            _ => return None,
        }
    }

    Some((required, addrs))
}

fn small_int(op: opcodes::All) -> Option<usize> {
    let b = op.into_u8();
    if (opcodes::all::OP_PUSHNUM_1.into_u8()..=opcodes::all::OP_PUSHNUM_16.into_u8()).contains(&b) {
        Some((b - opcodes::all::OP_PUSHNUM_1.into_u8()) as usize + 1)
    } else {
        None
    }
}

/// Build the output script paying to the given address
pub fn pay_to_address(address: &Address) -> Script {
    address.script_pubkey()
}

/// Produce the signature script satisfying `prev_script` for the input at
/// `input_index`.
///
/// The digest is the legacy preimage for `sighash_type` and the resulting
/// script pushes the DER signature (with the hash-type byte appended)
/// followed by the public key, serialized compressed or uncompressed
/// according to the private key.
pub fn signature_script(
    tx: &Transaction,
    input_index: usize,
    prev_script: &Script,
    sighash_type: SigHashType,
    key: &PrivateKey,
) -> Result<Script, Error> {
    let ctx = Secp256k1::signing_only();

    let hash = tx.signature_hash(input_index, prev_script, sighash_type.as_u32());
    let message = Message::from_slice(&hash.into_inner()[..])?;
    let signature = ctx.sign(&message, &key.key);

    let mut sig = Vec::with_capacity(75);
    sig.extend_from_slice(&signature.serialize_der());
    sig.push(sighash_type.as_u32() as u8);

    let pubkey = key.public_key(&ctx);
    Ok(Builder::new()
        .push_slice(&sig)
        .push_slice(&pubkey.to_bytes())
        .into_script())
}

/// Check a signed input against the script it spends, under the standard
/// verification flags.
///
/// `serialized_tx` is the consensus serialization of the spending
/// transaction; `value` is the value of the spent output.
pub fn verify_input(
    prev_script: &Script,
    value: Amount,
    serialized_tx: &[u8],
    input_index: usize,
) -> Result<(), Error> {
    Ok(bitcoinconsensus::verify(
        &prev_script.to_bytes(),
        value.to_sat() as u64,
        serialized_tx,
        input_index,
    )?)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::blockdata::transaction::{OutPoint, TxIn, TxOut};
    use bitcoin::consensus::serialize;

    use super::*;

    fn test_key() -> PrivateKey {
        PrivateKey::from_wif("cSYUVdPL6pkabu7Fxp4PaKqYjJFz2Aopw5ygunFbek9HAimLYxp4").unwrap()
    }

    #[test]
    fn classify_p2pkh() {
        let key = test_key();
        let addr = Address::p2pkh(
            &key.public_key(&Secp256k1::signing_only()),
            Network::Testnet,
        );
        let script = pay_to_address(&addr);

        let (class, addrs, required) = classify_script(&script, Network::Testnet);
        assert_eq!(class, ScriptClass::PubKeyHash);
        assert_eq!(addrs, vec![addr]);
        assert_eq!(required, 1);
    }

    #[test]
    fn classify_p2sh() {
        let addr = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap();
        let script = pay_to_address(&addr);

        let (class, addrs, required) = classify_script(&script, Network::Testnet);
        assert_eq!(class, ScriptClass::ScriptHash);
        assert_eq!(addrs, vec![addr]);
        assert_eq!(required, 1);
    }

    #[test]
    fn classify_p2pk() {
        let key = test_key();
        let ctx = Secp256k1::signing_only();
        let pubkey = key.public_key(&ctx);
        let script = Builder::new()
            .push_slice(&pubkey.to_bytes())
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script();

        let (class, addrs, required) = classify_script(&script, Network::Testnet);
        assert_eq!(class, ScriptClass::PubKey);
        assert_eq!(addrs, vec![Address::p2pkh(&pubkey, Network::Testnet)]);
        assert_eq!(required, 1);
    }

    #[test]
    fn classify_multisig() {
        let ctx = Secp256k1::signing_only();
        let key = test_key();
        let pubkey = key.public_key(&ctx);
        let script = Builder::new()
            .push_opcode(opcodes::all::OP_PUSHNUM_1)
            .push_slice(&pubkey.to_bytes())
            .push_slice(&pubkey.to_bytes())
            .push_opcode(opcodes::all::OP_PUSHNUM_2)
            .push_opcode(opcodes::all::OP_CHECKMULTISIG)
            .into_script();

        let (class, addrs, required) = classify_script(&script, Network::Testnet);
        assert_eq!(class, ScriptClass::MultiSig);
        assert_eq!(addrs.len(), 2);
        assert_eq!(required, 1);
    }

    #[test]
    fn classify_non_standard() {
        let script = Builder::new()
            .push_opcode(opcodes::all::OP_RETURN)
            .into_script();

        let (class, addrs, required) = classify_script(&script, Network::Testnet);
        assert_eq!(class, ScriptClass::NonStandard);
        assert!(addrs.is_empty());
        assert_eq!(required, 0);
    }

    #[test]
    fn sign_and_verify_p2pkh_input() {
        let ctx = Secp256k1::signing_only();
        let key = test_key();
        let addr = Address::p2pkh(&key.public_key(&ctx), Network::Testnet);
        let prev_script = pay_to_address(&addr);
        let value = Amount::from_sat(50_000);

        let mut tx = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: Script::new(),
                sequence: 0xFFFFFFFF,
                witness: vec![],
            }],
            output: vec![TxOut {
                value: 40_000,
                script_pubkey: prev_script.clone(),
            }],
        };

        let serialized = serialize(&tx);
        assert!(
            verify_input(&prev_script, value, &serialized, 0).is_err(),
            "unsigned input must not verify"
        );

        tx.input[0].script_sig =
            signature_script(&tx, 0, &prev_script, SigHashType::All, &key).unwrap();
        let serialized = serialize(&tx);
        verify_input(&prev_script, value, &serialized, 0).unwrap();
    }
}
