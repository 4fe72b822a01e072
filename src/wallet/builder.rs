// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Transaction building
//!
//! [`create_tx`] turns a pay-list and a set of eligible unspent outputs into
//! a fully signed and validated transaction. Selection is largest-first; the
//! fee starts from a size estimate and is raised one increment at a time
//! until the fee implied by the real serialized size stops growing past the
//! estimate. Each estimate change re-signs every input, because the
//! signature scripts are part of the measured size.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use bitcoin::blockdata::transaction::{OutPoint, TxIn, TxOut};
use bitcoin::consensus::serialize;
use bitcoin::{Address, Network, Script, SigHashType, Transaction};

use rand::{thread_rng, Rng};

use crate::error::Error;
use crate::manager::{KeySource, ManagedAddress};
use crate::script::{classify_script, pay_to_address, signature_script, verify_input, ScriptClass};
use crate::store::TxStore;
use crate::types::{confirmed, Amount, BlockStamp, CreatedTx, Credit, COINBASE_MATURITY};
use crate::wallet::fees::{estimate_tx_size, fee_for_size, minimum_fee, TX_IN_ESTIMATE};

/// Collect the unspent outputs an account may spend.
///
/// An output qualifies when it has `minconf` confirmations (coinbase outputs
/// additionally need to be mature), its outpoint is not locked, and its
/// script pays a single P2PKH address assigned to `account`. No particular
/// order is guaranteed.
pub(crate) fn find_eligible_outputs<S: TxStore, K: KeySource>(
    store: &S,
    keys: &K,
    account: u32,
    minconf: i32,
    bs: &BlockStamp,
    locked_outpoints: &HashSet<OutPoint>,
    network: Network,
) -> Result<Vec<Credit>, Error> {
    let unspent = store.unspent_outputs()?;

    let mut eligible = Vec::with_capacity(unspent.len());
    for output in unspent {
        if !confirmed(minconf, output.height, bs.height) {
            continue;
        }
        if output.from_coinbase && !confirmed(COINBASE_MATURITY, output.height, bs.height) {
            continue;
        }
        if locked_outpoints.contains(&output.outpoint) {
            continue;
        }

        // Anything that is not a single-address P2PKH output cannot be
        // signed here and must be spent through a raw transaction instead.
        let (class, addrs, _) = classify_script(&output.pk_script, network);
        if class != ScriptClass::PubKeyHash || addrs.len() != 1 {
            continue;
        }
        match keys.addr_account(&addrs[0]) {
            Ok(addr_account) if addr_account == account => {}
            _ => continue,
        }

        eligible.push(output);
    }
    Ok(eligible)
}

/// Select inputs from `eligible` sufficient to fund every pay-list entry
/// plus the mining fee, then sign and validate the result.
///
/// Leftover funds go to a change output at a randomized index, paying an
/// address obtained from `change_address` (called at most once).
pub(crate) fn create_tx<K: KeySource>(
    mut eligible: Vec<Credit>,
    outputs: &HashMap<String, Amount>,
    bs: &BlockStamp,
    fee_increment: Amount,
    keys: &K,
    account: u32,
    mut change_address: impl FnMut(u32) -> Result<Address, Error>,
    network: Network,
    disallow_free: bool,
) -> Result<CreatedTx, Error> {
    let mut tx = Transaction {
        version: 1,
        lock_time: 0,
        input: vec![],
        output: vec![],
    };
    let min_amount = add_outputs(&mut tx, outputs)?;

    // Sort ascending and pop from the back, so the largest amounts are
    // spent first and the input count stays small.
    eligible.sort_unstable_by_key(|credit| credit.amount);

    // Gather enough inputs to cover the total of the requested outputs.
    let mut inputs: Vec<Credit> = Vec::new();
    let mut total_added = Amount::ZERO;
    while total_added < min_amount {
        let input = eligible.pop().ok_or(Error::InsufficientFunds {
            available: total_added,
            needed_out: min_amount,
            needed_fee: Amount::ZERO,
        })?;
        tx.input.push(new_tx_in(&input));
        total_added += input.amount;
        inputs.push(input);
    }

    // First fee estimate, based on the estimated size with no change output.
    let mut sz_est = estimate_tx_size(inputs.len(), tx.output.len());
    let mut fee_est = minimum_fee(
        fee_increment,
        sz_est,
        &tx.output,
        &inputs,
        bs.height,
        disallow_free,
    );
    add_inputs_for_fee(
        &mut eligible,
        &mut tx,
        &mut inputs,
        &mut total_added,
        &mut sz_est,
        &mut fee_est,
        min_amount,
        fee_increment,
        bs.height,
        disallow_free,
    )?;

    let mut change_addr: Option<Address> = None;
    // change_index stays -1 until a change output is in the transaction.
    let mut change_index: i64 = -1;

    loop {
        let change = total_added - min_amount - fee_est;
        if change > Amount::ZERO {
            if change_addr.is_none() {
                change_addr = Some(change_address(account)?);
            }
            if let Some(addr) = &change_addr {
                change_index = add_change(&mut tx, change, addr) as i64;
            }
        }

        sign_tx(&mut tx, &inputs, keys, network)?;

        let required = fee_for_size(fee_increment, serialize(&tx).len());
        if required <= fee_est {
            // The fee needed for the real size is covered by the estimate.
            break;
        }

        if change > Amount::ZERO {
            // The next iteration re-adds the change output with the
            // adjusted amount.
            tx.output.remove(change_index as usize);
            change_index = -1;
        }

        fee_est += fee_increment;
        add_inputs_for_fee(
            &mut eligible,
            &mut tx,
            &mut inputs,
            &mut total_added,
            &mut sz_est,
            &mut fee_est,
            min_amount,
            fee_increment,
            bs.height,
            disallow_free,
        )?;
    }

    validate_tx(&tx, &inputs)?;

    log::debug!(
        "built transaction {} with {} inputs and {} outputs",
        tx.txid(),
        tx.input.len(),
        tx.output.len()
    );

    Ok(CreatedTx {
        tx,
        change_addr,
        change_index,
    })
}

/// Add an output for every pay-list entry, returning their total amount
fn add_outputs(tx: &mut Transaction, outputs: &HashMap<String, Amount>) -> Result<Amount, Error> {
    let mut min_amount = Amount::ZERO;
    for (addr_str, amount) in outputs {
        if *amount <= Amount::ZERO {
            return Err(Error::NonPositiveAmount);
        }
        min_amount += *amount;

        // The address decides its own script template; only *inputs* are
        // restricted to P2PKH.
        let addr = Address::from_str(addr_str)?;
        tx.output.push(TxOut {
            value: amount.to_sat() as u64,
            script_pubkey: pay_to_address(&addr),
        });
    }
    Ok(min_amount)
}

/// Keep adding inputs until their total covers the outputs plus the current
/// fee estimate. Every added input enlarges the estimated size, so the fee
/// estimate is refreshed as the set grows.
fn add_inputs_for_fee(
    eligible: &mut Vec<Credit>,
    tx: &mut Transaction,
    inputs: &mut Vec<Credit>,
    total_added: &mut Amount,
    sz_est: &mut usize,
    fee_est: &mut Amount,
    min_amount: Amount,
    fee_increment: Amount,
    height: i32,
    disallow_free: bool,
) -> Result<(), Error> {
    while *total_added < min_amount + *fee_est {
        let input = eligible.pop().ok_or(Error::InsufficientFunds {
            available: *total_added,
            needed_out: min_amount,
            needed_fee: *fee_est,
        })?;
        tx.input.push(new_tx_in(&input));
        *sz_est += TX_IN_ESTIMATE;
        *total_added += input.amount;
        inputs.push(input);
        *fee_est = minimum_fee(
            fee_increment,
            *sz_est,
            &tx.output,
            inputs,
            height,
            disallow_free,
        );
    }
    Ok(())
}

fn new_tx_in(credit: &Credit) -> TxIn {
    TxIn {
        previous_output: credit.outpoint,
        script_sig: Script::new(),
        sequence: 0xFFFFFFFF,
        witness: vec![],
    }
}

/// Append a change output and swap it to a uniformly chosen index, hiding
/// its position from passive observers. Returns the index it landed on.
fn add_change(tx: &mut Transaction, change: Amount, change_addr: &Address) -> usize {
    tx.output.push(TxOut {
        value: change.to_sat() as u64,
        script_pubkey: pay_to_address(change_addr),
    });

    let last = tx.output.len() - 1;
    let index = thread_rng().gen_range(0, tx.output.len());
    tx.output.swap(index, last);
    index
}

/// Set the signature script of every input. Must be re-run whenever the
/// transaction changes, since every signature commits to all of it.
fn sign_tx<K: KeySource>(
    tx: &mut Transaction,
    prev_credits: &[Credit],
    keys: &K,
    network: Network,
) -> Result<(), Error> {
    if prev_credits.len() != tx.input.len() {
        return Err(Error::Generic(format!(
            "number of previous credits ({}) does not match number of inputs ({})",
            prev_credits.len(),
            tx.input.len()
        )));
    }

    for (index, credit) in prev_credits.iter().enumerate() {
        let (class, addrs, _) = classify_script(&credit.pk_script, network);
        if class != ScriptClass::PubKeyHash || addrs.len() != 1 {
            return Err(Error::UnsupportedTransactionType);
        }

        let priv_key = match keys.managed_address(&addrs[0])? {
            ManagedAddress::KeyBearing { priv_key, .. } => priv_key,
            _ => return Err(Error::UnsupportedTransactionType),
        };

        let sig_script =
            signature_script(tx, index, &credit.pk_script, SigHashType::All, &priv_key)?;
        tx.input[index].script_sig = sig_script;
    }
    Ok(())
}

/// Run every input through the script verifier with the standard flags
fn validate_tx(tx: &Transaction, prev_credits: &[Credit]) -> Result<(), Error> {
    let serialized = serialize(tx);
    for index in 0..tx.input.len() {
        verify_input(
            &prev_credits[index].pk_script,
            prev_credits[index].amount,
            &serialized,
            index,
        )?;
    }
    Ok(())
}
