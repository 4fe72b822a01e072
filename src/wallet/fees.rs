// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Fee and priority arithmetic
//!
//! Transaction sizes are estimated before any signature exists, so the
//! constants here describe a worst-case compressed-pubkey P2PKH spend with a
//! low-S DER signature. The build loop starts from these estimates and
//! converges on the real serialized size.

use bitcoin::TxOut;

use crate::types::{confirms, Amount, Credit};

// Version (4), locktime (4) and one varint each for the input and output
// counts.
pub(crate) const TX_OVERHEAD_ESTIMATE: usize = 4 + 4 + 1 + 1;

// A worst-case P2PKH signature script: data push (1) + DER signature with
// the hash-type byte (72), data push (1) + serialized compressed pubkey (33).
pub(crate) const SIG_SCRIPT_ESTIMATE: usize = 1 + 72 + 1 + 33;

// Previous txid (32), output index (4), sequence (4), script-length varint
// (1) and the signature script.
pub(crate) const TX_IN_ESTIMATE: usize = 32 + 4 + 4 + 1 + SIG_SCRIPT_ESTIMATE;

// OP_DUP OP_HASH160 <20-byte hash> OP_EQUALVERIFY OP_CHECKSIG
pub(crate) const PK_SCRIPT_ESTIMATE: usize = 1 + 1 + 1 + 20 + 1 + 1;

// Value (8), script-length varint (1) and the pkScript.
pub(crate) const TX_OUT_ESTIMATE: usize = 8 + 1 + PK_SCRIPT_ESTIMATE;

/// The fee floor added per started kilobyte when a transaction requires a
/// fee (0.00001 coin)
pub const DEFAULT_FEE_INCREMENT: Amount = Amount::from_sat(1_000);

/// Estimated serialized size of a transaction with `num_inputs` P2PKH
/// inputs and `num_outputs` P2PKH outputs
pub(crate) fn estimate_tx_size(num_inputs: usize, num_outputs: usize) -> usize {
    TX_OVERHEAD_ESTIMATE + TX_IN_ESTIMATE * num_inputs + TX_OUT_ESTIMATE * num_outputs
}

/// Fee for a transaction of `size` bytes, at `incr` per started kilobyte
pub(crate) fn fee_for_size(incr: Amount, size: usize) -> Amount {
    incr * (1 + size as i64 / 1000)
}

/// Estimate the minimum fee required for a transaction.
///
/// Unless `disallow_free` is set, the fee may be zero when the inputs carry
/// enough priority and the transaction stays under a kilobyte. A fee below
/// one increment is raised to a full increment when any output is smaller
/// than one bitcent.
pub(crate) fn minimum_fee(
    incr: Amount,
    tx_size: usize,
    outputs: &[TxOut],
    prev_credits: &[Credit],
    height: i32,
    disallow_free: bool,
) -> Amount {
    let allow_free = !disallow_free && allow_no_fee_tx(height, prev_credits, tx_size);
    let mut fee = fee_for_size(incr, tx_size);

    if allow_free && tx_size < 1000 {
        fee = Amount::ZERO;
    }

    if fee < incr {
        for txout in outputs {
            if (txout.value as i64) < Amount::SAT_PER_CENT {
                return incr;
            }
        }
    }

    if fee > Amount::MAX_MONEY {
        fee = Amount::MAX_MONEY;
    }

    fee
}

/// Whether the inputs carry enough priority for the transaction to go out
/// without a fee
pub(crate) fn allow_no_fee_tx(cur_height: i32, credits: &[Credit], tx_size: usize) -> bool {
    const BLOCKS_PER_DAY_ESTIMATE: f64 = 144.0;
    const TX_SIZE_ESTIMATE: f64 = 250.0;
    const THRESHOLD: f64 =
        Amount::SAT_PER_COIN as f64 * BLOCKS_PER_DAY_ESTIMATE / TX_SIZE_ESTIMATE;

    let mut weighted_sum: i64 = 0;
    for credit in credits {
        let depth = confirms(credit.height, cur_height);
        weighted_sum += credit.amount.to_sat() * depth as i64;
    }
    let priority = weighted_sum as f64 / tx_size as f64;
    priority > THRESHOLD
}

#[cfg(test)]
mod test {
    use bitcoin::{OutPoint, Script};

    use super::*;

    fn credit(amount: i64, height: i32) -> Credit {
        Credit {
            outpoint: OutPoint::default(),
            amount: Amount::from_sat(amount),
            pk_script: Script::new(),
            height,
            received: 0,
            from_coinbase: false,
        }
    }

    fn txout(value: u64) -> TxOut {
        TxOut {
            value,
            script_pubkey: Script::new(),
        }
    }

    const INCR: Amount = Amount::from_sat(1_000);

    #[test]
    fn fee_steps_per_started_kilobyte() {
        assert_eq!(fee_for_size(INCR, 0), Amount::from_sat(1_000));
        assert_eq!(fee_for_size(INCR, 999), Amount::from_sat(1_000));
        assert_eq!(fee_for_size(INCR, 1000), Amount::from_sat(2_000));
        assert_eq!(fee_for_size(INCR, 2500), Amount::from_sat(3_000));
    }

    #[test]
    fn size_estimate() {
        assert_eq!(estimate_tx_size(0, 0), 10);
        assert_eq!(estimate_tx_size(3, 3), 10 + 3 * 148 + 3 * 34);
    }

    #[test]
    fn high_priority_small_tx_is_free() {
        // One coin at depth 2000 against a 250-byte transaction is far over
        // the priority threshold.
        let credits = vec![credit(Amount::SAT_PER_COIN, 1)];
        assert!(allow_no_fee_tx(2_000, &credits, 250));

        let outputs = vec![txout(50_000_000)];
        let fee = minimum_fee(INCR, 250, &outputs, &credits, 2_000, false);
        assert_eq!(fee, Amount::ZERO);
    }

    #[test]
    fn disallow_free_overrides_priority() {
        let credits = vec![credit(Amount::SAT_PER_COIN, 1)];
        let outputs = vec![txout(50_000_000)];
        let fee = minimum_fee(INCR, 250, &outputs, &credits, 2_000, true);
        assert_eq!(fee, INCR);
    }

    #[test]
    fn unmined_inputs_have_no_priority() {
        let credits = vec![credit(Amount::SAT_PER_COIN, -1)];
        assert!(!allow_no_fee_tx(2_000, &credits, 250));
    }

    #[test]
    fn small_outputs_force_a_fee() {
        // Free-eligible, but one output is below a bitcent.
        let credits = vec![credit(Amount::SAT_PER_COIN, 1)];
        let outputs = vec![txout(50_000_000), txout(100)];
        let fee = minimum_fee(INCR, 250, &outputs, &credits, 2_000, false);
        assert_eq!(fee, INCR);
    }

    #[test]
    fn fee_is_clamped_to_max_money() {
        let huge = Amount::MAX_MONEY;
        let fee = minimum_fee(huge, 5_000, &[txout(50_000_000)], &[], 0, true);
        assert_eq!(fee, Amount::MAX_MONEY);
    }
}
