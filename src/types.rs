// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use bitcoin::blockdata::transaction::{OutPoint, Transaction};
use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::{Address, Script};

use serde::{Deserialize, Serialize};

/// Number of confirmations a coinbase output needs before it may be spent
pub const COINBASE_MATURITY: i32 = 100;

/// A monetary value, expressed in the smallest indivisible unit (satoshi).
///
/// Arithmetic on [`Amount`] saturates into `[-MAX_MONEY, MAX_MONEY]` instead
/// of wrapping. Negative values only occur as transient states during fee
/// computation and never describe an output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    /// Zero satoshi
    pub const ZERO: Amount = Amount(0);
    /// Satoshi in one coin
    pub const SAT_PER_COIN: i64 = 100_000_000;
    /// Satoshi in one hundredth of a coin
    pub const SAT_PER_CENT: i64 = 1_000_000;
    /// The maximum representable monetary value
    pub const MAX_MONEY: Amount = Amount(21_000_000 * Amount::SAT_PER_COIN);

    /// Create an [`Amount`] from a satoshi count
    pub const fn from_sat(sat: i64) -> Amount {
        Amount(sat)
    }

    /// Return the value as a signed satoshi count
    pub fn to_sat(self) -> i64 {
        self.0
    }

    fn saturate(sat: i64) -> Amount {
        if sat > Amount::MAX_MONEY.0 {
            Amount::MAX_MONEY
        } else if sat < -Amount::MAX_MONEY.0 {
            Amount(-Amount::MAX_MONEY.0)
        } else {
            Amount(sat)
        }
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount::saturate(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        *self = *self + rhs;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount::saturate(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for Amount {
    type Output = Amount;

    fn mul(self, rhs: i64) -> Amount {
        Amount::saturate(self.0.saturating_mul(rhs))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, x| acc + x)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// Block hash and height identifying the wallet's synced tip
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStamp {
    /// Hash of the block
    pub hash: BlockHash,
    /// Height of the block in the chain
    pub height: i32,
}

/// A [`BlockStamp`] together with the block's timestamp
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMeta {
    /// Hash and height of the block
    pub stamp: BlockStamp,
    /// Block timestamp in seconds since the epoch
    pub time: u64,
}

/// An unspent transaction output known to the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credit {
    /// Reference to the transaction output
    pub outpoint: OutPoint,
    /// Value of the output
    pub amount: Amount,
    /// The previous-output script
    pub pk_script: Script,
    /// Height of the block the output was mined in, or -1 if unmined
    pub height: i32,
    /// When the output was first seen, in seconds since the epoch
    pub received: u64,
    /// Whether the output was created by a coinbase transaction
    pub from_coinbase: bool,
}

/// A transaction relevant to the wallet, as handed to the transaction store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// The transaction itself
    pub transaction: Transaction,
    /// Cached hash of `transaction`
    pub txid: Txid,
    /// When the transaction was first seen, in seconds since the epoch
    pub received: u64,
}

impl TxRecord {
    /// Build a record from a transaction and the time it was first seen
    pub fn from_transaction(transaction: Transaction, received: u64) -> TxRecord {
        let txid = transaction.txid();
        TxRecord {
            transaction,
            txid,
            received,
        }
    }
}

/// A newly built transaction, along with the change output added to it
/// (if one was needed)
#[derive(Debug, Clone)]
pub struct CreatedTx {
    /// The signed transaction
    pub tx: Transaction,
    /// The address the change output pays to
    pub change_addr: Option<Address>,
    /// Index of the change output, or -1 if no change was added
    pub change_index: i64,
}

/// Number of confirmations for a transaction mined at `tx_height` given the
/// current chain height. Unmined transactions (height -1) have zero
/// confirmations.
pub fn confirms(tx_height: i32, cur_height: i32) -> i32 {
    if tx_height == -1 || tx_height > cur_height {
        0
    } else {
        cur_height - tx_height + 1
    }
}

/// Whether a transaction mined at `tx_height` has reached `minconf`
/// confirmations at the current chain height
pub fn confirmed(minconf: i32, tx_height: i32, cur_height: i32) -> bool {
    confirms(tx_height, cur_height) >= minconf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn amount_saturates_at_max_money() {
        assert_eq!(Amount::MAX_MONEY + Amount::from_sat(1), Amount::MAX_MONEY);
        assert_eq!(
            Amount::MAX_MONEY * 2,
            Amount::MAX_MONEY,
            "multiplication saturates too"
        );
        assert_eq!(
            Amount::ZERO - Amount::MAX_MONEY - Amount::from_sat(1),
            Amount::ZERO - Amount::MAX_MONEY
        );
    }

    #[test]
    fn amount_allows_transient_negatives() {
        let fee = Amount::from_sat(1_000);
        let change = Amount::from_sat(500) - fee;
        assert_eq!(change.to_sat(), -500);
        assert!(change < Amount::ZERO);
    }

    #[test]
    fn confirmations() {
        assert_eq!(confirms(-1, 100), 0);
        assert_eq!(confirms(101, 100), 0);
        assert_eq!(confirms(100, 100), 1);
        assert_eq!(confirms(90, 100), 11);
        assert!(confirmed(0, -1, 100));
        assert!(!confirmed(1, -1, 100));
        assert!(confirmed(6, 95, 100));
        assert!(!confirmed(7, 95, 100));
    }
}
