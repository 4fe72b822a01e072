// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Transaction store interface
//!
//! The store keeps the wallet's transaction history and its set of unspent
//! outputs. Like the address manager it is an external collaborator: the
//! wallet consumes it through the [`TxStore`] trait and ships
//! [`MemoryStore`] as the in-memory implementation used by the tests.

use std::sync::RwLock;

use bitcoin::{OutPoint, Transaction};

use crate::error::Error;
use crate::types::{confirmed, confirms, Amount, BlockMeta, Credit, TxRecord, COINBASE_MATURITY};

/// A credit (output paying the wallet) inside a stored transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditEntry {
    /// Output index inside the transaction
    pub index: u32,
    /// Value of the output
    pub amount: Amount,
    /// Whether the output is change back to the wallet
    pub change: bool,
}

/// A stored transaction with its block (if mined) and its wallet credits
#[derive(Debug, Clone)]
pub struct TxDetails {
    /// The stored record
    pub record: TxRecord,
    /// The block the transaction was mined in, if any
    pub block: Option<BlockMeta>,
    /// Outputs of the transaction that pay the wallet
    pub credits: Vec<CreditEntry>,
}

/// The transaction-store operations the wallet consumes.
///
/// Implementations are shared across the wallet's workers, so every method
/// takes `&self`; interior locking is the implementation's business.
pub trait TxStore: Send + Sync + 'static {
    /// All outputs paying the wallet that no known transaction spends
    fn unspent_outputs(&self) -> Result<Vec<Credit>, Error>;

    /// Record a relevant transaction, marking the outputs it spends as spent.
    /// `block` is `None` for unmined transactions.
    fn insert_tx(&self, record: &TxRecord, block: Option<&BlockMeta>) -> Result<(), Error>;

    /// Mark an output of a previously inserted transaction as paying the
    /// wallet, adding it to the unspent set
    fn add_credit(
        &self,
        record: &TxRecord,
        block: Option<&BlockMeta>,
        index: u32,
        change: bool,
    ) -> Result<(), Error>;

    /// Transactions recorded but not known to have been mined
    fn unmined_txs(&self) -> Result<Vec<Transaction>, Error>;

    /// Total value of unspent outputs with at least `minconf` confirmations
    /// at `tip_height`. Immature coinbase outputs are never counted.
    fn balance(&self, minconf: i32, tip_height: i32) -> Result<Amount, Error>;

    /// Visit stored transactions mined between `start` and `end` (inclusive
    /// heights; a negative `end` removes the bound and includes unmined
    /// transactions). The visitor returns `true` to stop early.
    fn range_transactions(
        &self,
        start: i32,
        end: i32,
        visitor: &mut dyn FnMut(&TxDetails) -> Result<bool, Error>,
    ) -> Result<(), Error>;
}

#[derive(Default)]
struct StoreInner {
    txs: Vec<TxDetails>,
    unspent: Vec<Credit>,
}

/// In-memory [`TxStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Seed the unspent set directly, without going through
    /// [`insert_tx`](TxStore::insert_tx). Intended for embedders loading
    /// state and for tests.
    pub fn add_unspent(&self, credit: Credit) {
        let mut inner = self.inner.write().unwrap();
        inner.unspent.retain(|c| c.outpoint != credit.outpoint);
        inner.unspent.push(credit);
    }
}

impl TxStore for MemoryStore {
    fn unspent_outputs(&self) -> Result<Vec<Credit>, Error> {
        Ok(self.inner.read().unwrap().unspent.clone())
    }

    fn insert_tx(&self, record: &TxRecord, block: Option<&BlockMeta>) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();

        // Anything this transaction spends is no longer unspent.
        inner.unspent.retain(|credit| {
            !record
                .transaction
                .input
                .iter()
                .any(|txin| txin.previous_output == credit.outpoint)
        });

        match inner.txs.iter_mut().find(|d| d.record.txid == record.txid) {
            Some(details) => details.block = block.cloned(),
            None => inner.txs.push(TxDetails {
                record: record.clone(),
                block: block.cloned(),
                credits: Vec::new(),
            }),
        }
        Ok(())
    }

    fn add_credit(
        &self,
        record: &TxRecord,
        block: Option<&BlockMeta>,
        index: u32,
        change: bool,
    ) -> Result<(), Error> {
        let txout = record
            .transaction
            .output
            .get(index as usize)
            .ok_or_else(|| Error::Generic(format!("no output {} in {}", index, record.txid)))?;
        let credit = Credit {
            outpoint: OutPoint::new(record.txid, index),
            amount: Amount::from_sat(txout.value as i64),
            pk_script: txout.script_pubkey.clone(),
            height: block.map(|b| b.stamp.height).unwrap_or(-1),
            received: record.received,
            from_coinbase: record.transaction.is_coin_base(),
        };
        let entry = CreditEntry {
            index,
            amount: credit.amount,
            change,
        };

        let mut inner = self.inner.write().unwrap();
        match inner.txs.iter_mut().find(|d| d.record.txid == record.txid) {
            Some(details) => {
                details.credits.retain(|c| c.index != index);
                details.credits.push(entry);
            }
            None => {
                return Err(Error::Generic(format!(
                    "credit added for unknown transaction {}",
                    record.txid
                )))
            }
        }
        inner.unspent.retain(|c| c.outpoint != credit.outpoint);
        inner.unspent.push(credit);
        Ok(())
    }

    fn unmined_txs(&self) -> Result<Vec<Transaction>, Error> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .txs
            .iter()
            .filter(|d| d.block.is_none())
            .map(|d| d.record.transaction.clone())
            .collect())
    }

    fn balance(&self, minconf: i32, tip_height: i32) -> Result<Amount, Error> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .unspent
            .iter()
            .filter(|c| confirmed(minconf, c.height, tip_height))
            .filter(|c| !c.from_coinbase || confirms(c.height, tip_height) >= COINBASE_MATURITY)
            .map(|c| c.amount)
            .sum())
    }

    fn range_transactions(
        &self,
        start: i32,
        end: i32,
        visitor: &mut dyn FnMut(&TxDetails) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        let inner = self.inner.read().unwrap();
        for details in inner.txs.iter() {
            let in_range = match (&details.block, end < 0) {
                (_, true) => true,
                (Some(meta), false) => {
                    meta.stamp.height >= start && meta.stamp.height <= end
                }
                (None, false) => false,
            };
            if !in_range {
                continue;
            }
            if visitor(details)? {
                break;
            }
        }
        Ok(())
    }
}
