// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Chain server interface
//!
//! The wallet is not a node: it learns about blocks and relevant
//! transactions from a chain server and hands finished transactions back to
//! it for relay. [`ChainClient`] is the contract for that server connection.

use std::sync::mpsc::Receiver;

use bitcoin::{Address, Block, BlockHash, Transaction, Txid};

use crate::error::Error;
use crate::types::{BlockMeta, BlockStamp, TxRecord};

/// A transaction relevant to the wallet, with the block it was mined in
/// (if any)
#[derive(Debug, Clone)]
pub struct RelevantTx {
    /// The transaction record
    pub record: TxRecord,
    /// The block the transaction was mined in, `None` while unmined
    pub block: Option<BlockMeta>,
}

/// Events the chain server pushes at the wallet
#[derive(Debug, Clone)]
pub enum ChainNotification {
    /// A block was attached to the main chain
    BlockConnected(BlockMeta),
    /// A block was detached from the main chain
    BlockDisconnected(BlockMeta),
    /// A transaction paying a watched address was seen
    RelevantTx(RelevantTx),
}

/// The chain-server operations the wallet consumes
pub trait ChainClient: Send + Sync + 'static {
    /// Hash and height of the best block the server knows
    fn block_stamp(&self) -> Result<BlockStamp, Error>;

    /// Relay a transaction to the network, returning its hash
    fn send_raw_transaction(
        &self,
        tx: &Transaction,
        allow_high_fees: bool,
    ) -> Result<Txid, Error>;

    /// Ask the server to report transactions paying any of `addresses`
    fn notify_received(&self, addresses: &[Address]) -> Result<(), Error>;

    /// Ask the server to report attached and detached blocks
    fn notify_blocks(&self) -> Result<(), Error>;

    /// Fetch a block by hash. Fails if the block is not on the server's
    /// main chain.
    fn get_block(&self, hash: &BlockHash) -> Result<Block, Error>;

    /// Take the server's event stream. Returns `None` when the stream was
    /// already taken or the server cannot push events.
    fn notifications(&self) -> Option<Receiver<ChainNotification>>;
}
