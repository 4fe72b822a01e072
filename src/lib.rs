// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Hot wallet core for Bitcoin-family networks
//!
//! This library is the transaction-construction and key-custody core of a
//! hot wallet: it keeps private keys behind a passphrase-guarded address
//! manager, tracks the unspent outputs received at wallet-owned addresses
//! and builds, signs and validates new spending transactions under a
//! per-kilobyte fee policy.
//!
//! Persistence, chain synchronization and the RPC surface are external
//! collaborators, consumed through the [`KeyManager`], [`TxStore`] and
//! [`ChainClient`] traits. The [`Wallet`] handle wires them together and
//! serializes all sensitive work through dedicated worker threads.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bitcoin::Network;
//! use hotwallet::{Amount, MemoryManager, MemoryStore, Wallet, WalletConfig};
//!
//! # fn chain_client() -> Arc<dyn hotwallet::ChainClient> { unimplemented!() }
//! # fn main() -> Result<(), hotwallet::Error> {
//! let manager = MemoryManager::new(Network::Testnet, b"passphrase");
//! let wallet = Wallet::open(
//!     manager,
//!     MemoryStore::new(),
//!     Network::Testnet,
//!     WalletConfig::default(),
//! );
//! wallet.start(chain_client())?;
//!
//! wallet.unlock(b"passphrase", Duration::from_secs(60))?;
//! let mut pairs = HashMap::new();
//! pairs.insert(
//!     "mu7q5vxiGCXYKXEtvspP77bYxjnsEobJGv".to_string(),
//!     Amount::from_sat(1_000_000),
//! );
//! let txid = wallet.send_pairs(pairs, 0, 1)?;
//! println!("sent {}", txid);
//! # Ok(())
//! # }
//! ```

pub extern crate bitcoin;
extern crate bitcoinconsensus;
extern crate log;
extern crate rand;
extern crate serde;

#[macro_use]
pub(crate) mod error;
pub mod chain;
pub mod manager;
pub mod script;
pub mod store;
pub(crate) mod types;
pub mod wallet;

pub use chain::{ChainClient, ChainNotification, RelevantTx};
pub use error::Error;
pub use manager::{KeyManager, ManagedAddress, MemoryManager};
pub use script::ScriptClass;
pub use store::{CreditEntry, MemoryStore, TxDetails, TxStore};
pub use types::*;
pub use wallet::{HeldUnlock, Wallet, WalletConfig, DEFAULT_FEE_INCREMENT};
