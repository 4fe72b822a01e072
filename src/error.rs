// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fmt;

use crate::types::Amount;

/// Errors that can be thrown by the wallet
#[derive(Debug)]
pub enum Error {
    /// Not enough eligible unspent outputs to pay for the requested outputs
    /// plus the required fee
    InsufficientFunds {
        /// Total value of the inputs gathered so far
        available: Amount,
        /// Total value of the requested outputs
        needed_out: Amount,
        /// Fee estimate at the point the eligible set was drained
        needed_fee: Amount,
    },
    /// A pay-list entry carries a zero or negative amount
    NonPositiveAmount,
    /// A selected output is not P2PKH, or its managed address cannot produce
    /// a private key
    UnsupportedTransactionType,
    /// The address manager was locked when a key-bearing operation was
    /// attempted
    Locked,
    /// The supplied passphrase does not unlock the address manager
    InvalidPassphrase,
    /// The wallet has not finished synchronizing with the chain server
    NotSynced,
    /// A second subscription was attempted on a notification topic
    DuplicateListen,
    /// The address is not known to the address manager
    UnknownAddress,
    /// A wallet worker has shut down and can no longer serve requests
    Shutdown,
    /// Generic error
    Generic(String),

    Address(bitcoin::util::address::Error),
    Secp256k1(bitcoin::secp256k1::Error),
    Verify(bitcoinconsensus::Error),
}

macro_rules! impl_error {
    ( $from:ty, $to:ident ) => {
        impl_error!($from, $to, crate::error::Error);
    };
    ( $from:ty, $to:ident, $impl_for:ty ) => {
        impl std::convert::From<$from> for $impl_for {
            fn from(err: $from) -> Self {
                <$impl_for>::$to(err)
            }
        }
    };
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InsufficientFunds {
                available,
                needed_out,
                needed_fee,
            } => write!(
                f,
                "insufficient funds: transaction requires {} input ({} output + {} fee) but only {} spendable",
                *needed_out + *needed_fee,
                needed_out,
                needed_fee,
                available
            ),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for Error {}

impl_error!(bitcoin::util::address::Error, Address);
impl_error!(bitcoin::secp256k1::Error, Secp256k1);
impl_error!(bitcoinconsensus::Error, Verify);
