// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Custody worker
//!
//! A single thread owns the address manager and with it every piece of
//! private key material in the process. All lock, unlock, passphrase and key
//! lookup traffic arrives as messages on one channel, so state transitions
//! are trivially serialized.
//!
//! An unlock may carry a timeout after which the worker locks the manager on
//! its own. A [`HeldUnlock`] token suspends locking while an operation (such
//! as signing a transaction) is in flight: the timer keeps running and
//! explicit lock requests are accepted, but the transition itself is
//! deferred until the token is dropped. While a token is out the manager is
//! therefore always unlocked.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::Address;

use crate::error::Error;
use crate::manager::{KeyManager, KeySource, ManagedAddress};
use crate::types::BlockStamp;
use crate::wallet::Notifications;

pub(crate) enum LockerRequest {
    Unlock {
        passphrase: Vec<u8>,
        timeout: Duration,
        resp: Sender<Result<(), Error>>,
    },
    Lock,
    LockState {
        resp: Sender<bool>,
    },
    Hold {
        resp: Sender<Result<HeldUnlock, Error>>,
    },
    Release,
    ChangePassphrase {
        old: Vec<u8>,
        new: Vec<u8>,
        resp: Sender<Result<(), Error>>,
    },

    ManagedAddress {
        address: Address,
        resp: Sender<Result<ManagedAddress, Error>>,
    },
    AddrAccount {
        address: Address,
        resp: Sender<Result<u32, Error>>,
    },
    NextExternal {
        account: u32,
        resp: Sender<Result<Address, Error>>,
    },
    NextInternal {
        account: u32,
        resp: Sender<Result<Address, Error>>,
    },
    ActiveAddresses {
        resp: Sender<Vec<Address>>,
    },
    SyncedTo {
        resp: Sender<BlockStamp>,
    },
    SetSyncedTo {
        stamp: BlockStamp,
        resp: Sender<Result<(), Error>>,
    },

    Quit,
}

/// Keeps the wallet from locking while an operation that needs the unlocked
/// address manager is running. Both the unlock timeout and explicit lock
/// requests are deferred until the token is released.
///
/// Dropping the token releases the hold; [`release`](HeldUnlock::release)
/// only makes the scope exit explicit. An unreleased token leaves the wallet
/// unlocked forever, which is why release is tied to drop in the first
/// place.
#[derive(Debug)]
pub struct HeldUnlock {
    locker: Sender<LockerRequest>,
}

impl HeldUnlock {
    /// Release the hold, allowing the wallet to lock again. If the unlock
    /// timeout has already expired, the wallet locks immediately.
    pub fn release(self) {
        // Dropping self sends the release.
    }
}

impl Drop for HeldUnlock {
    fn drop(&mut self) {
        let _ = self.locker.send(LockerRequest::Release);
    }
}

/// Cloneable requester for the custody worker
#[derive(Clone)]
pub(crate) struct LockerHandle {
    tx: Sender<LockerRequest>,
}

impl LockerHandle {
    pub(crate) fn new() -> (LockerHandle, Receiver<LockerRequest>) {
        let (tx, rx) = channel();
        (LockerHandle { tx }, rx)
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Sender<T>) -> LockerRequest,
    ) -> Result<T, Error> {
        let (resp, rx) = channel();
        self.tx.send(build(resp)).map_err(|_| Error::Shutdown)?;
        rx.recv().map_err(|_| Error::Shutdown)
    }

    pub(crate) fn unlock(&self, passphrase: &[u8], timeout: Duration) -> Result<(), Error> {
        self.request(|resp| LockerRequest::Unlock {
            passphrase: passphrase.to_vec(),
            timeout,
            resp,
        })?
    }

    pub(crate) fn lock(&self) {
        let _ = self.tx.send(LockerRequest::Lock);
    }

    pub(crate) fn lock_state(&self) -> Result<bool, Error> {
        self.request(|resp| LockerRequest::LockState { resp })
    }

    pub(crate) fn hold_unlock(&self) -> Result<HeldUnlock, Error> {
        self.request(|resp| LockerRequest::Hold { resp })?
    }

    pub(crate) fn change_passphrase(&self, old: &[u8], new: &[u8]) -> Result<(), Error> {
        self.request(|resp| LockerRequest::ChangePassphrase {
            old: old.to_vec(),
            new: new.to_vec(),
            resp,
        })?
    }

    pub(crate) fn next_external(&self, account: u32) -> Result<Address, Error> {
        self.request(|resp| LockerRequest::NextExternal { account, resp })?
    }

    pub(crate) fn next_internal(&self, account: u32) -> Result<Address, Error> {
        self.request(|resp| LockerRequest::NextInternal { account, resp })?
    }

    pub(crate) fn active_addresses(&self) -> Result<Vec<Address>, Error> {
        self.request(|resp| LockerRequest::ActiveAddresses { resp })
    }

    pub(crate) fn synced_to(&self) -> Result<BlockStamp, Error> {
        self.request(|resp| LockerRequest::SyncedTo { resp })
    }

    pub(crate) fn set_synced_to(&self, stamp: BlockStamp) -> Result<(), Error> {
        self.request(|resp| LockerRequest::SetSyncedTo { stamp, resp })?
    }

    pub(crate) fn quit(&self) {
        let _ = self.tx.send(LockerRequest::Quit);
    }

    fn sender(&self) -> Sender<LockerRequest> {
        self.tx.clone()
    }
}

impl KeySource for LockerHandle {
    fn managed_address(&self, address: &Address) -> Result<ManagedAddress, Error> {
        self.request(|resp| LockerRequest::ManagedAddress {
            address: address.clone(),
            resp,
        })?
    }

    fn addr_account(&self, address: &Address) -> Result<u32, Error> {
        self.request(|resp| LockerRequest::AddrAccount {
            address: address.clone(),
            resp,
        })?
    }
}

/// Manages the locked/unlocked state of a wallet. Designed to run as its
/// own thread; the thread owns `manager` until shutdown.
pub(crate) fn wallet_locker<M: KeyManager>(
    mut manager: M,
    rx: Receiver<LockerRequest>,
    handle: LockerHandle,
    notifications: Arc<Notifications>,
) {
    let mut expiry: Option<Instant> = None;
    // While a hold is out, lock transitions are deferred, never skipped:
    // Release re-checks both the expiry and any explicit lock request.
    let mut held = false;
    let mut pending_lock = false;
    let mut pending_holds: VecDeque<Sender<Result<HeldUnlock, Error>>> = VecDeque::new();

    loop {
        let request = match expiry {
            Some(deadline) if !held => {
                let now = Instant::now();
                if now >= deadline {
                    lock_manager(&mut manager, &notifications);
                    expiry = None;
                    continue;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        lock_manager(&mut manager, &notifications);
                        expiry = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            _ => match rx.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        match request {
            LockerRequest::Unlock {
                passphrase,
                timeout,
                resp,
            } => match manager.unlock(&passphrase) {
                Ok(()) => {
                    notifications.notify_lock_state(false);
                    // An unlock supersedes a lock still waiting on a hold.
                    pending_lock = false;
                    expiry = if timeout == Duration::from_secs(0) {
                        None
                    } else {
                        Some(Instant::now() + timeout)
                    };
                    let _ = resp.send(Ok(()));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },

            LockerRequest::Lock => {
                // A lock arriving while a token is out must not interrupt
                // the key-bearing work the token protects; it applies at
                // release.
                if held {
                    pending_lock = true;
                } else {
                    lock_manager(&mut manager, &notifications);
                    expiry = None;
                }
            }

            LockerRequest::LockState { resp } => {
                let _ = resp.send(manager.is_locked());
            }

            LockerRequest::Hold { resp } => {
                if manager.is_locked() {
                    let _ = resp.send(Err(Error::Locked));
                } else if held {
                    // One token at a time; the next requester waits its
                    // turn.
                    pending_holds.push_back(resp);
                } else {
                    held = true;
                    let _ = resp.send(Ok(HeldUnlock {
                        locker: handle.sender(),
                    }));
                }
            }

            LockerRequest::Release => {
                let expired = expiry.map_or(false, |deadline| Instant::now() >= deadline);
                held = false;
                if expired || pending_lock {
                    pending_lock = false;
                    lock_manager(&mut manager, &notifications);
                    expiry = None;
                }
                while let Some(resp) = pending_holds.pop_front() {
                    // A queued hold is only granted against an unlocked
                    // manager; a lock that fired in the meantime turns it
                    // away like a fresh request.
                    if manager.is_locked() {
                        let _ = resp.send(Err(Error::Locked));
                        continue;
                    }
                    // Granting always marks the hold as taken. If the
                    // requester is gone the undelivered token drops right
                    // here, and the release its drop just queued hands the
                    // hold to the next waiter.
                    held = true;
                    let _ = resp.send(Ok(HeldUnlock {
                        locker: handle.sender(),
                    }));
                    break;
                }
            }

            LockerRequest::ChangePassphrase { old, new, resp } => {
                let _ = resp.send(manager.change_passphrase(&old, &new));
            }

            LockerRequest::ManagedAddress { address, resp } => {
                let _ = resp.send(manager.managed_address(&address));
            }

            LockerRequest::AddrAccount { address, resp } => {
                let _ = resp.send(manager.addr_account(&address));
            }

            LockerRequest::NextExternal { account, resp } => {
                let _ = resp.send(manager.next_external(account));
            }

            LockerRequest::NextInternal { account, resp } => {
                let _ = resp.send(manager.next_internal(account));
            }

            LockerRequest::ActiveAddresses { resp } => {
                let mut addrs = Vec::new();
                manager.for_each_active_address(&mut |addr| addrs.push(addr.clone()));
                let _ = resp.send(addrs);
            }

            LockerRequest::SyncedTo { resp } => {
                let _ = resp.send(manager.synced_to());
            }

            LockerRequest::SetSyncedTo { stamp, resp } => {
                let _ = resp.send(manager.set_synced_to(&stamp));
            }

            LockerRequest::Quit => break,
        }
    }

    log::debug!("custody worker exiting");
}

fn lock_manager<M: KeyManager>(manager: &mut M, notifications: &Notifications) {
    if manager.is_locked() {
        return;
    }
    match manager.lock() {
        Ok(()) => notifications.notify_lock_state(true),
        Err(e) => log::error!("could not lock wallet: {}", e),
    }
}
