// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wallet
//!
//! A [`Wallet`] glues the address manager, the transaction store and a chain
//! server connection together behind a thread-safe handle. Two dedicated
//! worker threads do the sensitive work:
//!
//! - the custody worker owns the address manager and serializes every lock,
//!   unlock and key lookup (see [`locker`](self::locker));
//! - the build worker consumes transaction-creation requests one at a time,
//!   so two concurrent sends can never select the same unspent outputs.
//!
//! A third worker drains the chain server's event stream and fans the events
//! out to at-most-one subscriber per topic.

pub(crate) mod builder;
pub(crate) mod fees;
pub(crate) mod locker;
pub(crate) mod time;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitcoin::{Address, Network, OutPoint, Txid};

use crate::chain::{ChainClient, ChainNotification, RelevantTx};
use crate::error::Error;
use crate::manager::{KeyManager, KeySource};
use crate::script::{classify_script, ScriptClass};
use crate::store::TxStore;
use crate::types::{confirms, Amount, BlockMeta, CreatedTx, TxRecord};

pub use self::fees::DEFAULT_FEE_INCREMENT;
pub use self::locker::HeldUnlock;

use self::locker::LockerHandle;

/// Tunables recognized on the wallet handle
#[derive(Debug, Clone, Copy)]
pub struct WalletConfig {
    /// Fee floor added per started kilobyte when a fee is required
    pub fee_increment: Amount,
    /// Never build a zero-fee transaction, regardless of priority
    pub disallow_free: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            fee_increment: DEFAULT_FEE_INCREMENT,
            disallow_free: false,
        }
    }
}

enum CreateTxMsg {
    Request {
        account: u32,
        pairs: HashMap<String, Amount>,
        minconf: i32,
        resp: Sender<Result<CreatedTx, Error>>,
    },
    Quit,
}

/// Per-topic single-consumer subscription table.
///
/// Every topic accepts exactly one subscriber and delivery is a rendezvous:
/// producers block until the subscriber takes the value, so a subscriber
/// observes events in the order the owning worker produced them. Topics are
/// independent of each other. When a subscriber goes away its slot is
/// cleared and deliveries are skipped again.
#[derive(Default)]
pub(crate) struct Notifications {
    connected_blocks: Mutex<Option<SyncSender<BlockMeta>>>,
    disconnected_blocks: Mutex<Option<SyncSender<BlockMeta>>>,
    lock_state: Mutex<Option<SyncSender<bool>>>,
    confirmed_balance: Mutex<Option<SyncSender<Amount>>>,
    unconfirmed_balance: Mutex<Option<SyncSender<Amount>>>,
    relevant_txs: Mutex<Option<SyncSender<RelevantTx>>>,
}

impl Notifications {
    fn listen<T>(slot: &Mutex<Option<SyncSender<T>>>) -> Result<Receiver<T>, Error> {
        let mut guard = slot.lock().unwrap();
        if guard.is_some() {
            return Err(Error::DuplicateListen);
        }
        let (tx, rx) = mpsc::sync_channel(0);
        *guard = Some(tx);
        Ok(rx)
    }

    fn notify<T>(slot: &Mutex<Option<SyncSender<T>>>, value: T) {
        let mut guard = slot.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(value).is_err() {
                // Subscriber hung up; free the topic.
                *guard = None;
            }
        }
    }

    pub(crate) fn listen_connected_blocks(&self) -> Result<Receiver<BlockMeta>, Error> {
        Self::listen(&self.connected_blocks)
    }

    pub(crate) fn listen_disconnected_blocks(&self) -> Result<Receiver<BlockMeta>, Error> {
        Self::listen(&self.disconnected_blocks)
    }

    pub(crate) fn listen_lock_state(&self) -> Result<Receiver<bool>, Error> {
        Self::listen(&self.lock_state)
    }

    pub(crate) fn listen_confirmed_balance(&self) -> Result<Receiver<Amount>, Error> {
        Self::listen(&self.confirmed_balance)
    }

    pub(crate) fn listen_unconfirmed_balance(&self) -> Result<Receiver<Amount>, Error> {
        Self::listen(&self.unconfirmed_balance)
    }

    pub(crate) fn listen_relevant_txs(&self) -> Result<Receiver<RelevantTx>, Error> {
        Self::listen(&self.relevant_txs)
    }

    pub(crate) fn notify_connected_block(&self, block: BlockMeta) {
        Self::notify(&self.connected_blocks, block)
    }

    pub(crate) fn notify_disconnected_block(&self, block: BlockMeta) {
        Self::notify(&self.disconnected_blocks, block)
    }

    pub(crate) fn notify_lock_state(&self, locked: bool) {
        Self::notify(&self.lock_state, locked)
    }

    pub(crate) fn notify_confirmed_balance(&self, balance: Amount) {
        Self::notify(&self.confirmed_balance, balance)
    }

    pub(crate) fn notify_unconfirmed_balance(&self, balance: Amount) {
        Self::notify(&self.unconfirmed_balance, balance)
    }

    pub(crate) fn notify_relevant_tx(&self, relevant: RelevantTx) {
        Self::notify(&self.relevant_txs, relevant)
    }
}

/// A hot wallet for a single network.
///
/// Constructed over an address manager and a transaction store with
/// [`open`](Wallet::open), then attached to a chain server with
/// [`start`](Wallet::start).
pub struct Wallet<S: TxStore> {
    store: Arc<S>,
    chain: Mutex<Option<Arc<dyn ChainClient>>>,
    chain_synced: Arc<AtomicBool>,

    locker: LockerHandle,
    create_tx: Sender<CreateTxMsg>,
    create_tx_rx: Mutex<Option<Receiver<CreateTxMsg>>>,

    locked_outpoints: Arc<Mutex<HashSet<OutPoint>>>,
    notifications: Arc<Notifications>,

    network: Network,
    fee_increment: Amount,
    disallow_free: bool,

    started: Mutex<bool>,
    quit: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: TxStore> Wallet<S> {
    /// Open a wallet over an address manager and a transaction store.
    ///
    /// The manager moves into the custody worker, which starts immediately;
    /// locking, unlocking and passphrase changes work before
    /// [`start`](Wallet::start) is called.
    pub fn open<M: KeyManager>(
        manager: M,
        store: S,
        network: Network,
        config: WalletConfig,
    ) -> Wallet<S> {
        let notifications = Arc::new(Notifications::default());
        let (locker, locker_rx) = LockerHandle::new();
        let locker_worker = {
            let handle = locker.clone();
            let notifications = Arc::clone(&notifications);
            thread::spawn(move || locker::wallet_locker(manager, locker_rx, handle, notifications))
        };

        let (create_tx, create_tx_rx) = channel();

        Wallet {
            store: Arc::new(store),
            chain: Mutex::new(None),
            chain_synced: Arc::new(AtomicBool::new(false)),
            locker,
            create_tx,
            create_tx_rx: Mutex::new(Some(create_tx_rx)),
            locked_outpoints: Arc::new(Mutex::new(HashSet::new())),
            notifications,
            network,
            fee_increment: config.fee_increment,
            disallow_free: config.disallow_free,
            started: Mutex::new(false),
            quit: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(vec![locker_worker]),
        }
    }

    /// Attach a chain server and start the remaining workers. Calling
    /// `start` on a running wallet is a no-op.
    pub fn start(&self, chain: Arc<dyn ChainClient>) -> Result<(), Error> {
        let mut started = self.started.lock().unwrap();
        if *started {
            return Ok(());
        }

        chain.notify_blocks()?;
        *self.chain.lock().unwrap() = Some(Arc::clone(&chain));

        let mut handles = self.handles.lock().unwrap();

        let create_tx_rx = self
            .create_tx_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Shutdown)?;
        {
            let store = Arc::clone(&self.store);
            let chain = Arc::clone(&chain);
            let locker = self.locker.clone();
            let locked_outpoints = Arc::clone(&self.locked_outpoints);
            let chain_synced = Arc::clone(&self.chain_synced);
            let (network, fee_increment, disallow_free) =
                (self.network, self.fee_increment, self.disallow_free);
            handles.push(thread::spawn(move || {
                tx_creator(
                    create_tx_rx,
                    store,
                    chain,
                    locker,
                    locked_outpoints,
                    chain_synced,
                    network,
                    fee_increment,
                    disallow_free,
                )
            }));
        }

        match chain.notifications() {
            Some(rx) => {
                let store = Arc::clone(&self.store);
                let locker = self.locker.clone();
                let notifications = Arc::clone(&self.notifications);
                let quit = Arc::clone(&self.quit);
                let network = self.network;
                handles.push(thread::spawn(move || {
                    chain_handler(rx, store, locker, notifications, quit, network)
                }));
            }
            None => log::debug!("chain server pushes no notifications"),
        }

        // If the block the manager was last synced to is still on the
        // server's main chain, no catch-up is needed.
        let stamp = self.locker.synced_to()?;
        match chain.get_block(&stamp.hash) {
            Ok(_) => self.set_chain_synced(true),
            Err(e) => log::debug!(
                "synced block {} at height {} not found on chain server: {}",
                stamp.hash,
                stamp.height,
                e
            ),
        }

        *started = true;
        Ok(())
    }

    /// Signal every worker to shut down. In-flight builds run to
    /// completion; a partially signed transaction must never escape.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        let _ = self.create_tx.send(CreateTxMsg::Quit);
        self.locker.quit();
    }

    /// Whether [`stop`](Wallet::stop) has been called
    pub fn shutting_down(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Block until every worker thread has finished
    pub fn wait_for_shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Whether the wallet considers itself caught up with the chain server
    pub fn chain_synced(&self) -> bool {
        self.chain_synced.load(Ordering::SeqCst)
    }

    /// Mark the wallet in (or out of) sync with the chain server
    pub fn set_chain_synced(&self, synced: bool) {
        self.chain_synced.store(synced, Ordering::SeqCst);
    }

    fn chain(&self) -> Result<Arc<dyn ChainClient>, Error> {
        self.chain
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Generic("wallet is not attached to a chain server".to_string()))
    }

    fn ensure_started(&self) -> Result<(), Error> {
        if *self.started.lock().unwrap() {
            Ok(())
        } else {
            Err(Error::Generic("wallet is not started".to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Custody

    /// Unlock the address manager, locking it again after `timeout` (zero
    /// means no automatic lock). Unlocking an already unlocked wallet
    /// replaces the running timeout.
    pub fn unlock(&self, passphrase: &[u8], timeout: Duration) -> Result<(), Error> {
        self.locker.unlock(passphrase, timeout)
    }

    /// Lock the address manager. If a hold is outstanding the lock applies
    /// as soon as the hold is released.
    pub fn lock(&self) {
        self.locker.lock();
    }

    /// Whether the address manager is locked
    pub fn locked(&self) -> Result<bool, Error> {
        self.locker.lock_state()
    }

    /// Keep the wallet from locking until the returned token is dropped.
    /// Fails with [`Error::Locked`] when the wallet is locked.
    pub fn hold_unlock(&self) -> Result<HeldUnlock, Error> {
        self.locker.hold_unlock()
    }

    /// Change the passphrase of the address manager. The locked/unlocked
    /// state observed before the call is preserved.
    pub fn change_passphrase(&self, old: &[u8], new: &[u8]) -> Result<(), Error> {
        self.locker.change_passphrase(old, new)
    }

    // ------------------------------------------------------------------
    // Transaction creation

    /// Build a signed transaction spending eligible unspent P2PKH outputs
    /// of `account` to any number of address/amount pairs. Change and a
    /// fee are added as necessary. All creation requests run through a
    /// single worker, so concurrent calls cannot double-spend.
    pub fn create_simple_tx(
        &self,
        account: u32,
        pairs: HashMap<String, Amount>,
        minconf: i32,
    ) -> Result<CreatedTx, Error> {
        self.ensure_started()?;
        let (resp, rx) = channel();
        self.create_tx
            .send(CreateTxMsg::Request {
                account,
                pairs,
                minconf,
                resp,
            })
            .map_err(|_| Error::Shutdown)?;
        rx.recv().map_err(|_| Error::Shutdown)?
    }

    /// Build a transaction for the pay-list, record it locally and then
    /// broadcast it, returning its hash.
    ///
    /// The record always lands in the store before the broadcast: if the
    /// broadcast fails the transaction survives as an unmined record and is
    /// re-sent by [`resend_unmined_txs`](Wallet::resend_unmined_txs).
    pub fn send_pairs(
        &self,
        pairs: HashMap<String, Amount>,
        account: u32,
        minconf: i32,
    ) -> Result<Txid, Error> {
        let created = self.create_simple_tx(account, pairs, minconf)?;

        let record = TxRecord::from_transaction(created.tx, time::get_timestamp());
        if let Err(e) = self.store.insert_tx(&record, None) {
            log::error!("error adding sent tx history: {}", e);
            return Err(e);
        }
        if created.change_index >= 0 {
            if let Err(e) = self
                .store
                .add_credit(&record, None, created.change_index as u32, true)
            {
                log::error!("error adding change address for sent tx: {}", e);
                return Err(e);
            }
        }

        self.chain()?.send_raw_transaction(&record.transaction, false)
    }

    /// Try to relay every recorded transaction not known to be mined
    pub fn resend_unmined_txs(&self) {
        let chain = match self.chain() {
            Ok(chain) => chain,
            Err(_) => return,
        };
        let txs = match self.store.unmined_txs() {
            Ok(txs) => txs,
            Err(e) => {
                log::error!("cannot load unmined transactions for resending: {}", e);
                return;
            }
        };
        for tx in txs {
            match chain.send_raw_transaction(&tx, false) {
                Ok(txid) => log::debug!("resent unmined transaction {}", txid),
                Err(e) => log::debug!("could not resend transaction {}: {}", tx.txid(), e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Output locking

    /// Whether an outpoint is marked as unusable for new transactions
    pub fn locked_outpoint(&self, outpoint: OutPoint) -> bool {
        self.locked_outpoints.lock().unwrap().contains(&outpoint)
    }

    /// Mark an outpoint as unusable for new transactions
    pub fn lock_outpoint(&self, outpoint: OutPoint) {
        self.locked_outpoints.lock().unwrap().insert(outpoint);
    }

    /// Make an outpoint usable for new transactions again
    pub fn unlock_outpoint(&self, outpoint: OutPoint) {
        self.locked_outpoints.lock().unwrap().remove(&outpoint);
    }

    /// Clear the set of locked outpoints
    pub fn reset_locked_outpoints(&self) {
        self.locked_outpoints.lock().unwrap().clear();
    }

    /// The currently locked outpoints
    pub fn locked_outpoints(&self) -> Vec<OutPoint> {
        self.locked_outpoints
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    // ------------------------------------------------------------------
    // Addresses and balances

    /// The next external (receiving) address for an account, registered
    /// with the chain server for incoming-transaction notifications
    pub fn new_address(&self, account: u32) -> Result<Address, Error> {
        let address = self.locker.next_external(account)?;
        self.chain()?.notify_received(&[address.clone()])?;
        Ok(address)
    }

    /// The next internal (change) address for an account, registered with
    /// the chain server for incoming-transaction notifications
    pub fn new_change_address(&self, account: u32) -> Result<Address, Error> {
        let address = self.locker.next_internal(account)?;
        self.chain()?.notify_received(&[address.clone()])?;
        Ok(address)
    }

    /// Every active payment address, encoded and sorted
    pub fn sorted_active_payment_addresses(&self) -> Result<Vec<String>, Error> {
        let mut encoded: Vec<String> = self
            .locker
            .active_addresses()?
            .iter()
            .map(|addr| addr.to_string())
            .collect();
        encoded.sort_unstable();
        Ok(encoded)
    }

    /// Total value of spendable outputs with at least `minconf`
    /// confirmations
    pub fn calculate_balance(&self, minconf: i32) -> Result<Amount, Error> {
        let sync_height = self.locker.synced_to()?.height;
        self.store.balance(minconf, sync_height)
    }

    /// Total amount ever received by addresses of `account`, along with the
    /// confirmation count of the most recent matching transaction
    pub fn total_received_for_account(
        &self,
        account: u32,
        minconf: i32,
    ) -> Result<(Amount, i32), Error> {
        let sync_height = self.locker.synced_to()?.height;
        let stop_height = if minconf > 0 {
            sync_height - minconf + 1
        } else {
            -1
        };

        let mut amount = Amount::ZERO;
        let mut last_conf = 0;
        self.store.range_transactions(0, stop_height, &mut |details| {
            for credit in &details.credits {
                let txout = &details.record.transaction.output[credit.index as usize];
                let (_, addrs, _) = classify_script(&txout.script_pubkey, self.network);
                if addrs.len() != 1 {
                    continue;
                }
                if let Ok(addr_account) = self.locker.addr_account(&addrs[0]) {
                    if addr_account == account {
                        amount += credit.amount;
                        let height = details.block.map(|b| b.stamp.height).unwrap_or(-1);
                        last_conf = confirms(height, sync_height);
                    }
                }
            }
            Ok(false)
        })?;
        Ok((amount, last_conf))
    }

    // ------------------------------------------------------------------
    // Notifications

    /// Subscribe to blocks the wallet has been marked in sync with.
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_connected_blocks(&self) -> Result<Receiver<BlockMeta>, Error> {
        self.notifications.listen_connected_blocks()
    }

    /// Subscribe to blocks detached from the chain.
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_disconnected_blocks(&self) -> Result<Receiver<BlockMeta>, Error> {
        self.notifications.listen_disconnected_blocks()
    }

    /// Subscribe to lock-state changes (`true` when locked).
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_lock_status(&self) -> Result<Receiver<bool>, Error> {
        self.notifications.listen_lock_state()
    }

    /// Subscribe to confirmed-balance changes.
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_confirmed_balance(&self) -> Result<Receiver<Amount>, Error> {
        self.notifications.listen_confirmed_balance()
    }

    /// Subscribe to unconfirmed-balance changes.
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_unconfirmed_balance(&self) -> Result<Receiver<Amount>, Error> {
        self.notifications.listen_unconfirmed_balance()
    }

    /// Subscribe to transactions relevant to the wallet.
    /// The channel must be read, or other wallet operations will block.
    pub fn listen_relevant_txs(&self) -> Result<Receiver<RelevantTx>, Error> {
        self.notifications.listen_relevant_txs()
    }
}

/// The transaction build worker. Input selection must be serialized, or two
/// in-flight requests could pick the same outputs and the wallet would sign
/// conflicting spends of them. Signing also happens here, for the same
/// reason: a request that selected its inputs but lost them to a concurrent
/// signer would fail late instead of never starting.
#[allow(clippy::too_many_arguments)]
fn tx_creator<S: TxStore>(
    rx: Receiver<CreateTxMsg>,
    store: Arc<S>,
    chain: Arc<dyn ChainClient>,
    locker: LockerHandle,
    locked_outpoints: Arc<Mutex<HashSet<OutPoint>>>,
    chain_synced: Arc<AtomicBool>,
    network: Network,
    fee_increment: Amount,
    disallow_free: bool,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            CreateTxMsg::Request {
                account,
                pairs,
                minconf,
                resp,
            } => {
                let result = build_one(
                    &store,
                    &chain,
                    &locker,
                    &locked_outpoints,
                    &chain_synced,
                    account,
                    &pairs,
                    minconf,
                    network,
                    fee_increment,
                    disallow_free,
                );
                let _ = resp.send(result);
            }
            CreateTxMsg::Quit => break,
        }
    }
    log::debug!("transaction build worker exiting");
}

#[allow(clippy::too_many_arguments)]
fn build_one<S: TxStore>(
    store: &Arc<S>,
    chain: &Arc<dyn ChainClient>,
    locker: &LockerHandle,
    locked_outpoints: &Arc<Mutex<HashSet<OutPoint>>>,
    chain_synced: &Arc<AtomicBool>,
    account: u32,
    pairs: &HashMap<String, Amount>,
    minconf: i32,
    network: Network,
    fee_increment: Amount,
    disallow_free: bool,
) -> Result<CreatedTx, Error> {
    if !chain_synced.load(Ordering::SeqCst) {
        return Err(Error::NotSynced);
    }

    // Grab the unlock for the whole build, so the wallet cannot auto-lock
    // between selecting inputs and signing them. Dropping the token at the
    // end of this function releases it.
    let _held = locker.hold_unlock()?;

    let bs = chain.block_stamp()?;
    let locked = locked_outpoints.lock().unwrap().clone();
    let eligible = builder::find_eligible_outputs(
        store.as_ref(),
        locker,
        account,
        minconf,
        &bs,
        &locked,
        network,
    )?;

    let change_locker = locker.clone();
    let change_chain = Arc::clone(chain);
    builder::create_tx(
        eligible,
        pairs,
        &bs,
        fee_increment,
        locker,
        account,
        move |account| {
            let address = change_locker.next_internal(account)?;
            change_chain.notify_received(&[address.clone()])?;
            Ok(address)
        },
        network,
        disallow_free,
    )
}

/// Drains the chain server's event stream: records relevant transactions,
/// keeps the synced-to stamp current and fans the events out to the
/// per-topic subscribers.
fn chain_handler<S: TxStore>(
    rx: Receiver<ChainNotification>,
    store: Arc<S>,
    locker: LockerHandle,
    notifications: Arc<Notifications>,
    quit: Arc<AtomicBool>,
    network: Network,
) {
    loop {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let notification = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(notification) => notification,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match notification {
            ChainNotification::BlockConnected(meta) => {
                if let Err(e) = locker.set_synced_to(meta.stamp) {
                    log::error!("could not record synced block: {}", e);
                }
                notifications.notify_connected_block(meta);
                notify_balances(store.as_ref(), &notifications, meta.stamp.height);
            }
            ChainNotification::BlockDisconnected(meta) => {
                notifications.notify_disconnected_block(meta);
                notify_balances(store.as_ref(), &notifications, meta.stamp.height - 1);
            }
            ChainNotification::RelevantTx(relevant) => {
                if let Err(e) = record_relevant_tx(store.as_ref(), &locker, &relevant, network) {
                    log::error!(
                        "could not record relevant transaction {}: {}",
                        relevant.record.txid,
                        e
                    );
                }
                notifications.notify_relevant_tx(relevant);
                if let Ok(stamp) = locker.synced_to() {
                    notify_balances(store.as_ref(), &notifications, stamp.height);
                }
            }
        }
    }
    log::debug!("chain notification handler exiting");
}

fn record_relevant_tx<S: TxStore>(
    store: &S,
    locker: &LockerHandle,
    relevant: &RelevantTx,
    network: Network,
) -> Result<(), Error> {
    store.insert_tx(&relevant.record, relevant.block.as_ref())?;
    for (index, txout) in relevant.record.transaction.output.iter().enumerate() {
        let (class, addrs, _) = classify_script(&txout.script_pubkey, network);
        if class != ScriptClass::PubKeyHash || addrs.len() != 1 {
            continue;
        }
        if locker.addr_account(&addrs[0]).is_ok() {
            store.add_credit(&relevant.record, relevant.block.as_ref(), index as u32, false)?;
        }
    }
    Ok(())
}

fn notify_balances<S: TxStore>(store: &S, notifications: &Notifications, tip_height: i32) {
    let confirmed_balance = match store.balance(1, tip_height) {
        Ok(balance) => balance,
        Err(e) => {
            log::error!("could not compute confirmed balance: {}", e);
            return;
        }
    };
    notifications.notify_confirmed_balance(confirmed_balance);

    match store.balance(0, tip_height) {
        Ok(total) => notifications.notify_unconfirmed_balance(total - confirmed_balance),
        Err(e) => log::error!("could not compute unconfirmed balance: {}", e),
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::sync::mpsc;

    use bitcoin::consensus::deserialize;
    use bitcoin::hashes::hex::FromHex;
    use bitcoin::{Block, BlockHash, PrivateKey, Transaction};

    use super::*;
    use crate::manager::MemoryManager;
    use crate::store::MemoryStore;
    use crate::types::{BlockStamp, Credit};

    const FUNDING_TX_HEX: &str = "010000000113918955c6ba3c7a2e8ec02ca3e91a2571cb11ade7d5c3e9c1a73b3ac8309d74000000006b483045022100a6f33d4ad476d126ee45e19e43190971e148a1e940abe4165bc686d22ac847e502200936efa4da4225787d4b7e11e8f3389dba626817d7ece0cab38b4f456b0880d6012103ccb8b1038ad6af10a15f68e8d5e347c08befa6cc2ab1718a37e3ea0e38102b92ffffffff06b05b5c01000000001976a914c5297a660cef8088b8472755f4827df7577c612988acc0c62d00000000001976a9142f7094083d750bdfc1f2fad814779e2dde35ce2088ac40548900000000001976a9146fcb336a187619ca20b84af9eac9fbff68d1061d88ac80969800000000001976a91495322d12e18345f4855cbe863d4a8ebcc0e95e0188acc0e1e400000000001976a914aace7f06f94fa298685f6e58769543993fa5fae888aca0860100000000001976a91408eec7602655fdb2531f71070cca4c363c3a15ab88ac00000000";

    const PRIV_KEYS: [&str; 5] = [
        "cSYUVdPL6pkabu7Fxp4PaKqYjJFz2Aopw5ygunFbek9HAimLYxp4",
        "cVnNzZm3DiwkN1Ghs4W8cwcJC9f6TynCCcqzYt8n1c4hwjN2PfTw",
        "cUgo8PrKj7NzttKRMKwgF3ahXNrLA253pqjWkPGS7Z9iZcKT8EKG",
        "cSosEHx1freK7B1B6QicPcrH1h5VqReSHew6ZYhv6ntiUJRhowRc",
        "cR9ApAZ3FLtRMfqRBEr3niD9Mmmvfh3V8Uh56qfJ5b4bFH8ibDkA",
    ];

    const OUT_ADDR_1: &str = "1MirQ9bwyQcGVJPwKUgapu5ouK2E2Ey4gX";
    const OUT_ADDR_2: &str = "12MzCDwodF9G1e7jfwLXfR164RNtx4BRVG";
    const PASS: &[u8] = b"secret";

    struct MockChain {
        stamp: BlockStamp,
        sent: Mutex<Vec<Transaction>>,
        registered: Mutex<Vec<Address>>,
        fail_broadcast: AtomicBool,
        notif_rx: Mutex<Option<Receiver<ChainNotification>>>,
    }

    impl MockChain {
        fn new(height: i32) -> (Arc<MockChain>, mpsc::Sender<ChainNotification>) {
            let (tx, rx) = mpsc::channel();
            let chain = Arc::new(MockChain {
                stamp: BlockStamp {
                    hash: Default::default(),
                    height,
                },
                sent: Mutex::new(vec![]),
                registered: Mutex::new(vec![]),
                fail_broadcast: AtomicBool::new(false),
                notif_rx: Mutex::new(Some(rx)),
            });
            (chain, tx)
        }
    }

    impl ChainClient for MockChain {
        fn block_stamp(&self) -> Result<BlockStamp, Error> {
            Ok(self.stamp)
        }

        fn send_raw_transaction(
            &self,
            tx: &Transaction,
            _allow_high_fees: bool,
        ) -> Result<Txid, Error> {
            if self.fail_broadcast.load(Ordering::SeqCst) {
                return Err(Error::Generic("broadcast refused".to_string()));
            }
            self.sent.lock().unwrap().push(tx.clone());
            Ok(tx.txid())
        }

        fn notify_received(&self, addresses: &[Address]) -> Result<(), Error> {
            self.registered.lock().unwrap().extend_from_slice(addresses);
            Ok(())
        }

        fn notify_blocks(&self) -> Result<(), Error> {
            Ok(())
        }

        fn get_block(&self, hash: &BlockHash) -> Result<Block, Error> {
            Err(Error::Generic(format!("block {} not found", hash)))
        }

        fn notifications(&self) -> Option<Receiver<ChainNotification>> {
            self.notif_rx.lock().unwrap().take()
        }
    }

    fn funding_tx() -> Transaction {
        deserialize(&Vec::<u8>::from_hex(FUNDING_TX_HEX).unwrap()).unwrap()
    }

    fn test_manager() -> (MemoryManager, Vec<Address>) {
        let mut manager = MemoryManager::new(Network::Testnet, PASS);
        manager.unlock(PASS).unwrap();
        let mut addrs = Vec::new();
        for wif in PRIV_KEYS.iter() {
            let key = PrivateKey::from_wif(wif).unwrap();
            addrs.push(manager.import_private_key(key, 0).unwrap());
        }
        manager.lock().unwrap();
        (manager, addrs)
    }

    // Seed the store with the funding transaction's outputs 1..=5 as
    // unmined credits.
    fn seed_store(store: &MemoryStore) -> Vec<Credit> {
        let tx = funding_tx();
        let txid = tx.txid();
        let mut credits = Vec::new();
        for index in 1..=5u32 {
            let credit = Credit {
                outpoint: OutPoint::new(txid, index),
                amount: Amount::from_sat(tx.output[index as usize].value as i64),
                pk_script: tx.output[index as usize].script_pubkey.clone(),
                height: -1,
                received: 0,
                from_coinbase: false,
            };
            store.add_unspent(credit.clone());
            credits.push(credit);
        }
        credits
    }

    struct Fixture {
        wallet: Wallet<MemoryStore>,
        chain: Arc<MockChain>,
        notif_tx: mpsc::Sender<ChainNotification>,
        credits: Vec<Credit>,
    }

    impl Fixture {
        fn started() -> Fixture {
            let (manager, _) = test_manager();
            let store = MemoryStore::new();
            let credits = seed_store(&store);
            let wallet = Wallet::open(
                manager,
                store,
                Network::Testnet,
                WalletConfig::default(),
            );
            let (chain, notif_tx) = MockChain::new(11_111);
            wallet.start(Arc::clone(&chain) as Arc<dyn ChainClient>).unwrap();
            wallet.set_chain_synced(true);
            Fixture {
                wallet,
                chain,
                notif_tx,
                credits,
            }
        }

        fn shutdown(self) {
            self.wallet.stop();
            self.wallet.wait_for_shutdown();
        }
    }

    fn pairs(entries: &[(&str, i64)]) -> HashMap<String, Amount> {
        entries
            .iter()
            .map(|(addr, amount)| (addr.to_string(), Amount::from_sat(*amount)))
            .collect()
    }

    #[test]
    fn send_pairs_records_before_broadcasting() {
        let fixture = Fixture::started();
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        let txid = fixture
            .wallet
            .send_pairs(
                pairs(&[(OUT_ADDR_1, 15_000_000), (OUT_ADDR_2, 10_000_000)]),
                0,
                0,
            )
            .unwrap();

        let sent = fixture.chain.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].txid(), txid);
        drop(sent);

        // The record is in the store as unmined, and the change output came
        // back as a spendable credit.
        let unmined = fixture.wallet.store.unmined_txs().unwrap();
        assert_eq!(unmined.len(), 1);
        assert_eq!(unmined[0].txid(), txid);
        let change: Vec<Credit> = fixture
            .wallet
            .store
            .unspent_outputs()
            .unwrap()
            .into_iter()
            .filter(|c| c.outpoint.txid == txid)
            .collect();
        assert_eq!(change.len(), 1);
        assert_eq!(change[0].amount, Amount::from_sat(8_999_000));

        fixture.shutdown();
    }

    #[test]
    fn sequential_sends_never_share_inputs() {
        let fixture = Fixture::started();
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        let first = fixture
            .wallet
            .send_pairs(
                pairs(&[(OUT_ADDR_1, 15_000_000), (OUT_ADDR_2, 10_000_000)]),
                0,
                0,
            )
            .unwrap();
        let second = fixture
            .wallet
            .send_pairs(pairs(&[(OUT_ADDR_2, 5_000_000)]), 0, 0)
            .unwrap();

        let sent = fixture.chain.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let first_tx = sent.iter().find(|t| t.txid() == first).unwrap();
        let second_tx = sent.iter().find(|t| t.txid() == second).unwrap();
        for txin in &second_tx.input {
            assert!(
                !first_tx
                    .input
                    .iter()
                    .any(|other| other.previous_output == txin.previous_output),
                "double spend of {}",
                txin.previous_output
            );
        }
        drop(sent);

        fixture.shutdown();
    }

    #[test]
    fn locked_outpoints_are_never_selected() {
        let fixture = Fixture::started();
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        // Lock everything except the 1e7 output; largest-first would have
        // taken the 1.5e7 one.
        let biggest = fixture.credits[3].outpoint;
        assert_eq!(fixture.credits[3].amount, Amount::from_sat(15_000_000));
        fixture.wallet.lock_outpoint(biggest);
        assert!(fixture.wallet.locked_outpoint(biggest));

        let created = fixture
            .wallet
            .create_simple_tx(0, pairs(&[(OUT_ADDR_2, 5_000_000)]), 0)
            .unwrap();
        assert_eq!(created.tx.input.len(), 1);
        assert_eq!(
            created.tx.input[0].previous_output,
            fixture.credits[2].outpoint
        );

        fixture.wallet.unlock_outpoint(biggest);
        assert!(fixture.wallet.locked_outpoints().is_empty());

        fixture.shutdown();
    }

    #[test]
    fn create_tx_requires_sync() {
        let fixture = Fixture::started();
        fixture.wallet.set_chain_synced(false);
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        let err = fixture
            .wallet
            .create_simple_tx(0, pairs(&[(OUT_ADDR_1, 1_000_000)]), 0)
            .unwrap_err();
        assert!(matches!(err, Error::NotSynced));

        fixture.shutdown();
    }

    #[test]
    fn create_tx_requires_unlock() {
        let fixture = Fixture::started();

        let err = fixture
            .wallet
            .create_simple_tx(0, pairs(&[(OUT_ADDR_1, 1_000_000)]), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Locked));

        fixture.shutdown();
    }

    #[test]
    fn failed_broadcast_keeps_the_record_for_resend() {
        let fixture = Fixture::started();
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();
        fixture.chain.fail_broadcast.store(true, Ordering::SeqCst);

        let err = fixture
            .wallet
            .send_pairs(pairs(&[(OUT_ADDR_1, 1_000_000)]), 0, 0)
            .unwrap_err();
        assert!(matches!(err, Error::Generic(_)));
        assert!(fixture.chain.sent.lock().unwrap().is_empty());
        assert_eq!(fixture.wallet.store.unmined_txs().unwrap().len(), 1);

        fixture.chain.fail_broadcast.store(false, Ordering::SeqCst);
        fixture.wallet.resend_unmined_txs();
        assert_eq!(fixture.chain.sent.lock().unwrap().len(), 1);

        fixture.shutdown();
    }

    #[test]
    fn second_listen_fails() {
        let fixture = Fixture::started();

        let _rx = fixture.wallet.listen_lock_status().unwrap();
        assert!(matches!(
            fixture.wallet.listen_lock_status(),
            Err(Error::DuplicateListen)
        ));
        let _blocks = fixture.wallet.listen_connected_blocks().unwrap();
        assert!(matches!(
            fixture.wallet.listen_connected_blocks(),
            Err(Error::DuplicateListen)
        ));

        fixture.shutdown();
    }

    #[test]
    fn connected_block_updates_sync_state_and_balances() {
        let fixture = Fixture::started();
        let blocks = fixture.wallet.listen_connected_blocks().unwrap();
        let confirmed = fixture.wallet.listen_confirmed_balance().unwrap();

        let meta = BlockMeta {
            stamp: BlockStamp {
                hash: Default::default(),
                height: 11_112,
            },
            time: 1_234,
        };
        fixture
            .notif_tx
            .send(ChainNotification::BlockConnected(meta))
            .unwrap();

        let received = blocks.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, meta);
        // The seeded credits are all unmined, so nothing is confirmed.
        let balance = confirmed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(balance, Amount::ZERO);

        // The custody worker recorded the new tip.
        assert_eq!(
            fixture.wallet.calculate_balance(0).unwrap(),
            Amount::from_sat(37_100_000)
        );

        fixture.shutdown();
    }

    #[test]
    fn relevant_tx_is_recorded_and_fanned_out() {
        let fixture = Fixture::started();
        let relevant_rx = fixture.wallet.listen_relevant_txs().unwrap();

        // A new transaction paying 7e6 to one of the wallet's addresses.
        let pay_to_wallet = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![],
            output: vec![bitcoin::TxOut {
                value: 7_000_000,
                script_pubkey: fixture.credits[0].pk_script.clone(),
            }],
        };
        let record = TxRecord::from_transaction(pay_to_wallet, 9);
        let txid = record.txid;
        fixture
            .notif_tx
            .send(ChainNotification::RelevantTx(RelevantTx {
                record,
                block: None,
            }))
            .unwrap();

        let relevant = relevant_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(relevant.record.txid, txid);

        let credited = fixture
            .wallet
            .store
            .unspent_outputs()
            .unwrap()
            .into_iter()
            .any(|c| c.outpoint == OutPoint::new(txid, 0));
        assert!(credited, "output paying the wallet was not credited");

        fixture.shutdown();
    }

    #[test]
    fn new_address_is_registered_with_the_chain_server() {
        let fixture = Fixture::started();

        // Minting addresses needs the unlocked manager.
        assert!(matches!(
            fixture.wallet.new_address(0),
            Err(Error::Locked)
        ));
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        let address = fixture.wallet.new_address(0).unwrap();
        let change = fixture.wallet.new_change_address(0).unwrap();
        let registered = fixture.chain.registered.lock().unwrap();
        assert!(registered.contains(&address));
        assert!(registered.contains(&change));
        drop(registered);

        let encoded = fixture.wallet.sorted_active_payment_addresses().unwrap();
        assert!(encoded.contains(&address.to_string()));
        assert_eq!(encoded.len(), 7, "five imported keys plus two new");

        fixture.shutdown();
    }

    #[test]
    fn total_received_counts_account_credits() {
        let fixture = Fixture::started();
        fixture.wallet.unlock(PASS, Duration::from_secs(0)).unwrap();

        let funding = TxRecord::from_transaction(funding_tx(), 5);
        let meta = BlockMeta {
            stamp: BlockStamp {
                hash: Default::default(),
                height: 11_000,
            },
            time: 0,
        };
        fixture.wallet.store.insert_tx(&funding, Some(&meta)).unwrap();
        for index in 1..=5u32 {
            fixture
                .wallet
                .store
                .add_credit(&funding, Some(&meta), index, false)
                .unwrap();
        }

        let (amount, _) = fixture.wallet.total_received_for_account(0, 0).unwrap();
        assert_eq!(amount, Amount::from_sat(37_100_000));
        let (amount, _) = fixture.wallet.total_received_for_account(9, 0).unwrap();
        assert_eq!(amount, Amount::ZERO);

        fixture.shutdown();
    }

    #[test]
    fn create_tx_requires_start() {
        let (manager, _) = test_manager();
        let wallet = Wallet::open(
            manager,
            MemoryStore::new(),
            Network::Testnet,
            WalletConfig::default(),
        );
        assert!(wallet
            .create_simple_tx(0, pairs(&[(OUT_ADDR_1, 1)]), 0)
            .is_err());

        // Custody works before start.
        wallet.unlock(PASS, Duration::from_secs(0)).unwrap();
        assert!(!wallet.locked().unwrap());

        wallet.stop();
        wallet.wait_for_shutdown();
    }

    #[test]
    fn address_str_helper() {
        // The mainnet pay-list addresses used above decode fine; outputs are
        // not restricted to the wallet's own network class.
        assert!(Address::from_str(OUT_ADDR_1).is_ok());
        assert!(Address::from_str(OUT_ADDR_2).is_ok());
    }
}
