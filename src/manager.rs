// Hot Wallet Library
// Copyright (c) 2021-2022 Hot Wallet Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Address manager interface
//!
//! The wallet does not persist keys itself: it talks to an address manager
//! through the [`KeyManager`] trait. The manager custodies private keys
//! behind a passphrase, hands out new receiving and change addresses, and
//! remembers which account every address belongs to. Key derivation schemes
//! and at-rest encryption are the manager's business.
//!
//! [`MemoryManager`] is a plain in-memory implementation. It is what the
//! tests run against and it works for embedders that load keys from their
//! own storage at startup.

use std::collections::{HashMap, HashSet};

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, PrivateKey, Script};

use rand::{thread_rng, Rng};

use crate::error::Error;
use crate::types::BlockStamp;

/// An address under the control of an address manager, together with the
/// capability it offers.
///
/// Callers pattern-match instead of downcasting: only a
/// [`KeyBearing`](ManagedAddress::KeyBearing) entry can sign.
#[derive(Debug, Clone)]
pub enum ManagedAddress {
    /// An address whose private key the manager holds
    KeyBearing {
        /// The address itself
        address: Address,
        /// The private key, carrying the compressed-pubkey flag
        priv_key: PrivateKey,
        /// Whether the address has appeared on chain
        used: bool,
    },
    /// An address backed by a redeem script rather than a single key
    ScriptOnly {
        /// The address itself
        address: Address,
        /// The redeem script
        script: Script,
    },
    /// An address the manager only watches
    WatchOnly {
        /// The address itself
        address: Address,
    },
}

impl ManagedAddress {
    /// The address this entry manages
    pub fn address(&self) -> &Address {
        match self {
            ManagedAddress::KeyBearing { address, .. } => address,
            ManagedAddress::ScriptOnly { address, .. } => address,
            ManagedAddress::WatchOnly { address } => address,
        }
    }
}

/// The address-manager operations the wallet consumes.
///
/// The custody worker owns the single manager value; everything else in the
/// wallet reaches it through typed request messages, so implementations only
/// need to be [`Send`].
pub trait KeyManager: Send + 'static {
    /// Decrypt the private key material with `passphrase`
    fn unlock(&mut self, passphrase: &[u8]) -> Result<(), Error>;
    /// Discard the decrypted private key material
    fn lock(&mut self) -> Result<(), Error>;
    /// Whether the private key material is currently inaccessible
    fn is_locked(&self) -> bool;
    /// Re-encrypt the private key material under a new passphrase. The
    /// locked/unlocked state observed before the call is preserved.
    fn change_passphrase(&mut self, old: &[u8], new: &[u8]) -> Result<(), Error>;

    /// Look up the managed entry for an address. Returns
    /// [`Error::Locked`] when the entry is key-bearing and the manager is
    /// locked, and [`Error::UnknownAddress`] for addresses the manager does
    /// not know.
    fn managed_address(&self, address: &Address) -> Result<ManagedAddress, Error>;
    /// The account an address belongs to
    fn addr_account(&self, address: &Address) -> Result<u32, Error>;
    /// Derive the next receiving address for an account
    fn next_external(&mut self, account: u32) -> Result<Address, Error>;
    /// Derive the next change address for an account
    fn next_internal(&mut self, account: u32) -> Result<Address, Error>;
    /// Visit every active address
    fn for_each_active_address(&self, visitor: &mut dyn FnMut(&Address));

    /// The block the manager believes it has processed up to
    fn synced_to(&self) -> BlockStamp;
    /// Record the block the wallet has processed up to
    fn set_synced_to(&mut self, stamp: &BlockStamp) -> Result<(), Error>;
}

enum Entry {
    Key { priv_key: PrivateKey },
    Watch,
}

/// In-memory [`KeyManager`].
///
/// Keys live in process memory and the passphrase is checked by comparison;
/// scrypt hardening and persistent encrypted storage are left to managers
/// that actually hit a disk. Every address is backed by its own freshly
/// minted key rather than an HD chain, so deriving a new address requires
/// the manager to be unlocked, just like importing a key.
pub struct MemoryManager {
    network: Network,
    passphrase: Vec<u8>,
    locked: bool,
    entries: HashMap<String, Entry>,
    accounts: HashMap<String, u32>,
    used: HashSet<String>,
    synced_to: BlockStamp,
}

impl MemoryManager {
    /// Create an empty manager, initially locked
    pub fn new(network: Network, passphrase: &[u8]) -> MemoryManager {
        MemoryManager {
            network,
            passphrase: passphrase.to_vec(),
            locked: true,
            entries: HashMap::new(),
            accounts: HashMap::new(),
            used: HashSet::new(),
            synced_to: BlockStamp::default(),
        }
    }

    /// Import a private key into an account. The manager must be unlocked.
    pub fn import_private_key(
        &mut self,
        priv_key: PrivateKey,
        account: u32,
    ) -> Result<Address, Error> {
        if self.locked {
            return Err(Error::Locked);
        }
        let address = self.address_of(&priv_key);
        let encoded = address.to_string();
        self.entries.insert(encoded.clone(), Entry::Key { priv_key });
        self.accounts.insert(encoded, account);
        Ok(address)
    }

    /// Track an address without holding its key
    pub fn import_watch_only(&mut self, address: &Address, account: u32) {
        let encoded = address.to_string();
        self.entries.insert(encoded.clone(), Entry::Watch);
        self.accounts.insert(encoded, account);
    }

    /// Record that an address has appeared on chain
    pub fn mark_used(&mut self, address: &Address) {
        self.used.insert(address.to_string());
    }

    fn address_of(&self, priv_key: &PrivateKey) -> Address {
        let ctx = Secp256k1::signing_only();
        Address::p2pkh(&priv_key.public_key(&ctx), self.network)
    }

    // Every new address is backed by a freshly minted key, so handing one
    // out is subject to the same custody rule as importing one.
    fn fresh_address(&mut self, account: u32) -> Result<Address, Error> {
        if self.locked {
            return Err(Error::Locked);
        }
        let mut rng = thread_rng();
        let key = loop {
            let mut raw = [0u8; 32];
            rng.fill(&mut raw[..]);
            if let Ok(key) = SecretKey::from_slice(&raw) {
                break key;
            }
        };
        let priv_key = PrivateKey {
            compressed: true,
            network: self.network,
            key,
        };
        let address = self.address_of(&priv_key);
        let encoded = address.to_string();
        self.entries.insert(encoded.clone(), Entry::Key { priv_key });
        self.accounts.insert(encoded, account);
        Ok(address)
    }
}

impl KeyManager for MemoryManager {
    fn unlock(&mut self, passphrase: &[u8]) -> Result<(), Error> {
        if passphrase != &self.passphrase[..] {
            return Err(Error::InvalidPassphrase);
        }
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), Error> {
        self.locked = true;
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn change_passphrase(&mut self, old: &[u8], new: &[u8]) -> Result<(), Error> {
        if old != &self.passphrase[..] {
            return Err(Error::InvalidPassphrase);
        }
        self.passphrase = new.to_vec();
        Ok(())
    }

    fn managed_address(&self, address: &Address) -> Result<ManagedAddress, Error> {
        let encoded = address.to_string();
        match self.entries.get(&encoded) {
            Some(Entry::Key { priv_key }) => {
                if self.locked {
                    return Err(Error::Locked);
                }
                Ok(ManagedAddress::KeyBearing {
                    address: address.clone(),
                    priv_key: *priv_key,
                    used: self.used.contains(&encoded),
                })
            }
            Some(Entry::Watch) => Ok(ManagedAddress::WatchOnly {
                address: address.clone(),
            }),
            None => Err(Error::UnknownAddress),
        }
    }

    fn addr_account(&self, address: &Address) -> Result<u32, Error> {
        self.accounts
            .get(&address.to_string())
            .copied()
            .ok_or(Error::UnknownAddress)
    }

    fn next_external(&mut self, account: u32) -> Result<Address, Error> {
        self.fresh_address(account)
    }

    fn next_internal(&mut self, account: u32) -> Result<Address, Error> {
        self.fresh_address(account)
    }

    fn for_each_active_address(&self, visitor: &mut dyn FnMut(&Address)) {
        for encoded in self.entries.keys() {
            if let Ok(address) = encoded.parse::<Address>() {
                visitor(&address);
            }
        }
    }

    fn synced_to(&self) -> BlockStamp {
        self.synced_to
    }

    fn set_synced_to(&mut self, stamp: &BlockStamp) -> Result<(), Error> {
        self.synced_to = *stamp;
        Ok(())
    }
}

/// Key lookups the transaction builder needs while signing and while
/// filtering eligible outputs. Implemented by every [`KeyManager`] and by
/// the custody worker's request handle.
pub trait KeySource {
    /// Look up the managed entry for an address
    fn managed_address(&self, address: &Address) -> Result<ManagedAddress, Error>;
    /// The account an address belongs to
    fn addr_account(&self, address: &Address) -> Result<u32, Error>;
}

impl<M: KeyManager> KeySource for M {
    fn managed_address(&self, address: &Address) -> Result<ManagedAddress, Error> {
        KeyManager::managed_address(self, address)
    }

    fn addr_account(&self, address: &Address) -> Result<u32, Error> {
        KeyManager::addr_account(self, address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_manager() -> (MemoryManager, Address) {
        let mut manager = MemoryManager::new(Network::Testnet, b"passphrase");
        manager.unlock(b"passphrase").unwrap();
        let key =
            PrivateKey::from_wif("cVnNzZm3DiwkN1Ghs4W8cwcJC9f6TynCCcqzYt8n1c4hwjN2PfTw").unwrap();
        let addr = manager.import_private_key(key, 0).unwrap();
        (manager, addr)
    }

    #[test]
    fn lookup_requires_unlock_for_keys() {
        let (mut manager, addr) = test_manager();

        match KeyManager::managed_address(&manager, &addr) {
            Ok(ManagedAddress::KeyBearing { address, used, .. }) => {
                assert_eq!(address, addr);
                assert!(!used);
            }
            other => panic!("expected key-bearing entry, got {:?}", other),
        }

        manager.mark_used(&addr);
        match KeyManager::managed_address(&manager, &addr) {
            Ok(ManagedAddress::KeyBearing { used, .. }) => assert!(used),
            other => panic!("expected key-bearing entry, got {:?}", other),
        }

        manager.lock().unwrap();
        assert!(matches!(KeyManager::managed_address(&manager, &addr), Err(Error::Locked)));
    }

    #[test]
    fn watch_only_lookup_works_while_locked() {
        let (mut manager, addr) = test_manager();
        let watched = manager.next_external(1).unwrap();
        manager.import_watch_only(&watched, 2);
        manager.lock().unwrap();

        match KeyManager::managed_address(&manager, &watched) {
            Ok(entry @ ManagedAddress::WatchOnly { .. }) => assert_eq!(entry.address(), &watched),
            other => panic!("expected watch-only entry, got {:?}", other),
        }
        assert_eq!(KeyManager::addr_account(&manager, &watched).unwrap(), 2);
        assert_eq!(KeyManager::addr_account(&manager, &addr).unwrap(), 0);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let (mut manager, _) = test_manager();
        manager.lock().unwrap();
        assert!(matches!(
            manager.unlock(b"nope"),
            Err(Error::InvalidPassphrase)
        ));
        assert!(manager.is_locked());
    }

    #[test]
    fn change_passphrase_round_trip() {
        let (mut manager, _) = test_manager();
        manager.change_passphrase(b"passphrase", b"better").unwrap();
        assert!(!manager.is_locked(), "polarity preserved");

        manager.lock().unwrap();
        assert!(manager.unlock(b"passphrase").is_err());
        manager.unlock(b"better").unwrap();

        manager.change_passphrase(b"better", b"passphrase").unwrap();
        manager.lock().unwrap();
        manager.unlock(b"passphrase").unwrap();
    }

    #[test]
    fn next_addresses_require_unlock() {
        let (mut manager, _) = test_manager();
        manager.lock().unwrap();

        assert!(matches!(manager.next_external(0), Err(Error::Locked)));
        assert!(matches!(manager.next_internal(0), Err(Error::Locked)));

        manager.unlock(b"passphrase").unwrap();
        assert!(manager.next_external(0).is_ok());
    }

    #[test]
    fn next_addresses_are_distinct_and_owned() {
        let (mut manager, _) = test_manager();
        let a = manager.next_external(3).unwrap();
        let b = manager.next_internal(3).unwrap();
        assert_ne!(a, b);
        assert_eq!(KeyManager::addr_account(&manager, &a).unwrap(), 3);
        assert_eq!(KeyManager::addr_account(&manager, &b).unwrap(), 3);

        let mut count = 0;
        manager.for_each_active_address(&mut |_| count += 1);
        assert_eq!(count, 3);
    }
}
