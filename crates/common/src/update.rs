use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{Address, Bytes, B256, U128};

use crate::hash::Hasher;

/// All state changes applied by one block, across every touched account.
///
/// Deleted and created address sets are applied in that order, so an address
/// destroyed and recreated across consecutive blocks lands on a fresh
/// reincarnation. Storage writes are recorded in insertion order and
/// normalized to slot order when the diff is projected per account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub deleted_accounts: BTreeSet<Address>,
    pub created_accounts: BTreeSet<Address>,
    pub balances: BTreeMap<Address, U128>,
    pub nonces: BTreeMap<Address, u64>,
    pub codes: BTreeMap<Address, Bytes>,
    pub storage: Vec<(Address, B256, B256)>,
}

impl Update {
    /// True when the update carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.deleted_accounts.is_empty()
            && self.created_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.storage.is_empty()
    }

    /// Project the whole-block diff onto its individual accounts.
    ///
    /// Every touched account appears exactly once. Per-account storage writes
    /// are normalized to ascending slot order, the canonical order their
    /// hashes are computed in.
    pub fn per_account(&self) -> BTreeMap<Address, AccountUpdate> {
        let mut diffs: BTreeMap<Address, AccountUpdate> = BTreeMap::new();
        for addr in &self.deleted_accounts {
            diffs.entry(*addr).or_default().deleted = true;
        }
        for addr in &self.created_accounts {
            diffs.entry(*addr).or_default().created = true;
        }
        for (addr, balance) in &self.balances {
            diffs.entry(*addr).or_default().balance = Some(*balance);
        }
        for (addr, nonce) in &self.nonces {
            diffs.entry(*addr).or_default().nonce = Some(*nonce);
        }
        for (addr, code) in &self.codes {
            diffs.entry(*addr).or_default().code = Some(code.clone());
        }
        for (addr, slot, value) in &self.storage {
            diffs.entry(*addr).or_default().storage.push((*slot, *value));
        }
        for diff in diffs.values_mut() {
            diff.storage.sort_by(|a, b| a.0.cmp(&b.0));
        }
        diffs
    }
}

/// The projection of one block's diff onto a single account.
///
/// `created` and `deleted` are mutually exclusive within a block; an update
/// carrying both cannot be committed because the status table holds at most
/// one row per account and block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub created: bool,
    pub deleted: bool,
    pub balance: Option<U128>,
    pub nonce: Option<u64>,
    pub code: Option<Bytes>,
    pub storage: Vec<(B256, B256)>,
}

const STATUS_NONE: u8 = 0;
const STATUS_CREATED: u8 = 1;
const STATUS_DELETED: u8 = 2;

const MARKER_ABSENT: u8 = 0;
const MARKER_PRESENT: u8 = 1;

impl AccountUpdate {
    /// Canonical hash of this account diff.
    ///
    /// The byte stream is fixed: status tag, then balance, nonce and code
    /// each behind a present/absent marker (balance 16 bytes big-endian,
    /// nonce 8 bytes big-endian, code with a 4-byte big-endian length), then
    /// every storage write as 32-byte key followed by 32-byte value. Recorded
    /// hashes can only be reproduced bit-for-bit.
    pub fn hash(&self) -> B256 {
        let mut hasher = Hasher::new();
        hasher.ingest([self.status_tag()]);

        match self.balance {
            Some(balance) => {
                hasher.ingest([MARKER_PRESENT]);
                hasher.ingest(balance.to_be_bytes::<16>());
            }
            None => hasher.ingest([MARKER_ABSENT]),
        }

        match self.nonce {
            Some(nonce) => {
                hasher.ingest([MARKER_PRESENT]);
                hasher.ingest(nonce.to_be_bytes());
            }
            None => hasher.ingest([MARKER_ABSENT]),
        }

        match &self.code {
            Some(code) => {
                hasher.ingest([MARKER_PRESENT]);
                hasher.ingest((code.len() as u32).to_be_bytes());
                hasher.ingest(code);
            }
            None => hasher.ingest([MARKER_ABSENT]),
        }

        for (slot, value) in &self.storage {
            hasher.ingest(slot);
            hasher.ingest(value);
        }

        hasher.finish()
    }

    fn status_tag(&self) -> u8 {
        if self.created {
            STATUS_CREATED
        } else if self.deleted {
            STATUS_DELETED
        } else {
            STATUS_NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    fn addr(n: u8) -> Address {
        Address::with_last_byte(n)
    }

    fn slot(n: u8) -> B256 {
        B256::with_last_byte(n)
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(Update::default().is_empty());
        assert!(Update::default().per_account().is_empty());
    }

    #[test]
    fn per_account_merges_all_fields() {
        let a = addr(1);
        let mut update = Update::default();
        update.created_accounts.insert(a);
        update.balances.insert(a, U128::from(100u64));
        update.nonces.insert(a, 7);
        update.codes.insert(a, Bytes::from_static(&[0x60, 0x00]));
        update.storage.push((a, slot(1), slot(9)));
        update.storage.push((a, slot(2), slot(8)));

        let diffs = update.per_account();
        assert_eq!(diffs.len(), 1);

        let diff = &diffs[&a];
        assert!(diff.created);
        assert!(!diff.deleted);
        assert_eq!(diff.balance, Some(U128::from(100u64)));
        assert_eq!(diff.nonce, Some(7));
        assert_eq!(diff.code, Some(Bytes::from_static(&[0x60, 0x00])));
        assert_eq!(diff.storage, vec![(slot(1), slot(9)), (slot(2), slot(8))]);
    }

    #[test]
    fn per_account_splits_by_address() {
        let mut update = Update::default();
        update.deleted_accounts.insert(addr(2));
        update.balances.insert(addr(1), U128::from(5u64));
        update.storage.push((addr(3), slot(1), slot(1)));

        let diffs = update.per_account();
        assert_eq!(
            diffs.keys().copied().collect::<Vec<_>>(),
            vec![addr(1), addr(2), addr(3)],
        );
        assert!(diffs[&addr(2)].deleted);
        assert_eq!(diffs[&addr(1)].balance, Some(U128::from(5u64)));
        assert_eq!(diffs[&addr(3)].storage.len(), 1);
    }

    #[test]
    fn per_account_normalizes_storage_writes_to_slot_order() {
        let a = address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        let mut update = Update::default();
        update.storage.push((a, slot(9), slot(1)));
        update.storage.push((a, slot(1), slot(2)));
        update.storage.push((a, slot(5), slot(3)));

        let diff = &update.per_account()[&a];
        assert_eq!(
            diff.storage,
            vec![(slot(1), slot(2)), (slot(5), slot(3)), (slot(9), slot(1))],
        );
    }

    // Pin the canonical encoding byte for byte: the hash of a diff must equal
    // the digest of the documented stream.

    fn manual_hash(stream: &[u8]) -> B256 {
        let mut hasher = Hasher::new();
        hasher.ingest(stream);
        hasher.finish()
    }

    #[test]
    fn hash_of_default_diff_encodes_four_absent_markers() {
        // status tag 0, then absent balance, nonce and code.
        assert_eq!(AccountUpdate::default().hash(), manual_hash(&[0, 0, 0, 0]));
    }

    #[test]
    fn hash_encodes_created_and_deleted_tags() {
        let created = AccountUpdate { created: true, ..Default::default() };
        assert_eq!(created.hash(), manual_hash(&[1, 0, 0, 0]));

        let deleted = AccountUpdate { deleted: true, ..Default::default() };
        assert_eq!(deleted.hash(), manual_hash(&[2, 0, 0, 0]));
    }

    #[test]
    fn hash_encodes_balance_big_endian() {
        let diff = AccountUpdate {
            balance: Some(U128::from(0x0102u64)),
            ..Default::default()
        };

        let mut stream = vec![0u8]; // status
        stream.push(1); // balance present
        stream.extend_from_slice(&[0; 14]);
        stream.extend_from_slice(&[0x01, 0x02]);
        stream.push(0); // nonce absent
        stream.push(0); // code absent

        assert_eq!(diff.hash(), manual_hash(&stream));
    }

    #[test]
    fn hash_encodes_nonce_and_code() {
        let diff = AccountUpdate {
            nonce: Some(3),
            code: Some(Bytes::from_static(&[0xaa, 0xbb, 0xcc])),
            ..Default::default()
        };

        let mut stream = vec![0u8, 0]; // status, balance absent
        stream.push(1); // nonce present
        stream.extend_from_slice(&3u64.to_be_bytes());
        stream.push(1); // code present
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        assert_eq!(diff.hash(), manual_hash(&stream));
    }

    #[test]
    fn hash_appends_storage_writes_in_order() {
        let k = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let v = b256!("0000000000000000000000000000000000000000000000000000000000000007");
        let diff = AccountUpdate { storage: vec![(k, v)], ..Default::default() };

        let mut stream = vec![0u8, 0, 0, 0];
        stream.extend_from_slice(k.as_slice());
        stream.extend_from_slice(v.as_slice());

        assert_eq!(diff.hash(), manual_hash(&stream));
    }

    #[test]
    fn hash_distinguishes_storage_write_order() {
        let a = (slot(1), slot(2));
        let b = (slot(3), slot(4));

        let ab = AccountUpdate { storage: vec![a, b], ..Default::default() };
        let ba = AccountUpdate { storage: vec![b, a], ..Default::default() };
        assert_ne!(ab.hash(), ba.hash());
    }

    #[test]
    fn hash_distinguishes_empty_code_from_no_code() {
        let none = AccountUpdate::default();
        let empty = AccountUpdate { code: Some(Bytes::new()), ..Default::default() };
        assert_ne!(none.hash(), empty.hash());
    }
}
