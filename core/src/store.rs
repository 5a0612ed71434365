// Copyright 2020 Kodebox, Inc.
// This file is part of Lattice.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use kvdb::{DBTransaction, KeyValueDB};
use ltypes::{
    Account, AccountInfo, Amount, Block, BlockHash, BlockSideband, ConfirmationHeightInfo, PendingInfo, PendingKey,
    UncheckedInfo,
};
use rlp::RlpStream;

pub const COL_ACCOUNTS: u32 = 0;
pub const COL_BLOCKS: u32 = 1;
pub const COL_PENDING: u32 = 2;
pub const COL_UNCHECKED: u32 = 3;
pub const COL_ONLINE_WEIGHT: u32 = 4;
pub const COL_CONFIRMATION_HEIGHT: u32 = 5;
pub const COL_FRONTIERS: u32 = 6;
pub const NUM_COLUMNS: u32 = 7;

const DB_ERROR: &str = "Low-level database error. Some issue with disk?";

/// Read access shared by read and write transactions
pub trait Transaction {
    fn get(&self, col: u32, key: &[u8]) -> Option<Vec<u8>>;
}

pub struct ReadTransaction<'a> {
    db: &'a dyn KeyValueDB,
}

impl<'a> Transaction for ReadTransaction<'a> {
    fn get(&self, col: u32, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(col, key).expect(DB_ERROR)
    }
}

impl<'a> ReadTransaction<'a> {
    fn iter_with_prefix(&self, col: u32, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.db
            .iter_with_prefix(col, prefix)
            .map(|item| {
                let (key, value) = item.expect(DB_ERROR);
                (key.to_vec(), value)
            })
            .collect()
    }

    fn iter(&self, col: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.iter_with_prefix(col, &[])
    }
}

/// Buffers mutations over the backing store until `commit`. Reads observe
/// the buffered writes so a batch can depend on its own earlier blocks.
/// Dropping the transaction without committing discards it.
pub struct WriteTransaction<'a> {
    db: &'a dyn KeyValueDB,
    overlay: HashMap<(u32, Vec<u8>), Option<Vec<u8>>>,
}

impl<'a> Transaction for WriteTransaction<'a> {
    fn get(&self, col: u32, key: &[u8]) -> Option<Vec<u8>> {
        match self.overlay.get(&(col, key.to_vec())) {
            Some(entry) => entry.clone(),
            None => self.db.get(col, key).expect(DB_ERROR),
        }
    }
}

impl<'a> WriteTransaction<'a> {
    pub fn put(&mut self, col: u32, key: &[u8], value: Vec<u8>) {
        self.overlay.insert((col, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, col: u32, key: &[u8]) {
        self.overlay.insert((col, key.to_vec()), None);
    }

    /// Atomically applies every buffered mutation
    pub fn commit(self) -> io::Result<()> {
        let mut batch = DBTransaction::with_capacity(self.overlay.len());
        for ((col, key), entry) in self.overlay {
            match entry {
                Some(value) => batch.put_vec(col, &key, value),
                None => batch.delete(col, &key),
            }
        }
        self.db.write(batch)
    }
}

/// Key-ordered store of the ledger tables. The storage engine is a
/// collaborator behind the kvdb trait; this wrapper owns the schema.
pub struct Store {
    db: Arc<dyn KeyValueDB>,
}

impl Store {
    pub fn open(db: Arc<dyn KeyValueDB>) -> Store {
        Store {
            db,
        }
    }

    pub fn new_in_memory() -> Store {
        Store {
            db: Arc::new(kvdb_memorydb::create(NUM_COLUMNS)),
        }
    }

    pub fn tx_begin_read(&self) -> ReadTransaction<'_> {
        ReadTransaction {
            db: &*self.db,
        }
    }

    pub fn tx_begin_write(&self) -> WriteTransaction<'_> {
        WriteTransaction {
            db: &*self.db,
            overlay: HashMap::new(),
        }
    }

    // Accounts

    pub fn account_put(&self, tx: &mut WriteTransaction<'_>, account: &Account, info: &AccountInfo) {
        tx.put(COL_ACCOUNTS, account.as_bytes(), rlp::encode(info).to_vec());
    }

    pub fn account_get(&self, tx: &dyn Transaction, account: &Account) -> Option<AccountInfo> {
        tx.get(COL_ACCOUNTS, account.as_bytes()).map(|bytes| rlp::decode(&bytes).expect("Corrupted account entry"))
    }

    pub fn account_del(&self, tx: &mut WriteTransaction<'_>, account: &Account) {
        tx.delete(COL_ACCOUNTS, account.as_bytes());
    }

    pub fn account_exists(&self, tx: &dyn Transaction, account: &Account) -> bool {
        tx.get(COL_ACCOUNTS, account.as_bytes()).is_some()
    }

    pub fn accounts(&self, tx: &ReadTransaction<'_>) -> Vec<(Account, AccountInfo)> {
        tx.iter(COL_ACCOUNTS)
            .into_iter()
            .map(|(key, value)| {
                (Account::from_slice(&key), rlp::decode(&value).expect("Corrupted account entry"))
            })
            .collect()
    }

    // Blocks

    pub fn block_put(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash, block: &Block, sideband: &BlockSideband) {
        let mut stream = RlpStream::new_list(2);
        stream.append(block).append(sideband);
        tx.put(COL_BLOCKS, hash.as_bytes(), stream.out().to_vec());
    }

    pub fn block_get(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<(Arc<Block>, BlockSideband)> {
        tx.get(COL_BLOCKS, hash.as_bytes()).map(|bytes| {
            let rlp = rlp::Rlp::new(&bytes);
            let block: Block = rlp.val_at(0).expect("Corrupted block entry");
            let sideband: BlockSideband = rlp.val_at(1).expect("Corrupted block sideband");
            (Arc::new(block), sideband)
        })
    }

    pub fn block_del(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash) {
        tx.delete(COL_BLOCKS, hash.as_bytes());
    }

    pub fn block_exists(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        tx.get(COL_BLOCKS, hash.as_bytes()).is_some()
    }

    pub fn block_successor_set(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash, successor: &BlockHash) {
        if let Some((block, mut sideband)) = self.block_get(tx, hash) {
            sideband.successor = *successor;
            self.block_put(tx, hash, &block, &sideband);
        }
    }

    pub fn block_count(&self, tx: &ReadTransaction<'_>) -> u64 {
        tx.iter(COL_BLOCKS).len() as u64
    }

    // Pending

    pub fn pending_put(&self, tx: &mut WriteTransaction<'_>, key: &PendingKey, info: &PendingInfo) {
        tx.put(COL_PENDING, &key.to_bytes(), rlp::encode(info).to_vec());
    }

    pub fn pending_get(&self, tx: &dyn Transaction, key: &PendingKey) -> Option<PendingInfo> {
        tx.get(COL_PENDING, &key.to_bytes()).map(|bytes| rlp::decode(&bytes).expect("Corrupted pending entry"))
    }

    pub fn pending_del(&self, tx: &mut WriteTransaction<'_>, key: &PendingKey) {
        tx.delete(COL_PENDING, &key.to_bytes());
    }

    pub fn pending_exists(&self, tx: &dyn Transaction, key: &PendingKey) -> bool {
        tx.get(COL_PENDING, &key.to_bytes()).is_some()
    }

    pub fn pending_for_account(&self, tx: &ReadTransaction<'_>, account: &Account) -> Vec<(PendingKey, PendingInfo)> {
        tx.iter_with_prefix(COL_PENDING, account.as_bytes())
            .into_iter()
            .filter_map(|(key, value)| {
                let key = PendingKey::from_bytes(&key)?;
                Some((key, rlp::decode(&value).expect("Corrupted pending entry")))
            })
            .collect()
    }

    // Unchecked, keyed by the missing dependency hash

    pub fn unchecked_put(&self, tx: &mut WriteTransaction<'_>, dependency: &BlockHash, info: &UncheckedInfo, cap: usize) {
        let mut entries = self.unchecked_get(tx, dependency);
        let hash = info.block.hash();
        if entries.iter().any(|entry| entry.block.hash() == hash) {
            return
        }
        entries.push(info.clone());
        if entries.len() > cap {
            entries.remove(0);
        }
        let mut stream = RlpStream::new_list(entries.len());
        for entry in &entries {
            stream.append(entry);
        }
        tx.put(COL_UNCHECKED, dependency.as_bytes(), stream.out().to_vec());
    }

    pub fn unchecked_get(&self, tx: &dyn Transaction, dependency: &BlockHash) -> Vec<UncheckedInfo> {
        tx.get(COL_UNCHECKED, dependency.as_bytes())
            .map(|bytes| rlp::Rlp::new(&bytes).as_list().expect("Corrupted unchecked entry"))
            .unwrap_or_default()
    }

    pub fn unchecked_del(&self, tx: &mut WriteTransaction<'_>, dependency: &BlockHash) {
        tx.delete(COL_UNCHECKED, dependency.as_bytes());
    }

    pub fn unchecked_count(&self, tx: &ReadTransaction<'_>) -> usize {
        tx.iter(COL_UNCHECKED)
            .into_iter()
            .map(|(_, value)| rlp::Rlp::new(&value).item_count().unwrap_or(0))
            .sum()
    }

    // Online weight samples, keyed by nanosecond timestamps

    pub fn online_weight_put(&self, tx: &mut WriteTransaction<'_>, time_ns: u64, weight: &Amount) {
        tx.put(COL_ONLINE_WEIGHT, &time_ns.to_be_bytes(), rlp::encode(weight).to_vec());
    }

    pub fn online_weight_del(&self, tx: &mut WriteTransaction<'_>, time_ns: u64) {
        tx.delete(COL_ONLINE_WEIGHT, &time_ns.to_be_bytes());
    }

    pub fn online_weights(&self, tx: &ReadTransaction<'_>) -> Vec<(u64, Amount)> {
        tx.iter(COL_ONLINE_WEIGHT)
            .into_iter()
            .map(|(key, value)| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&key);
                (u64::from_be_bytes(bytes), rlp::decode(&value).expect("Corrupted weight entry"))
            })
            .collect()
    }

    pub fn online_weight_count(&self, tx: &ReadTransaction<'_>) -> u64 {
        tx.iter(COL_ONLINE_WEIGHT).len() as u64
    }

    // Confirmation heights

    pub fn confirmation_height_put(
        &self,
        tx: &mut WriteTransaction<'_>,
        account: &Account,
        info: &ConfirmationHeightInfo,
    ) {
        tx.put(COL_CONFIRMATION_HEIGHT, account.as_bytes(), rlp::encode(info).to_vec());
    }

    pub fn confirmation_height_get(&self, tx: &dyn Transaction, account: &Account) -> Option<ConfirmationHeightInfo> {
        tx.get(COL_CONFIRMATION_HEIGHT, account.as_bytes())
            .map(|bytes| rlp::decode(&bytes).expect("Corrupted confirmation height entry"))
    }

    pub fn confirmation_height_del(&self, tx: &mut WriteTransaction<'_>, account: &Account) {
        tx.delete(COL_CONFIRMATION_HEIGHT, account.as_bytes());
    }

    pub fn confirmation_heights(&self, tx: &ReadTransaction<'_>) -> Vec<(Account, ConfirmationHeightInfo)> {
        tx.iter(COL_CONFIRMATION_HEIGHT)
            .into_iter()
            .map(|(key, value)| {
                (Account::from_slice(&key), rlp::decode(&value).expect("Corrupted confirmation height entry"))
            })
            .collect()
    }

    // Frontiers, head hash to owning account

    pub fn frontier_put(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash, account: &Account) {
        tx.put(COL_FRONTIERS, hash.as_bytes(), account.as_bytes().to_vec());
    }

    pub fn frontier_get(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        tx.get(COL_FRONTIERS, hash.as_bytes()).map(|bytes| Account::from_slice(&bytes))
    }

    pub fn frontier_del(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash) {
        tx.delete(COL_FRONTIERS, hash.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use ltypes::Epoch;

    use super::*;

    #[test]
    fn write_transaction_reads_its_own_writes() {
        let store = Store::new_in_memory();
        let account = Account::from_low_u64_be(1);
        let info = AccountInfo {
            head: BlockHash::from_low_u64_be(2),
            open_block: BlockHash::from_low_u64_be(2),
            representative: account,
            balance: Amount::from(5u64),
            modified: 0,
            block_count: 1,
            epoch: Epoch::Epoch0,
        };
        let mut tx = store.tx_begin_write();
        assert!(store.account_get(&tx, &account).is_none());
        store.account_put(&mut tx, &account, &info);
        assert_eq!(store.account_get(&tx, &account), Some(info.clone()));

        // Not visible to readers until commit
        assert!(store.account_get(&store.tx_begin_read(), &account).is_none());
        tx.commit().unwrap();
        assert_eq!(store.account_get(&store.tx_begin_read(), &account), Some(info));
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let store = Store::new_in_memory();
        let account = Account::from_low_u64_be(1);
        {
            let mut tx = store.tx_begin_write();
            store.confirmation_height_put(&mut tx, &account, &ConfirmationHeightInfo {
                height: 1,
                frontier: BlockHash::from_low_u64_be(1),
            });
        }
        assert!(store.confirmation_height_get(&store.tx_begin_read(), &account).is_none());
    }

    #[test]
    fn online_weights_are_time_ordered() {
        let store = Store::new_in_memory();
        let mut tx = store.tx_begin_write();
        store.online_weight_put(&mut tx, 300, &Amount::from(3u64));
        store.online_weight_put(&mut tx, 100, &Amount::from(1u64));
        store.online_weight_put(&mut tx, 200, &Amount::from(2u64));
        tx.commit().unwrap();
        let read = store.tx_begin_read();
        let times: Vec<u64> = store.online_weights(&read).into_iter().map(|(time, _)| time).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn unchecked_capped_per_dependency() {
        let store = Store::new_in_memory();
        let dependency = BlockHash::from_low_u64_be(9);
        let keypair = lkey::KeyPair::from_secret(lkey::Secret::from_low_u64_be(1));
        let mut tx = store.tx_begin_write();
        for i in 0..4u64 {
            let block = ltypes::Block::Send(ltypes::SendBlock::new(
                BlockHash::from_low_u64_be(i),
                Account::from_low_u64_be(1),
                Amount::from(i),
                keypair.secret(),
                0,
            ));
            let info =
                UncheckedInfo::new(std::sync::Arc::new(block), Account::zero(), 0, ltypes::SignatureVerification::Unknown);
            store.unchecked_put(&mut tx, &dependency, &info, 2);
        }
        assert_eq!(store.unchecked_get(&tx, &dependency).len(), 2);
    }
}
