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

//! In-memory ledger fixtures shared by unit tests across the workspace.

use std::sync::Arc;

use lkey::{KeyPair, Secret};
use ltypes::{
    work_generate, Account, Amount, Block, BlockHash, ChangeBlock, Epoch, Epochs, Link, NetworkConstants, OpenBlock,
    ReceiveBlock, Root, SendBlock, SignatureVerification, StateBlock,
};

use crate::ledger::{Ledger, ProcessResult};
use crate::store::Store;

pub const EPOCH_1_LINK: u64 = 0xE1;
pub const EPOCH_2_LINK: u64 = 0xE2;

/// A test-network ledger over an in-memory store, plus block factories that
/// read the current chain state so callers only name intent.
pub struct LedgerContext {
    pub ledger: Arc<Ledger>,
    pub genesis_key: KeyPair,
    pub epoch_signer: KeyPair,
}

impl LedgerContext {
    pub fn new() -> LedgerContext {
        let constants = NetworkConstants::test();
        let epoch_signer = KeyPair::from_secret(Secret::from_low_u64_be(2));
        let mut epochs = Epochs::new();
        epochs.add(Epoch::Epoch1, *epoch_signer.public(), Link::from_low_u64_be(EPOCH_1_LINK));
        epochs.add(Epoch::Epoch2, *epoch_signer.public(), Link::from_low_u64_be(EPOCH_2_LINK));
        let genesis = Ledger::dev_genesis_block(&constants);
        let ledger = Arc::new(Ledger::new(Store::new_in_memory(), constants, epochs, genesis));
        LedgerContext {
            ledger,
            genesis_key: Ledger::dev_genesis_key(),
            epoch_signer,
        }
    }

    pub fn keypair(seed: u64) -> KeyPair {
        KeyPair::from_secret(Secret::from_low_u64_be(seed))
    }

    /// Processes in its own write transaction, committing on progress
    pub fn process(&self, block: &Arc<Block>) -> ProcessResult {
        let mut tx = self.ledger.store.tx_begin_write();
        let result = self.ledger.process(&mut tx, block, SignatureVerification::Unknown);
        if result == ProcessResult::Progress {
            tx.commit().unwrap();
        }
        result
    }

    pub fn process_ok(&self, block: &Arc<Block>) {
        assert_eq!(self.process(block), ProcessResult::Progress);
    }

    fn work(&self, root: &Root) -> u64 {
        // The epoch_2 threshold covers every detail combination on the
        // test network
        work_generate(root, self.ledger.constants.epoch_2_threshold)
    }

    fn head_and_balance(&self, account: &Account) -> (BlockHash, Amount) {
        let tx = self.ledger.store.tx_begin_read();
        let info = self.ledger.store.account_get(&tx, account).expect("Account exists");
        (info.head, info.balance)
    }

    pub fn balance(&self, account: &Account) -> Amount {
        let tx = self.ledger.store.tx_begin_read();
        self.ledger.store.account_get(&tx, account).map(|info| info.balance).unwrap_or_default()
    }

    pub fn legacy_send(&self, key: &KeyPair, destination: Account, amount: Amount) -> Arc<Block> {
        let (head, balance) = self.head_and_balance(key.public());
        let work = self.work(&head);
        Arc::new(Block::Send(SendBlock::new(head, destination, balance - amount, key.secret(), work)))
    }

    pub fn legacy_open(&self, key: &KeyPair, source: &BlockHash, representative: Account) -> Arc<Block> {
        let work = self.work(key.public());
        Arc::new(Block::Open(OpenBlock::new(*source, representative, *key.public(), key.secret(), work)))
    }

    pub fn legacy_receive(&self, key: &KeyPair, source: &BlockHash) -> Arc<Block> {
        let (head, _) = self.head_and_balance(key.public());
        let work = self.work(&head);
        Arc::new(Block::Receive(ReceiveBlock::new(head, *source, key.secret(), work)))
    }

    pub fn legacy_change(&self, key: &KeyPair, representative: Account) -> Arc<Block> {
        let (head, _) = self.head_and_balance(key.public());
        let work = self.work(&head);
        Arc::new(Block::Change(ChangeBlock::new(head, representative, key.secret(), work)))
    }

    pub fn state_send(&self, key: &KeyPair, destination: Account, amount: Amount) -> Arc<Block> {
        let tx = self.ledger.store.tx_begin_read();
        let info = self.ledger.store.account_get(&tx, key.public()).expect("Account exists");
        drop(tx);
        let work = self.work(&info.head);
        Arc::new(Block::State(StateBlock::new(
            *key.public(),
            info.head,
            info.representative,
            info.balance - amount,
            Link::from_slice(destination.as_bytes()),
            key.secret(),
            work,
        )))
    }

    /// State receive, opening the account when it has no chain yet
    pub fn state_receive(&self, key: &KeyPair, source: &BlockHash, amount: Amount) -> Arc<Block> {
        let tx = self.ledger.store.tx_begin_read();
        let info = self.ledger.store.account_get(&tx, key.public());
        drop(tx);
        let (previous, representative, balance) = match info {
            Some(info) => (info.head, info.representative, info.balance),
            None => (BlockHash::zero(), *key.public(), Amount::zero()),
        };
        let root = if previous.is_zero() {
            *key.public()
        } else {
            previous
        };
        let work = self.work(&root);
        Arc::new(Block::State(StateBlock::new(
            *key.public(),
            previous,
            representative,
            balance + amount,
            Link::from_slice(source.as_bytes()),
            key.secret(),
            work,
        )))
    }

    pub fn state_change(&self, key: &KeyPair, representative: Account) -> Arc<Block> {
        let (head, balance) = self.head_and_balance(key.public());
        let work = self.work(&head);
        Arc::new(Block::State(StateBlock::new(
            *key.public(),
            head,
            representative,
            balance,
            Link::zero(),
            key.secret(),
            work,
        )))
    }

    /// Epoch upgrade block signed by the epoch signer
    pub fn epoch_upgrade(&self, account: &Account, epoch: Epoch) -> Arc<Block> {
        let tx = self.ledger.store.tx_begin_read();
        let info = self.ledger.store.account_get(&tx, account);
        drop(tx);
        let (previous, representative, balance) = match info {
            Some(info) => (info.head, info.representative, info.balance),
            None => (BlockHash::zero(), Account::zero(), Amount::zero()),
        };
        let root = if previous.is_zero() {
            *account
        } else {
            previous
        };
        let work = self.work(&root);
        let link = *self.ledger.epochs.link(epoch).expect("Epoch is registered");
        Arc::new(Block::State(StateBlock::new(
            *account,
            previous,
            representative,
            balance,
            link,
            self.epoch_signer.secret(),
            work,
        )))
    }
}

impl Default for LedgerContext {
    fn default() -> LedgerContext {
        LedgerContext::new()
    }
}
