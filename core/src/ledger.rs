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

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lkey::{verify, KeyPair, Secret};
use ltypes::{
    Account, AccountInfo, Amount, Block, BlockDetails, BlockHash, BlockSideband, ConfirmationHeightInfo, Epoch,
    Epochs, NetworkConstants, OpenBlock, PendingInfo, PendingKey, SignatureVerification,
};

use crate::rep_weights::RepWeights;
use crate::store::{Store, Transaction, WriteTransaction};

pub fn seconds_since_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("Clock runs after 1970").as_secs()
}

/// Closed set of outcomes of applying one block to the ledger. Every code
/// maps to a deterministic consequence in the block processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Progress,
    BadSignature,
    NegativeSpend,
    Fork,
    Unreceivable,
    GapPrevious,
    GapSource,
    Old,
    BlockPosition,
    InsufficientWork,
    OpenedBurnAccount,
    BalanceMismatch,
    RepresentativeMismatch,
    UnknownEpochLink,
}

#[derive(Default)]
pub struct LedgerCache {
    pub block_count: AtomicU64,
    pub cemented_count: AtomicU64,
}

/// Serialized ledger state machine. All mutation goes through `process`
/// and `rollback` inside a single write transaction at a time.
pub struct Ledger {
    pub store: Store,
    pub constants: NetworkConstants,
    pub epochs: Arc<Epochs>,
    pub rep_weights: RepWeights,
    pub cache: LedgerCache,
    pub genesis_account: Account,
    pub genesis_block: Arc<Block>,
}

impl Ledger {
    pub fn new(store: Store, constants: NetworkConstants, epochs: Epochs, genesis_block: Arc<Block>) -> Ledger {
        let genesis_account = genesis_block.account_field().expect("Genesis opens an account");
        let ledger = Ledger {
            store,
            constants,
            epochs: Arc::new(epochs),
            rep_weights: RepWeights::new(),
            cache: LedgerCache::default(),
            genesis_account,
            genesis_block,
        };
        {
            let read = ledger.store.tx_begin_read();
            for (_, info) in ledger.store.accounts(&read) {
                ledger.rep_weights.representation_add(&info.representative, info.balance);
            }
            ledger.cache.block_count.store(ledger.store.block_count(&read), AtomicOrdering::Relaxed);
            let cemented =
                ledger.store.confirmation_heights(&read).into_iter().map(|(_, info)| info.height).sum::<u64>();
            ledger.cache.cemented_count.store(cemented, AtomicOrdering::Relaxed);
        }
        if ledger.cache.block_count.load(AtomicOrdering::Relaxed) == 0 {
            ledger.initialize_genesis();
        }
        ledger
    }

    /// Deterministic development keypair holding the test-network supply
    pub fn dev_genesis_key() -> KeyPair {
        KeyPair::from_secret(Secret::from_low_u64_be(1))
    }

    pub fn dev_genesis_block(constants: &NetworkConstants) -> Arc<Block> {
        let keypair = Self::dev_genesis_key();
        let account = *keypair.public();
        let work = ltypes::work_generate(&account, constants.threshold_base());
        Arc::new(Block::Open(OpenBlock::new(account, account, account, keypair.secret(), work)))
    }

    fn initialize_genesis(&self) {
        let hash = self.genesis_block.hash();
        let balance = Amount::max_value();
        let mut tx = self.store.tx_begin_write();
        let sideband = BlockSideband {
            account: self.genesis_account,
            successor: BlockHash::zero(),
            height: 1,
            timestamp: seconds_since_epoch(),
            balance,
            details: BlockDetails::default(),
        };
        self.store.block_put(&mut tx, &hash, &self.genesis_block, &sideband);
        self.store.account_put(&mut tx, &self.genesis_account, &AccountInfo {
            head: hash,
            open_block: hash,
            representative: self.genesis_account,
            balance,
            modified: seconds_since_epoch(),
            block_count: 1,
            epoch: Epoch::Epoch0,
        });
        // Genesis is confirmed by definition
        self.store.confirmation_height_put(&mut tx, &self.genesis_account, &ConfirmationHeightInfo {
            height: 1,
            frontier: hash,
        });
        self.store.frontier_put(&mut tx, &hash, &self.genesis_account);
        tx.commit().expect("Genesis write failed");
        self.rep_weights.representation_add(&self.genesis_account, balance);
        self.cache.block_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.cache.cemented_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn weight(&self, account: &Account) -> Amount {
        self.rep_weights.representation_get(account)
    }

    pub fn latest(&self, tx: &dyn Transaction, account: &Account) -> Option<BlockHash> {
        self.store.account_get(tx, account).map(|info| info.head)
    }

    pub fn account(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        self.store.block_get(tx, hash).map(|(_, sideband)| sideband.account)
    }

    pub fn balance(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<Amount> {
        self.store.block_get(tx, hash).map(|(_, sideband)| sideband.balance)
    }

    pub fn block_exists(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        self.store.block_exists(tx, hash)
    }

    pub fn block_confirmed(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        match self.store.block_get(tx, hash) {
            Some((_, sideband)) => match self.store.confirmation_height_get(tx, &sideband.account) {
                Some(info) => info.height >= sideband.height,
                None => false,
            },
            None => false,
        }
    }

    /// The hash this block receives funds from, if it is a receiving block
    pub fn block_source(&self, block: &Block, sideband: &BlockSideband) -> Option<BlockHash> {
        match block {
            Block::State(state) if sideband.details.is_receive => Some(state.link),
            _ => block.source(),
        }
    }

    /// Representative in effect at `hash`, walking back through blocks
    /// that do not carry one
    pub fn representative_calculated(&self, tx: &dyn Transaction, hash: &BlockHash) -> Account {
        let mut current = *hash;
        while !current.is_zero() {
            match self.store.block_get(tx, &current) {
                Some((block, _)) => match block.representative() {
                    Some(representative) => return representative,
                    None => current = block.previous(),
                },
                None => break,
            }
        }
        Account::zero()
    }

    pub fn is_epoch_link(&self, link: &ltypes::Link) -> bool {
        self.epochs.is_epoch_link(link)
    }

    /// Applies one block, returning the outcome code. On `Progress` the
    /// transaction holds the account, block, pending, frontier and weight
    /// updates; everything else leaves it untouched.
    pub fn process(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let hash = block.hash();
        if self.store.block_exists(tx, &hash) {
            return ProcessResult::Old
        }
        let result = match block.as_ref() {
            Block::Send(_) => self.process_send(tx, block, &hash, verification),
            Block::Receive(_) => self.process_receive(tx, block, &hash, verification),
            Block::Open(_) => self.process_open(tx, block, &hash, verification),
            Block::Change(_) => self.process_change(tx, block, &hash, verification),
            Block::State(_) => self.process_state(tx, block, &hash, verification),
        };
        if result == ProcessResult::Progress {
            self.cache.block_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
        result
    }

    fn signature_ok(&self, block: &Block, signer: &Account, verification: SignatureVerification) -> bool {
        match verification {
            SignatureVerification::Valid => true,
            _ => verify(signer, block.signature(), &block.hash()),
        }
    }

    fn legacy_head_checks(
        &self,
        tx: &dyn Transaction,
        block: &Block,
    ) -> Result<(Account, AccountInfo, BlockSideband), ProcessResult> {
        let previous = block.previous();
        let (_, previous_sideband) = self.store.block_get(tx, &previous).ok_or(ProcessResult::GapPrevious)?;
        let account = previous_sideband.account;
        let info = self.store.account_get(tx, &account).ok_or(ProcessResult::GapPrevious)?;
        if info.head != previous {
            return Err(ProcessResult::Fork)
        }
        // Legacy kinds are only valid before the account upgrades
        if info.epoch != Epoch::Epoch0 {
            return Err(ProcessResult::BlockPosition)
        }
        Ok((account, info, previous_sideband))
    }

    fn advance_account(
        &self,
        tx: &mut WriteTransaction<'_>,
        account: &Account,
        info: &AccountInfo,
        hash: &BlockHash,
        balance: Amount,
        representative: Account,
        epoch: Epoch,
    ) -> AccountInfo {
        let new_info = AccountInfo {
            head: *hash,
            open_block: info.open_block,
            representative,
            balance,
            modified: seconds_since_epoch(),
            block_count: info.block_count + 1,
            epoch,
        };
        self.store.account_put(tx, account, &new_info);
        self.store.frontier_del(tx, &info.head);
        self.store.frontier_put(tx, hash, account);
        self.store.block_successor_set(tx, &info.head, hash);
        new_info
    }

    fn process_send(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        hash: &BlockHash,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let (account, info, previous_sideband) = match self.legacy_head_checks(tx, block) {
            Ok(ok) => ok,
            Err(result) => return result,
        };
        if verification == SignatureVerification::Invalid || !self.signature_ok(block, &account, verification) {
            return ProcessResult::BadSignature
        }
        let balance = block.balance_field().expect("Send blocks carry a balance");
        if balance > previous_sideband.balance {
            return ProcessResult::NegativeSpend
        }
        let details = BlockDetails {
            epoch: Epoch::Epoch0,
            is_send: true,
            is_receive: false,
            is_epoch: false,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }
        let amount = previous_sideband.balance - balance;
        let destination = block.destination().expect("Send blocks carry a destination");
        self.store.pending_put(tx, &PendingKey::new(destination, *hash), &PendingInfo {
            source: account,
            amount,
            epoch: Epoch::Epoch0,
        });
        self.rep_weights.representation_subtract(&info.representative, amount);
        let new_info = self.advance_account(tx, &account, &info, hash, balance, info.representative, Epoch::Epoch0);
        self.store.block_put(tx, hash, block, &BlockSideband {
            account,
            successor: BlockHash::zero(),
            height: previous_sideband.height + 1,
            timestamp: new_info.modified,
            balance,
            details,
        });
        ProcessResult::Progress
    }

    fn process_receive(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        hash: &BlockHash,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let (account, info, previous_sideband) = match self.legacy_head_checks(tx, block) {
            Ok(ok) => ok,
            Err(result) => return result,
        };
        if verification == SignatureVerification::Invalid || !self.signature_ok(block, &account, verification) {
            return ProcessResult::BadSignature
        }
        let source = block.source().expect("Receive blocks carry a source");
        if !self.store.block_exists(tx, &source) {
            return ProcessResult::GapSource
        }
        let pending_key = PendingKey::new(account, source);
        let pending = match self.store.pending_get(tx, &pending_key) {
            Some(pending) => pending,
            None => return ProcessResult::Unreceivable,
        };
        if pending.epoch != Epoch::Epoch0 {
            return ProcessResult::BlockPosition
        }
        let details = BlockDetails {
            epoch: Epoch::Epoch0,
            is_send: false,
            is_receive: true,
            is_epoch: false,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }
        let balance = previous_sideband.balance + pending.amount;
        self.store.pending_del(tx, &pending_key);
        self.rep_weights.representation_add(&info.representative, pending.amount);
        let new_info = self.advance_account(tx, &account, &info, hash, balance, info.representative, Epoch::Epoch0);
        self.store.block_put(tx, hash, block, &BlockSideband {
            account,
            successor: BlockHash::zero(),
            height: previous_sideband.height + 1,
            timestamp: new_info.modified,
            balance,
            details,
        });
        ProcessResult::Progress
    }

    fn process_open(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        hash: &BlockHash,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let account = block.account_field().expect("Open blocks carry an account");
        if account.is_zero() {
            return ProcessResult::OpenedBurnAccount
        }
        if self.store.account_exists(tx, &account) {
            return ProcessResult::Fork
        }
        if verification == SignatureVerification::Invalid || !self.signature_ok(block, &account, verification) {
            return ProcessResult::BadSignature
        }
        let source = block.source().expect("Open blocks carry a source");
        if !self.store.block_exists(tx, &source) {
            return ProcessResult::GapSource
        }
        let pending_key = PendingKey::new(account, source);
        let pending = match self.store.pending_get(tx, &pending_key) {
            Some(pending) => pending,
            None => return ProcessResult::Unreceivable,
        };
        if pending.epoch != Epoch::Epoch0 {
            return ProcessResult::BlockPosition
        }
        let details = BlockDetails {
            epoch: Epoch::Epoch0,
            is_send: false,
            is_receive: true,
            is_epoch: false,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }
        let representative = block.representative().expect("Open blocks carry a representative");
        self.store.pending_del(tx, &pending_key);
        self.store.account_put(tx, &account, &AccountInfo {
            head: *hash,
            open_block: *hash,
            representative,
            balance: pending.amount,
            modified: seconds_since_epoch(),
            block_count: 1,
            epoch: Epoch::Epoch0,
        });
        self.rep_weights.representation_add(&representative, pending.amount);
        self.store.frontier_put(tx, hash, &account);
        self.store.block_put(tx, hash, block, &BlockSideband {
            account,
            successor: BlockHash::zero(),
            height: 1,
            timestamp: seconds_since_epoch(),
            balance: pending.amount,
            details,
        });
        ProcessResult::Progress
    }

    fn process_change(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        hash: &BlockHash,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let (account, info, previous_sideband) = match self.legacy_head_checks(tx, block) {
            Ok(ok) => ok,
            Err(result) => return result,
        };
        if verification == SignatureVerification::Invalid || !self.signature_ok(block, &account, verification) {
            return ProcessResult::BadSignature
        }
        let details = BlockDetails {
            epoch: Epoch::Epoch0,
            is_send: false,
            is_receive: false,
            is_epoch: false,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }
        let representative = block.representative().expect("Change blocks carry a representative");
        self.rep_weights.representation_subtract(&info.representative, info.balance);
        self.rep_weights.representation_add(&representative, info.balance);
        let new_info = self.advance_account(tx, &account, &info, hash, info.balance, representative, Epoch::Epoch0);
        self.store.block_put(tx, hash, block, &BlockSideband {
            account,
            successor: BlockHash::zero(),
            height: previous_sideband.height + 1,
            timestamp: new_info.modified,
            balance: info.balance,
            details,
        });
        ProcessResult::Progress
    }

    fn process_state(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        hash: &BlockHash,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let state = match block.as_ref() {
            Block::State(state) => state,
            _ => unreachable!(),
        };
        let account = state.account;
        let is_epoch = self.epochs.is_epoch_link(&state.link);
        if account.is_zero() {
            return ProcessResult::OpenedBurnAccount
        }
        let existing = self.store.account_get(tx, &account);
        let previous_sideband = if state.previous.is_zero() {
            if existing.is_some() {
                return ProcessResult::Fork
            }
            None
        } else {
            let info = match &existing {
                Some(info) => info,
                None => return ProcessResult::GapPrevious,
            };
            let (_, sideband) = match self.store.block_get(tx, &state.previous) {
                Some(found) => found,
                None => return ProcessResult::GapPrevious,
            };
            if info.head != state.previous {
                return ProcessResult::Fork
            }
            Some(sideband)
        };
        if is_epoch {
            self.process_epoch(tx, block, state, hash, &existing, previous_sideband, verification)
        } else {
            self.process_state_transfer(tx, block, state, hash, &existing, previous_sideband, verification)
        }
    }

    fn process_epoch(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        state: &ltypes::StateBlock,
        hash: &BlockHash,
        existing: &Option<AccountInfo>,
        previous_sideband: Option<BlockSideband>,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let epoch = self.epochs.epoch(&state.link).expect("Checked as an epoch link");
        let signer = self.epochs.signer(epoch).expect("Registered epochs have signers");
        let signature_ok = match verification {
            SignatureVerification::ValidEpoch => true,
            SignatureVerification::Invalid => false,
            _ => verify(signer, block.signature(), hash),
        };
        if !signature_ok {
            return ProcessResult::BadSignature
        }
        let previous_epoch = existing.as_ref().map(|info| info.epoch).unwrap_or(Epoch::Epoch0);
        if !Epochs::is_sequential(previous_epoch, epoch) {
            return ProcessResult::BlockPosition
        }
        let previous_balance = previous_sideband.as_ref().map(|sideband| sideband.balance).unwrap_or_default();
        if state.balance != previous_balance {
            return ProcessResult::BalanceMismatch
        }
        let previous_representative =
            existing.as_ref().map(|info| info.representative).unwrap_or_else(Account::zero);
        if state.representative != previous_representative {
            return ProcessResult::RepresentativeMismatch
        }
        let details = BlockDetails {
            epoch,
            is_send: false,
            is_receive: false,
            is_epoch: true,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }
        let height = previous_sideband.as_ref().map(|sideband| sideband.height).unwrap_or_default() + 1;
        match existing {
            Some(info) => {
                self.advance_account(tx, &state.account, info, hash, info.balance, info.representative, epoch);
            }
            None => {
                // Epoch-open: establishes the account at zero balance so a
                // later receive lands in the upgraded epoch
                self.store.account_put(tx, &state.account, &AccountInfo {
                    head: *hash,
                    open_block: *hash,
                    representative: state.representative,
                    balance: Amount::zero(),
                    modified: seconds_since_epoch(),
                    block_count: 1,
                    epoch,
                });
                self.store.frontier_put(tx, hash, &state.account);
            }
        }
        self.store.block_put(tx, hash, block, &BlockSideband {
            account: state.account,
            successor: BlockHash::zero(),
            height,
            timestamp: seconds_since_epoch(),
            balance: state.balance,
            details,
        });
        ProcessResult::Progress
    }

    fn process_state_transfer(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Arc<Block>,
        state: &ltypes::StateBlock,
        hash: &BlockHash,
        existing: &Option<AccountInfo>,
        previous_sideband: Option<BlockSideband>,
        verification: SignatureVerification,
    ) -> ProcessResult {
        if verification == SignatureVerification::Invalid || !self.signature_ok(block, &state.account, verification) {
            return ProcessResult::BadSignature
        }
        let previous_balance = previous_sideband.as_ref().map(|sideband| sideband.balance).unwrap_or_default();
        let epoch = existing.as_ref().map(|info| info.epoch).unwrap_or(Epoch::Epoch0);
        let is_send = state.previous != BlockHash::zero() && state.balance < previous_balance;
        let is_receive = !is_send && !state.link.is_zero();

        let mut received_pending: Option<(PendingKey, PendingInfo)> = None;
        if is_send {
            // Handled below, after the work check
        } else if is_receive {
            if state.balance == previous_balance {
                // A receive of nothing can only be a mistyped epoch link
                return ProcessResult::UnknownEpochLink
            }
            if !self.store.block_exists(tx, &state.link) {
                return ProcessResult::GapSource
            }
            let pending_key = PendingKey::new(state.account, state.link);
            let pending = match self.store.pending_get(tx, &pending_key) {
                Some(pending) => pending,
                None => return ProcessResult::Unreceivable,
            };
            if previous_balance + pending.amount != state.balance {
                return ProcessResult::BalanceMismatch
            }
            received_pending = Some((pending_key, pending));
        } else {
            // No link, pure representative change or self-describing head
            if state.balance != previous_balance {
                return ProcessResult::BalanceMismatch
            }
            if state.previous.is_zero() {
                // Opening with neither funds nor an epoch upgrade
                return ProcessResult::GapSource
            }
        }

        let details = BlockDetails {
            epoch,
            is_send,
            is_receive,
            is_epoch: false,
        };
        if !self.constants.work_valid(&block.root(), block.work(), &details) {
            return ProcessResult::InsufficientWork
        }

        if is_send {
            let amount = previous_balance - state.balance;
            let destination = Account::from_slice(state.link.as_bytes());
            self.store.pending_put(tx, &PendingKey::new(destination, *hash), &PendingInfo {
                source: state.account,
                amount,
                epoch,
            });
        }
        if let Some((pending_key, _)) = &received_pending {
            self.store.pending_del(tx, pending_key);
        }

        // Weight moves wholesale: the previous representative loses the old
        // balance, the new one gains the new balance
        if let Some(info) = existing {
            self.rep_weights.representation_subtract(&info.representative, previous_balance);
        }
        self.rep_weights.representation_add(&state.representative, state.balance);

        let height = previous_sideband.as_ref().map(|sideband| sideband.height).unwrap_or_default() + 1;
        match existing {
            Some(info) => {
                self.advance_account(tx, &state.account, info, hash, state.balance, state.representative, epoch);
            }
            None => {
                self.store.account_put(tx, &state.account, &AccountInfo {
                    head: *hash,
                    open_block: *hash,
                    representative: state.representative,
                    balance: state.balance,
                    modified: seconds_since_epoch(),
                    block_count: 1,
                    epoch,
                });
                self.store.frontier_put(tx, hash, &state.account);
            }
        }
        self.store.block_put(tx, hash, block, &BlockSideband {
            account: state.account,
            successor: BlockHash::zero(),
            height,
            timestamp: seconds_since_epoch(),
            balance: state.balance,
            details,
        });
        ProcessResult::Progress
    }

    /// Unwinds the account chain owning `hash` from its head down to and
    /// including `hash`, restoring account, pending, frontier and weight
    /// state. Returns the removed blocks, head first. Fails without
    /// touching the transaction state when a removed send has already been
    /// received elsewhere.
    pub fn rollback(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash) -> Result<Vec<Arc<Block>>, ()> {
        let (_, target_sideband) = self.store.block_get(tx, hash).ok_or(())?;
        let account = target_sideband.account;
        let info = self.store.account_get(tx, &account).ok_or(())?;

        // Refuse when a dependent receive would be orphaned
        let mut current = info.head;
        loop {
            let (block, sideband) = self.store.block_get(tx, &current).ok_or(())?;
            if sideband.details.is_send {
                let destination = match block.as_ref() {
                    Block::Send(send) => send.destination,
                    Block::State(state) => Account::from_slice(state.link.as_bytes()),
                    _ => unreachable!(),
                };
                if !self.store.pending_exists(tx, &PendingKey::new(destination, current)) {
                    return Err(())
                }
            }
            if current == *hash {
                break
            }
            current = block.previous();
            if current.is_zero() {
                return Err(())
            }
        }

        let mut removed = Vec::new();
        let mut head = info.head;
        let mut info = info;
        loop {
            let (block, sideband) = self.store.block_get(tx, &head).expect("Walked above");
            self.undo_one(tx, &account, &block, &sideband, &mut info)?;
            removed.push(block.clone());
            self.cache.block_count.fetch_sub(1, AtomicOrdering::Relaxed);
            let done = head == *hash;
            head = block.previous();
            if done {
                break
            }
        }
        Ok(removed)
    }

    fn undo_one(
        &self,
        tx: &mut WriteTransaction<'_>,
        account: &Account,
        block: &Arc<Block>,
        sideband: &BlockSideband,
        info: &mut AccountInfo,
    ) -> Result<(), ()> {
        let hash = block.hash();
        let previous = block.previous();
        let representative = info.representative;

        if sideband.details.is_send {
            let destination = match block.as_ref() {
                Block::Send(send) => send.destination,
                Block::State(state) => Account::from_slice(state.link.as_bytes()),
                _ => unreachable!(),
            };
            let previous_balance = self.balance(tx, &previous).unwrap_or_default();
            let amount = previous_balance - sideband.balance;
            self.store.pending_del(tx, &PendingKey::new(destination, hash));
            self.rep_weights.representation_add(&representative, amount);
        } else if sideband.details.is_receive {
            let source = self.block_source(block, sideband).expect("Receives have a source");
            let source_account = self.account(tx, &source).unwrap_or_else(Account::zero);
            let previous_balance = self.balance(tx, &previous).unwrap_or_default();
            let amount = sideband.balance - previous_balance;
            self.store.pending_put(tx, &PendingKey::new(*account, source), &PendingInfo {
                source: source_account,
                amount,
                epoch: sideband.details.epoch,
            });
            self.rep_weights.representation_subtract(&representative, amount);
        }

        self.store.block_del(tx, &hash);
        self.store.frontier_del(tx, &hash);

        if previous.is_zero() {
            // Rolling back the open block removes the account. The weight it
            // carried was already returned by the receive branch above;
            // epoch-opens never carried any.
            self.store.account_del(tx, account);
            self.store.confirmation_height_del(tx, account);
        } else {
            let (_, previous_sideband) = self.store.block_get(tx, &previous).ok_or(())?;
            let previous_representative = self.representative_calculated(tx, &previous);
            // Representative changes move the whole balance back
            if representative != previous_representative {
                self.rep_weights.representation_subtract(&representative, previous_sideband.balance);
                self.rep_weights.representation_add(&previous_representative, previous_sideband.balance);
            }
            let restored = AccountInfo {
                head: previous,
                open_block: info.open_block,
                representative: previous_representative,
                balance: previous_sideband.balance,
                modified: seconds_since_epoch(),
                block_count: info.block_count - 1,
                epoch: previous_sideband.details.epoch,
            };
            self.store.account_put(tx, account, &restored);
            self.store.frontier_put(tx, &previous, account);
            self.store.block_successor_set(tx, &previous, &BlockHash::zero());
            *info = restored;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ltypes::{SendBlock, StateBlock};

    use super::*;
    use crate::testing::LedgerContext;

    #[test]
    fn genesis_holds_all_weight() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        assert_eq!(ctx.ledger.weight(&genesis), Amount::max_value());
        assert_eq!(ctx.ledger.cache.block_count.load(AtomicOrdering::Relaxed), 1);
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(ctx.ledger.block_confirmed(&tx, &ctx.ledger.genesis_block.hash()));
    }

    #[test]
    fn send_then_open_moves_funds() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        let key = LedgerContext::keypair(10);
        let amount = Amount::from(500u64);

        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), amount);
        ctx.process_ok(&send);
        assert_eq!(ctx.ledger.weight(&genesis), Amount::max_value() - amount);
        assert_eq!(ctx.process(&send), ProcessResult::Old);

        let open = ctx.legacy_open(&key, &send.hash(), *key.public());
        ctx.process_ok(&open);
        assert_eq!(ctx.balance(key.public()), amount);
        assert_eq!(ctx.ledger.weight(key.public()), amount);

        let tx = ctx.ledger.store.tx_begin_read();
        assert!(!ctx.ledger.store.pending_exists(&tx, &PendingKey::new(*key.public(), send.hash())));
        assert_eq!(ctx.ledger.account(&tx, &open.hash()), Some(*key.public()));
    }

    #[test]
    fn state_send_and_receive() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let amount = Amount::from(42u64);
        let send = ctx.state_send(&ctx.genesis_key, *key.public(), amount);
        ctx.process_ok(&send);
        let receive = ctx.state_receive(&key, &send.hash(), amount);
        ctx.process_ok(&receive);
        assert_eq!(ctx.balance(key.public()), amount);
        assert_eq!(ctx.ledger.weight(key.public()), amount);
        let tx = ctx.ledger.store.tx_begin_read();
        let (_, sideband) = ctx.ledger.store.block_get(&tx, &send.hash()).unwrap();
        assert!(sideband.details.is_send);
        let (_, sideband) = ctx.ledger.store.block_get(&tx, &receive.hash()).unwrap();
        assert!(sideband.details.is_receive);
        assert_eq!(sideband.height, 1);
    }

    #[test]
    fn second_send_with_same_previous_forks() {
        let ctx = LedgerContext::new();
        let a = LedgerContext::keypair(10);
        let b = LedgerContext::keypair(11);
        let send_a = ctx.legacy_send(&ctx.genesis_key, *a.public(), Amount::from(1u64));
        let send_b = ctx.legacy_send(&ctx.genesis_key, *b.public(), Amount::from(1u64));
        ctx.process_ok(&send_a);
        assert_eq!(ctx.process(&send_b), ProcessResult::Fork);
    }

    #[test]
    fn missing_previous_is_a_gap() {
        let ctx = LedgerContext::new();
        let work = ltypes::work_generate(&BlockHash::from_low_u64_be(999), ctx.ledger.constants.epoch_2_threshold);
        let block = Arc::new(Block::Send(SendBlock::new(
            BlockHash::from_low_u64_be(999),
            Account::from_low_u64_be(1),
            Amount::zero(),
            ctx.genesis_key.secret(),
            work,
        )));
        assert_eq!(ctx.process(&block), ProcessResult::GapPrevious);
    }

    #[test]
    fn receive_of_unknown_source_is_a_gap() {
        let ctx = LedgerContext::new();
        let receive = ctx.legacy_receive(&ctx.genesis_key, &BlockHash::from_low_u64_be(999));
        assert_eq!(ctx.process(&receive), ProcessResult::GapSource);
    }

    #[test]
    fn foreign_send_is_unreceivable() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let other = LedgerContext::keypair(11);
        // Fund and open `other` so it has a chain
        let fund = ctx.legacy_send(&ctx.genesis_key, *other.public(), Amount::from(5u64));
        ctx.process_ok(&fund);
        let open = ctx.legacy_open(&other, &fund.hash(), *other.public());
        ctx.process_ok(&open);
        // A send addressed to `key` cannot be received by `other`
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(5u64));
        ctx.process_ok(&send);
        let steal = ctx.legacy_receive(&other, &send.hash());
        assert_eq!(ctx.process(&steal), ProcessResult::Unreceivable);
    }

    #[test]
    fn overspend_is_negative() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let (head, balance) = {
            let tx = ctx.ledger.store.tx_begin_read();
            let info = ctx.ledger.store.account_get(&tx, ctx.genesis_key.public()).unwrap();
            (info.head, info.balance)
        };
        let work = ltypes::work_generate(&head, ctx.ledger.constants.epoch_2_threshold);
        let block = Arc::new(Block::Send(SendBlock::new(
            head,
            *key.public(),
            balance + Amount::from(1u64),
            ctx.genesis_key.secret(),
            work,
        )));
        assert_eq!(ctx.process(&block), ProcessResult::NegativeSpend);
    }

    #[test]
    fn wrong_key_is_a_bad_signature() {
        let ctx = LedgerContext::new();
        let wrong = LedgerContext::keypair(10);
        let (head, balance) = {
            let tx = ctx.ledger.store.tx_begin_read();
            let info = ctx.ledger.store.account_get(&tx, ctx.genesis_key.public()).unwrap();
            (info.head, info.balance)
        };
        let work = ltypes::work_generate(&head, ctx.ledger.constants.epoch_2_threshold);
        let block = Arc::new(Block::Send(SendBlock::new(
            head,
            *wrong.public(),
            balance - Amount::from(1u64),
            wrong.secret(),
            work,
        )));
        assert_eq!(ctx.process(&block), ProcessResult::BadSignature);
    }

    #[test]
    fn weak_work_is_insufficient() {
        // A ledger demanding the impossible rejects any nonce
        let constants = NetworkConstants {
            epoch_1_threshold: u64::max_value(),
            epoch_2_threshold: u64::max_value(),
            epoch_2_receive_threshold: u64::max_value(),
            ..NetworkConstants::test()
        };
        let genesis = Ledger::dev_genesis_block(&NetworkConstants::test());
        let ledger = Ledger::new(crate::store::Store::new_in_memory(), constants, Epochs::new(), genesis);
        let genesis_key = Ledger::dev_genesis_key();
        let key = LedgerContext::keypair(10);
        let tx = ledger.store.tx_begin_read();
        let info = ledger.store.account_get(&tx, genesis_key.public()).unwrap();
        drop(tx);
        let block = Arc::new(Block::Send(SendBlock::new(
            info.head,
            *key.public(),
            info.balance - Amount::from(1u64),
            genesis_key.secret(),
            0,
        )));
        let mut tx = ledger.store.tx_begin_write();
        assert_eq!(ledger.process(&mut tx, &block, SignatureVerification::Unknown), ProcessResult::InsufficientWork);
    }

    #[test]
    fn burn_account_cannot_open() {
        let ctx = LedgerContext::new();
        let send = ctx.legacy_send(&ctx.genesis_key, Account::zero(), Amount::from(1u64));
        ctx.process_ok(&send);
        let work = ltypes::work_generate(&Account::zero(), ctx.ledger.constants.epoch_2_threshold);
        let open = Arc::new(Block::Open(OpenBlock::new(
            send.hash(),
            Account::zero(),
            Account::zero(),
            ctx.genesis_key.secret(),
            work,
        )));
        assert_eq!(ctx.process(&open), ProcessResult::OpenedBurnAccount);
    }

    #[test]
    fn state_balance_mismatch() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let send = ctx.state_send(&ctx.genesis_key, *key.public(), Amount::from(10u64));
        ctx.process_ok(&send);
        // Claim one unit more than was sent
        let receive = ctx.state_receive(&key, &send.hash(), Amount::from(11u64));
        assert_eq!(ctx.process(&receive), ProcessResult::BalanceMismatch);
    }

    #[test]
    fn unrecognized_epoch_link() {
        let ctx = LedgerContext::new();
        let (head, balance) = {
            let tx = ctx.ledger.store.tx_begin_read();
            let info = ctx.ledger.store.account_get(&tx, ctx.genesis_key.public()).unwrap();
            (info.head, info.balance)
        };
        let work = ltypes::work_generate(&head, ctx.ledger.constants.epoch_2_threshold);
        let block = Arc::new(Block::State(StateBlock::new(
            *ctx.genesis_key.public(),
            head,
            *ctx.genesis_key.public(),
            balance,
            ltypes::Link::from_low_u64_be(0x5EED),
            ctx.genesis_key.secret(),
            work,
        )));
        assert_eq!(ctx.process(&block), ProcessResult::UnknownEpochLink);
    }

    #[test]
    fn epoch_upgrades_are_sequential() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        // Skipping straight to epoch 2 is out of order
        let skip = ctx.epoch_upgrade(&genesis, Epoch::Epoch2);
        assert_eq!(ctx.process(&skip), ProcessResult::BlockPosition);

        let upgrade_1 = ctx.epoch_upgrade(&genesis, Epoch::Epoch1);
        ctx.process_ok(&upgrade_1);
        {
            let tx = ctx.ledger.store.tx_begin_read();
            let info = ctx.ledger.store.account_get(&tx, &genesis).unwrap();
            assert_eq!(info.epoch, Epoch::Epoch1);
            // Weight is untouched by epoch blocks
            assert_eq!(ctx.ledger.weight(&genesis), Amount::max_value());
        }
        let again = ctx.epoch_upgrade(&genesis, Epoch::Epoch1);
        assert_eq!(ctx.process(&again), ProcessResult::BlockPosition);
        let upgrade_2 = ctx.epoch_upgrade(&genesis, Epoch::Epoch2);
        ctx.process_ok(&upgrade_2);
    }

    #[test]
    fn legacy_blocks_rejected_after_upgrade() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        let upgrade = ctx.epoch_upgrade(&genesis, Epoch::Epoch1);
        ctx.process_ok(&upgrade);
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        assert_eq!(ctx.process(&send), ProcessResult::BlockPosition);
    }

    #[test]
    fn epoch_block_must_keep_representative() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        let (head, balance) = {
            let tx = ctx.ledger.store.tx_begin_read();
            let info = ctx.ledger.store.account_get(&tx, &genesis).unwrap();
            (info.head, info.balance)
        };
        let work = ltypes::work_generate(&head, ctx.ledger.constants.epoch_2_threshold);
        let link = *ctx.ledger.epochs.link(Epoch::Epoch1).unwrap();
        let block = Arc::new(Block::State(StateBlock::new(
            genesis,
            head,
            Account::from_low_u64_be(77),
            balance,
            link,
            ctx.epoch_signer.secret(),
            work,
        )));
        assert_eq!(ctx.process(&block), ProcessResult::RepresentativeMismatch);
    }

    #[test]
    fn process_then_rollback_restores_state() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        let key = LedgerContext::keypair(10);
        let before = {
            let tx = ctx.ledger.store.tx_begin_read();
            ctx.ledger.store.account_get(&tx, &genesis).unwrap()
        };
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(5u64));
        ctx.process_ok(&send);

        let mut tx = ctx.ledger.store.tx_begin_write();
        let removed = ctx.ledger.rollback(&mut tx, &send.hash()).unwrap();
        tx.commit().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].hash(), send.hash());

        let tx = ctx.ledger.store.tx_begin_read();
        let after = ctx.ledger.store.account_get(&tx, &genesis).unwrap();
        assert_eq!(after.head, before.head);
        assert_eq!(after.balance, before.balance);
        assert_eq!(after.block_count, before.block_count);
        assert_eq!(after.epoch, before.epoch);
        assert!(!ctx.ledger.block_exists(&tx, &send.hash()));
        assert!(!ctx.ledger.store.pending_exists(&tx, &PendingKey::new(*key.public(), send.hash())));
        assert_eq!(ctx.ledger.weight(&genesis), Amount::max_value());
    }

    #[test]
    fn rollback_refuses_when_send_was_received() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(5u64));
        ctx.process_ok(&send);
        let open = ctx.legacy_open(&key, &send.hash(), *key.public());
        ctx.process_ok(&open);
        let mut tx = ctx.ledger.store.tx_begin_write();
        assert!(ctx.ledger.rollback(&mut tx, &send.hash()).is_err());
    }

    #[test]
    fn rollback_of_receive_restores_pending() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let send = ctx.state_send(&ctx.genesis_key, *key.public(), Amount::from(7u64));
        ctx.process_ok(&send);
        let receive = ctx.state_receive(&key, &send.hash(), Amount::from(7u64));
        ctx.process_ok(&receive);

        let mut tx = ctx.ledger.store.tx_begin_write();
        let removed = ctx.ledger.rollback(&mut tx, &receive.hash()).unwrap();
        tx.commit().unwrap();
        assert_eq!(removed.len(), 1);
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(ctx.ledger.store.pending_exists(&tx, &PendingKey::new(*key.public(), send.hash())));
        // The open block was the only block, so the account is gone again
        assert!(ctx.ledger.store.account_get(&tx, key.public()).is_none());
        assert_eq!(ctx.ledger.weight(key.public()), Amount::zero());
    }

    #[test]
    fn change_moves_weight() {
        let ctx = LedgerContext::new();
        let genesis = *ctx.genesis_key.public();
        let rep = Account::from_low_u64_be(55);
        let change = ctx.legacy_change(&ctx.genesis_key, rep);
        ctx.process_ok(&change);
        assert_eq!(ctx.ledger.weight(&genesis), Amount::zero());
        assert_eq!(ctx.ledger.weight(&rep), Amount::max_value());

        let mut tx = ctx.ledger.store.tx_begin_write();
        ctx.ledger.rollback(&mut tx, &change.hash()).unwrap();
        tx.commit().unwrap();
        assert_eq!(ctx.ledger.weight(&genesis), Amount::max_value());
        assert_eq!(ctx.ledger.weight(&rep), Amount::zero());
    }
}
