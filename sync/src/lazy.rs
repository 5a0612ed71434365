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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use ltypes::{Account, Amount, Block, BlockHash, HashOrAccount, Link};
use parking_lot::Mutex;

use crate::attempt::{BootstrapAttempt, BootstrapStrategy, BATCH_READ_SIZE, LAZY_MAX_PULL_BLOCKS};
use crate::connections::{BootstrapConnections, PullInfo};

/// A state block whose previous balance was unknown when it streamed past;
/// its link is classified once the previous block shows up
#[derive(Debug, Clone)]
struct LazyStateBacklogItem {
    link: Link,
    balance: Amount,
    retry_limit: u32,
}

struct LazyState {
    /// Hashes already handed to the block processor this attempt
    lazy_blocks: HashSet<BlockHash>,
    lazy_pulls: VecDeque<(HashOrAccount, u32)>,
    lazy_keys: HashSet<BlockHash>,
    lazy_state_backlog: HashMap<BlockHash, LazyStateBacklogItem>,
    lazy_balances: HashMap<BlockHash, Amount>,
    /// Accounts receiving many of the discovered sends, pulled as whole
    /// chains once the hash chase drains
    lazy_destinations: HashMap<Account, u64>,
    lazy_destinations_flushed: bool,
}

/// Hash-chasing catch-up: seeded with one block hash, pulls it, inspects
/// the arriving blocks and keeps pulling every link they reference until
/// the graph closes or the attempt expires.
pub struct LazyAttempt {
    base: BootstrapAttempt,
    state: Mutex<LazyState>,
}

impl LazyAttempt {
    pub fn new(base: BootstrapAttempt, start: HashOrAccount) -> LazyAttempt {
        let mut lazy_pulls = VecDeque::new();
        let retry_limit = base.config.bootstrap_pull_retry_limit;
        lazy_pulls.push_back((start, retry_limit));
        let mut lazy_keys = HashSet::new();
        lazy_keys.insert(start);
        LazyAttempt {
            base,
            state: Mutex::new(LazyState {
                lazy_blocks: HashSet::new(),
                lazy_pulls,
                lazy_keys,
                lazy_state_backlog: HashMap::new(),
                lazy_balances: HashMap::new(),
                lazy_destinations: HashMap::new(),
                lazy_destinations_flushed: false,
            }),
        }
    }

    pub fn lazy_blocks_processed(&self, hash: &BlockHash) -> bool {
        self.state.lock().lazy_blocks.contains(hash)
    }

    pub fn has_expired(&self) -> bool {
        self.base.attempt_start.elapsed() > self.base.config.bootstrap_lazy_max_time
    }

    fn lazy_add(state: &mut LazyState, hash_or_account: HashOrAccount, retry_limit: u32) {
        if !state.lazy_blocks.contains(&hash_or_account) {
            state.lazy_pulls.push_back((hash_or_account, retry_limit));
        }
    }

    /// Classifies a state block's link once the previous balance is known:
    /// lower balance is a send toward a destination account, anything else
    /// with a link chases the source
    fn classify_link(&self, state: &mut LazyState, link: Link, balance: Amount, previous_balance: Amount, retry_limit: u32) {
        if link.is_zero() || self.base.ledger.epochs.is_epoch_link(&link) {
            return
        }
        if balance < previous_balance {
            let destination = Account::from_slice(link.as_bytes());
            *state.lazy_destinations.entry(destination).or_insert(0) += 1;
        } else {
            Self::lazy_add(state, link, retry_limit);
        }
    }

    /// Drains queued lazy pulls into the shared connections queue
    fn lazy_pull_flush(self: &Arc<Self>, connections: &Arc<BootstrapConnections>) {
        let batch: Vec<(HashOrAccount, u32)> = {
            let mut state = self.state.lock();
            let count = state.lazy_pulls.len().min(BATCH_READ_SIZE);
            state.lazy_pulls.drain(..count).collect()
        };
        if batch.is_empty() {
            return
        }
        let strategy: Arc<dyn BootstrapStrategy> = Arc::clone(self) as Arc<dyn BootstrapStrategy>;
        let tx = self.base.ledger.store.tx_begin_read();
        for (hash_or_account, retry_limit) in batch {
            if self.lazy_blocks_processed(&hash_or_account) || self.base.ledger.block_exists(&tx, &hash_or_account) {
                continue
            }
            let pull = PullInfo::new(
                hash_or_account,
                BlockHash::zero(),
                BlockHash::zero(),
                LAZY_MAX_PULL_BLOCKS,
                retry_limit,
                self.base.incremental_id,
            );
            connections.add_pull(pull, Arc::clone(&strategy));
        }
    }

    /// Re-examines backlog entries whose previous block has since landed
    fn lazy_backlog_cleanup(&self) {
        let tx = self.base.ledger.store.tx_begin_read();
        let mut state = self.state.lock();
        let resolved: Vec<(BlockHash, LazyStateBacklogItem)> = state
            .lazy_state_backlog
            .iter()
            .filter(|(previous, _)| self.base.ledger.block_exists(&tx, previous))
            .map(|(previous, item)| (*previous, item.clone()))
            .collect();
        for (previous, item) in resolved {
            if let Some(previous_balance) = self.base.ledger.balance(&tx, &previous) {
                self.classify_link(&mut state, item.link, item.balance, previous_balance, item.retry_limit);
            }
            state.lazy_state_backlog.remove(&previous);
        }
    }

    /// Converts the busiest destination accounts into whole-chain pulls
    fn lazy_destinations_flush(self: &Arc<Self>, connections: &Arc<BootstrapConnections>) -> bool {
        let destinations: Vec<Account> = {
            let mut state = self.state.lock();
            if state.lazy_destinations_flushed || state.lazy_destinations.is_empty() {
                return false
            }
            state.lazy_destinations_flushed = true;
            let mut ordered: Vec<(Account, u64)> = state.lazy_destinations.drain().collect();
            ordered.sort_by(|a, b| b.1.cmp(&a.1));
            ordered.into_iter().take(BATCH_READ_SIZE).map(|(account, _)| account).collect()
        };
        let strategy: Arc<dyn BootstrapStrategy> = Arc::clone(self) as Arc<dyn BootstrapStrategy>;
        let produced = !destinations.is_empty();
        for account in destinations {
            let pull = PullInfo::new(
                account,
                BlockHash::zero(),
                BlockHash::zero(),
                LAZY_MAX_PULL_BLOCKS,
                self.base.config.bootstrap_pull_retry_limit,
                self.base.incremental_id,
            );
            connections.add_pull(pull, Arc::clone(&strategy));
        }
        produced
    }

    fn lazy_finished(&self) -> bool {
        if self.base.stopped() {
            return true
        }
        let state = self.state.lock();
        state.lazy_pulls.is_empty() && !self.base.still_pulling() && state.lazy_state_backlog.is_empty()
    }
}

impl BootstrapStrategy for LazyAttempt {
    fn attempt(&self) -> &BootstrapAttempt {
        &self.base
    }

    fn mode_text(&self) -> &'static str {
        "lazy"
    }

    fn lazy_start(&self, hash: &HashOrAccount) {
        let mut state = self.state.lock();
        if state.lazy_keys.insert(*hash) {
            state.lazy_pulls.push_back((*hash, self.base.config.bootstrap_pull_retry_limit));
        }
    }

    fn run(self: Arc<Self>, connections: Arc<BootstrapConnections>) {
        connections.attempt_started();
        self.base.started.store(true, AtomicOrdering::SeqCst);
        loop {
            if self.base.stopped() {
                break
            }
            if self.has_expired() {
                linfo!(SYNC, "Lazy bootstrap attempt {} expired", self.base.id);
                break
            }
            self.lazy_pull_flush(&connections);
            self.lazy_backlog_cleanup();
            if self.lazy_finished() {
                // The chase is dry; sweep the destination accounts once
                if !self.lazy_destinations_flush(&connections) {
                    break
                }
            }
            let mut guard = self.base.mutex.lock();
            self.base.condition.wait_for(&mut guard, Duration::from_millis(20));
        }
        self.base.block_processor.flush();
        connections.attempt_stopped();
        linfo!(
            SYNC,
            "Lazy bootstrap attempt {} finished after {} blocks in {:.1}s",
            self.base.id,
            self.base.total_blocks.load(AtomicOrdering::Relaxed),
            self.base.attempt_start.elapsed().as_secs_f64()
        );
    }

    fn process_block(
        &self,
        block: Arc<Block>,
        _known_account: &Account,
        pull_blocks: u64,
        max_blocks: u32,
        block_expected: bool,
        retry_limit: u32,
    ) -> bool {
        if !block_expected {
            return false
        }
        let hash = block.hash();
        let mut state = self.state.lock();
        if state.lazy_blocks.contains(&hash) {
            return false
        }
        {
            let tx = self.base.ledger.store.tx_begin_read();
            if self.base.ledger.block_exists(&tx, &hash) {
                // Crossed into territory the ledger already has
                return true
            }
        }
        state.lazy_blocks.insert(hash);
        self.base.block_processor.add(Arc::clone(&block));

        match block.as_ref() {
            Block::State(state_block) => {
                let previous_known = if state_block.previous.is_zero() {
                    Some(Amount::zero())
                } else if let Some(balance) = state.lazy_balances.get(&state_block.previous).copied() {
                    Some(balance)
                } else {
                    let tx = self.base.ledger.store.tx_begin_read();
                    self.base.ledger.balance(&tx, &state_block.previous)
                };
                match previous_known {
                    Some(previous_balance) => {
                        self.classify_link(&mut state, state_block.link, state_block.balance, previous_balance, retry_limit);
                        state.lazy_balances.remove(&state_block.previous);
                    }
                    None => {
                        state.lazy_state_backlog.insert(state_block.previous, LazyStateBacklogItem {
                            link: state_block.link,
                            balance: state_block.balance,
                            retry_limit,
                        });
                    }
                }
                state.lazy_balances.insert(hash, state_block.balance);
                // A child may have been waiting for this block's balance
                if let Some(waiting) = state.lazy_state_backlog.remove(&hash) {
                    self.classify_link(&mut state, waiting.link, waiting.balance, state_block.balance, waiting.retry_limit);
                }
            }
            Block::Receive(receive) => {
                Self::lazy_add(&mut state, receive.source, retry_limit);
            }
            Block::Open(open) => {
                Self::lazy_add(&mut state, open.source, retry_limit);
            }
            Block::Send(send) => {
                *state.lazy_destinations.entry(send.destination).or_insert(0) += 1;
            }
            Block::Change(_) => {}
        }

        let over_limit = max_blocks != 0 && pull_blocks >= u64::from(max_blocks);
        if over_limit && !block.previous().is_zero() {
            // Continue the truncated chain with a fresh pull
            Self::lazy_add(&mut state, block.previous(), retry_limit);
        }
        over_limit
    }

    fn pull_dropped(&self, pull: &PullInfo) {
        ldebug!(SYNC, "Lazy attempt {} abandoned pull of {:?}", self.base.id, pull.account_or_head);
    }
}
