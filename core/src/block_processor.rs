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

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use ltypes::{Account, Block, SignatureVerification, UncheckedInfo};
use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;
use crate::gap_cache::GapCache;
use crate::ledger::{seconds_since_epoch, Ledger, ProcessResult};
use crate::signatures::{SignatureChecker, VERIFICATION_VALID};
use crate::state_block_signature_verification::StateBlockSignatureVerification;
use crate::store::WriteTransaction;
use crate::write_queue::{WriteDatabaseQueue, Writer};

pub type BlockObserver = Box<dyn Fn(&Arc<Block>) + Send + Sync>;

/// Observer lists are wired once while the node is assembled and read-only
/// afterwards, so notification never takes a lock.
#[derive(Default)]
pub struct BlockProcessorObservers {
    /// Fired after commit for every block that progressed, in commit order
    pub block_processed: Vec<BlockObserver>,
    /// Fired for blocks that lost to an existing one with the same root
    pub fork: Vec<BlockObserver>,
}

struct State {
    blocks: VecDeque<UncheckedInfo>,
    forced: VecDeque<Arc<Block>>,
    stopped: bool,
    active: bool,
}

struct Shared {
    ledger: Arc<Ledger>,
    write_queue: Arc<WriteDatabaseQueue>,
    gap_cache: Arc<GapCache>,
    config: NodeConfig,
    state: Mutex<State>,
    condition: Condvar,
    observers: Mutex<Option<BlockProcessorObservers>>,
    next_log: Mutex<Instant>,
}

impl Shared {
    fn have_blocks(state: &State) -> bool {
        !state.blocks.is_empty() || !state.forced.is_empty()
    }
}

/// Serialized ledger writer. Processing blocks is a potentially long write
/// operation, isolated here so network servicing never blocks on the store.
pub struct BlockProcessor {
    shared: Arc<Shared>,
    verification: StateBlockSignatureVerification,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        write_queue: Arc<WriteDatabaseQueue>,
        gap_cache: Arc<GapCache>,
        checker: Arc<SignatureChecker>,
        config: NodeConfig,
    ) -> Arc<BlockProcessor> {
        let shared = Arc::new(Shared {
            ledger: Arc::clone(&ledger),
            write_queue,
            gap_cache,
            config: config.clone(),
            state: Mutex::new(State {
                blocks: VecDeque::new(),
                forced: VecDeque::new(),
                stopped: false,
                active: false,
            }),
            condition: Condvar::new(),
            observers: Mutex::new(Some(BlockProcessorObservers::default())),
            next_log: Mutex::new(Instant::now()),
        });
        let verification =
            StateBlockSignatureVerification::new(checker, Arc::clone(&ledger.epochs), config.block_processor_verification_size);
        {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            verification.set_blocks_verified_callback(Box::new(move |items, verifications, _hashes, _signatures| {
                if let Some(shared) = weak.upgrade() {
                    Self::process_verified_state_blocks(&shared, items, verifications);
                }
            }));
        }
        {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            verification.set_transition_inactive_callback(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.condition.notify_all();
                }
            }));
        }
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("blck processing".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        Arc::new(BlockProcessor {
            shared,
            verification,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Must be called before `start` finishes wiring; observers are
    /// immutable afterwards
    pub fn set_observers(&self, observers: BlockProcessorObservers) {
        *self.shared.observers.lock() = Some(observers);
    }

    pub fn add(&self, block: Arc<Block>) {
        let info = UncheckedInfo::new(block, Account::zero(), seconds_since_epoch(), SignatureVerification::Unknown);
        self.add_unchecked_info(info);
    }

    pub fn add_unchecked_info(&self, info: UncheckedInfo) {
        if self.full() {
            ltrace!(PROCESS, "Block processor queue is full, dropping {:?}", info.block.hash());
            return
        }
        let is_state = matches!(info.block.as_ref(), Block::State(_));
        if is_state && info.verified == SignatureVerification::Unknown {
            self.verification.add(info);
            return
        }
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            state.blocks.push_back(info);
        }
        self.shared.condition.notify_all();
    }

    /// Bypasses deduplication and takes priority over queued blocks;
    /// used to apply fork resolutions
    pub fn force(&self, block: Arc<Block>) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            state.forced.push_front(block);
        }
        self.shared.condition.notify_all();
    }

    pub fn size(&self) -> usize {
        let state = self.shared.state.lock();
        state.blocks.len() + state.forced.len() + self.verification.size()
    }

    pub fn full(&self) -> bool {
        self.size() >= self.shared.config.block_processor_full_size
    }

    pub fn half_full(&self) -> bool {
        self.size() >= self.shared.config.block_processor_full_size / 2
    }

    /// Waits until the verifier and both queues drain
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !state.stopped
            && (state.active
                || Shared::have_blocks(&state)
                || self.verification.size() > 0
                || self.verification.is_active())
        {
            self.shared.condition.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.condition.notify_all();
        self.verification.stop();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().unwrap();
        }
    }

    fn process_verified_state_blocks(shared: &Arc<Shared>, items: Vec<UncheckedInfo>, verifications: Vec<i8>) {
        debug_assert_eq!(items.len(), verifications.len());
        {
            let mut state = shared.state.lock();
            for (mut info, verification) in items.into_iter().zip(verifications) {
                info.verified = if verification == VERIFICATION_VALID {
                    let is_epoch = match info.block.as_ref() {
                        Block::State(block) => shared.ledger.epochs.is_epoch_link(&block.link),
                        _ => false,
                    };
                    if is_epoch {
                        SignatureVerification::ValidEpoch
                    } else {
                        SignatureVerification::Valid
                    }
                } else {
                    SignatureVerification::Invalid
                };
                state.blocks.push_back(info);
            }
        }
        shared.condition.notify_all();
    }

    fn run(shared: &Arc<Shared>) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if Shared::have_blocks(&state) {
                state.active = true;
                drop(state);
                Self::process_batch(shared);
                state = shared.state.lock();
                state.active = false;
                shared.condition.notify_all();
            } else {
                shared.condition.wait(&mut state);
            }
        }
    }

    fn should_log(shared: &Shared) -> bool {
        let mut next_log = shared.next_log.lock();
        if *next_log <= Instant::now() {
            *next_log = Instant::now() + shared.config.log_interval;
            true
        } else {
            false
        }
    }

    fn process_batch(shared: &Arc<Shared>) {
        let _grant = shared.write_queue.wait(Writer::ProcessBatch);
        let mut tx = shared.ledger.store.tx_begin_write();
        let timer = Instant::now();
        // Fired only after the batch commits
        let mut post_events: Vec<(ProcessResult, Arc<Block>)> = Vec::new();
        let mut processed = 0usize;

        loop {
            let (info, forced) = {
                let mut state = shared.state.lock();
                if !Shared::have_blocks(&state) || timer.elapsed() > shared.config.block_processor_batch_max_time {
                    if timer.elapsed() > shared.config.block_processor_batch_max_time && Self::should_log(shared) {
                        linfo!(
                            PROCESS,
                            "{} blocks and {} forced in processing queue after batch of {}",
                            state.blocks.len(),
                            state.forced.len(),
                            processed
                        );
                    }
                    break
                }
                match state.forced.pop_front() {
                    Some(block) => (
                        UncheckedInfo::new(block, Account::zero(), seconds_since_epoch(), SignatureVerification::Unknown),
                        true,
                    ),
                    None => (state.blocks.pop_front().expect("Checked nonempty"), false),
                }
            };
            if forced {
                Self::rollback_competitor(shared, &mut tx, &info.block);
            }
            let result = Self::process_one(shared, &mut tx, &info);
            processed += 1;
            match result {
                ProcessResult::Progress => {
                    post_events.push((result, Arc::clone(&info.block)));
                }
                ProcessResult::Fork => {
                    post_events.push((result, Arc::clone(&info.block)));
                }
                _ => {}
            }
        }

        tx.commit().expect("Failed to commit a block processor batch");
        drop(_grant);

        let observers = shared.observers.lock();
        let observers = observers.as_ref().expect("Observers are wired at startup");
        for (result, block) in post_events {
            match result {
                ProcessResult::Progress => {
                    for observer in &observers.block_processed {
                        observer(&block);
                    }
                }
                ProcessResult::Fork => {
                    for observer in &observers.fork {
                        observer(&block);
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    /// Forced blocks replace whatever currently occupies their root
    fn rollback_competitor(shared: &Arc<Shared>, tx: &mut WriteTransaction<'_>, block: &Arc<Block>) {
        let hash = block.hash();
        let competitor = if block.previous().is_zero() {
            block
                .account_field()
                .and_then(|account| shared.ledger.store.account_get(&*tx, &account))
                .map(|info| info.open_block)
        } else {
            shared.ledger.store.block_get(&*tx, &block.previous()).map(|(_, sideband)| sideband.successor)
        };
        if let Some(competitor) = competitor.filter(|competitor| !competitor.is_zero() && *competitor != hash) {
            linfo!(PROCESS, "Rolling back {:?} to process forked {:?}", competitor, hash);
            match shared.ledger.rollback(tx, &competitor) {
                Ok(removed) => {
                    for removed_block in removed {
                        shared.gap_cache.erase(&removed_block.hash());
                    }
                }
                Err(()) => {
                    lerror!(PROCESS, "Failed to roll back {:?} while processing a fork", competitor);
                }
            }
        }
    }

    fn process_one(shared: &Arc<Shared>, tx: &mut WriteTransaction<'_>, info: &UncheckedInfo) -> ProcessResult {
        let block = &info.block;
        let hash = block.hash();
        let result = shared.ledger.process(tx, block, info.verified);
        match result {
            ProcessResult::Progress => {
                ltrace!(PROCESS, "Processed {:?}", hash);
                shared.gap_cache.erase(&hash);
                Self::queue_unchecked(shared, tx, &hash);
            }
            ProcessResult::GapPrevious => {
                ltrace!(PROCESS, "Gap previous for {:?}", hash);
                let mut stored = info.clone();
                stored.modified = seconds_since_epoch();
                shared.ledger.store.unchecked_put(
                    tx,
                    &block.previous(),
                    &stored,
                    shared.config.unchecked_per_dependency_max,
                );
                shared.gap_cache.add(&hash, Instant::now());
            }
            ProcessResult::GapSource => {
                ltrace!(PROCESS, "Gap source for {:?}", hash);
                let source = match block.as_ref() {
                    Block::State(state) => state.link,
                    _ => block.source().unwrap_or_default(),
                };
                let mut stored = info.clone();
                stored.modified = seconds_since_epoch();
                shared.ledger.store.unchecked_put(tx, &source, &stored, shared.config.unchecked_per_dependency_max);
                shared.gap_cache.add(&hash, Instant::now());
            }
            ProcessResult::Old => {
                ltrace!(PROCESS, "Old block {:?}", hash);
            }
            ProcessResult::Fork => {
                ltrace!(PROCESS, "Fork for {:?} at root {:?}", hash, block.root());
            }
            ProcessResult::BadSignature
            | ProcessResult::NegativeSpend
            | ProcessResult::Unreceivable
            | ProcessResult::BlockPosition
            | ProcessResult::InsufficientWork
            | ProcessResult::OpenedBurnAccount
            | ProcessResult::BalanceMismatch
            | ProcessResult::RepresentativeMismatch
            | ProcessResult::UnknownEpochLink => {
                ltrace!(PROCESS, "Dropping {:?}: {:?}", hash, result);
            }
        }
        result
    }

    /// Requeues blocks that were waiting on `hash`
    fn queue_unchecked(shared: &Arc<Shared>, tx: &mut WriteTransaction<'_>, hash: &ltypes::BlockHash) {
        let dependents = shared.ledger.store.unchecked_get(&*tx, hash);
        if dependents.is_empty() {
            return
        }
        shared.ledger.store.unchecked_del(tx, hash);
        let mut state = shared.state.lock();
        for dependent in dependents {
            shared.gap_cache.erase(&dependent.block.hash());
            state.blocks.push_back(dependent);
        }
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        let stopped = self.shared.state.lock().stopped;
        if !stopped {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use ltypes::Amount;

    use super::*;
    use crate::online_reps::OnlineReps;
    use crate::testing::LedgerContext;

    struct Fixture {
        ctx: LedgerContext,
        processor: Arc<BlockProcessor>,
    }

    fn build() -> (Fixture, std::sync::mpsc::Receiver<Arc<Block>>, std::sync::mpsc::Receiver<Arc<Block>>) {
        let ctx = LedgerContext::new();
        let config = NodeConfig::test_default();
        let write_queue = Arc::new(WriteDatabaseQueue::new());
        let online_reps =
            Arc::new(OnlineReps::new(Arc::clone(&ctx.ledger), config.online_weight_minimum, config.max_weight_samples));
        let alarm = Arc::new(ltimer::Alarm::new());
        let gap_cache =
            Arc::new(GapCache::new(Arc::clone(&ctx.ledger), online_reps, alarm, config.clone()));
        let checker = Arc::new(SignatureChecker::new(0));
        let processor = BlockProcessor::new(Arc::clone(&ctx.ledger), write_queue, gap_cache, checker, config);
        let (processed_sender, processed_receiver) = channel();
        let (fork_sender, fork_receiver) = channel();
        processor.set_observers(BlockProcessorObservers {
            block_processed: vec![Box::new(move |block: &Arc<Block>| {
                let _ = processed_sender.send(Arc::clone(block));
            })],
            fork: vec![Box::new(move |block: &Arc<Block>| {
                let _ = fork_sender.send(Arc::clone(block));
            })],
        });
        (
            Fixture {
                ctx,
                processor,
            },
            processed_receiver,
            fork_receiver,
        )
    }

    #[test]
    fn processes_a_live_block() {
        let (fixture, processed, _) = build();
        let key = LedgerContext::keypair(10);
        let send = fixture.ctx.legacy_send(&fixture.ctx.genesis_key, *key.public(), Amount::from(1u64));
        fixture.processor.add(Arc::clone(&send));
        let seen = processed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.hash(), send.hash());
        fixture.processor.flush();
        let tx = fixture.ctx.ledger.store.tx_begin_read();
        assert!(fixture.ctx.ledger.block_exists(&tx, &send.hash()));
        fixture.processor.stop();
    }

    #[test]
    fn state_blocks_pass_through_the_verifier() {
        let (fixture, processed, _) = build();
        let key = LedgerContext::keypair(10);
        let send = fixture.ctx.state_send(&fixture.ctx.genesis_key, *key.public(), Amount::from(5u64));
        fixture.processor.add(Arc::clone(&send));
        let seen = processed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.hash(), send.hash());
        fixture.processor.stop();
    }

    #[test]
    fn dependent_blocks_wait_in_unchecked_until_the_gap_fills() {
        let (fixture, processed, _) = build();
        let ctx = &fixture.ctx;
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(3u64));
        let open = ctx.legacy_open(&key, &send.hash(), *key.public());

        // Arrives before its source exists
        fixture.processor.add(Arc::clone(&open));
        fixture.processor.flush();
        {
            let tx = ctx.ledger.store.tx_begin_read();
            assert!(!ctx.ledger.block_exists(&tx, &open.hash()));
            assert_eq!(ctx.ledger.store.unchecked_get(&tx, &send.hash()).len(), 1);
        }

        fixture.processor.add(Arc::clone(&send));
        let first = processed.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = processed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.hash(), send.hash());
        assert_eq!(second.hash(), open.hash());
        fixture.processor.flush();
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(ctx.ledger.block_exists(&tx, &open.hash()));
        assert!(ctx.ledger.store.unchecked_get(&tx, &send.hash()).is_empty());
        fixture.processor.stop();
    }

    #[test]
    fn competing_block_reports_a_fork() {
        let (fixture, processed, forks) = build();
        let ctx = &fixture.ctx;
        let a = LedgerContext::keypair(10);
        let b = LedgerContext::keypair(11);
        let send_a = ctx.legacy_send(&ctx.genesis_key, *a.public(), Amount::from(1u64));
        let send_b = ctx.legacy_send(&ctx.genesis_key, *b.public(), Amount::from(1u64));
        fixture.processor.add(Arc::clone(&send_a));
        processed.recv_timeout(Duration::from_secs(5)).unwrap();
        fixture.processor.add(Arc::clone(&send_b));
        let fork = forks.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fork.hash(), send_b.hash());
        fixture.processor.stop();
    }

    #[test]
    fn force_rolls_back_the_competitor() {
        let (fixture, processed, _) = build();
        let ctx = &fixture.ctx;
        let a = LedgerContext::keypair(10);
        let send_a = ctx.legacy_send(&ctx.genesis_key, *a.public(), Amount::from(1u64));
        // Build the competitor against the same head before A lands
        let b = LedgerContext::keypair(11);
        let send_b = ctx.legacy_send(&ctx.genesis_key, *b.public(), Amount::from(2u64));

        fixture.processor.add(Arc::clone(&send_a));
        processed.recv_timeout(Duration::from_secs(5)).unwrap();

        fixture.processor.force(Arc::clone(&send_b));
        let replacement = processed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(replacement.hash(), send_b.hash());
        fixture.processor.flush();
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(!ctx.ledger.block_exists(&tx, &send_a.hash()));
        assert!(ctx.ledger.block_exists(&tx, &send_b.hash()));
        fixture.processor.stop();
    }

    #[test]
    fn flush_waits_for_queue_drain() {
        let (fixture, _processed, _) = build();
        let ctx = &fixture.ctx;
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..8u64 {
            let key = LedgerContext::keypair(100 + i);
            let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
            // Process immediately so the factory sees each new head
            fixture.processor.add(Arc::clone(&send));
            fixture.processor.flush();
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        }
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 8);
        let tx = ctx.ledger.store.tx_begin_read();
        let info = ctx.ledger.store.account_get(&tx, ctx.genesis_key.public()).unwrap();
        assert_eq!(info.block_count, 9);
        fixture.processor.stop();
    }
}
