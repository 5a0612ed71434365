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

mod bounded;
mod unbounded;

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::thread;

use linked_hash_map::LinkedHashMap;
use ltypes::{Block, BlockHash};
use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::write_queue::WriteDatabaseQueue;

use self::bounded::BoundedMode;
use self::unbounded::UnboundedMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationHeightMode {
    Automatic,
    Unbounded,
    Bounded,
}

pub type CementedObserver = Box<dyn Fn(&Arc<Block>) + Send + Sync>;
pub type AlreadyCementedObserver = Box<dyn Fn(&BlockHash) + Send + Sync>;

/// Bundled notification closures handed to whichever walker runs a
/// candidate; both fire outside any lock
pub(crate) struct CementCallbacks<'a> {
    pub cemented: &'a dyn Fn(&Arc<Block>),
    pub already_cemented: &'a dyn Fn(&BlockHash),
}

struct State {
    awaiting: LinkedHashMap<BlockHash, ()>,
    original_hash: BlockHash,
    paused: bool,
    stopped: bool,
}

struct Shared {
    ledger: Arc<Ledger>,
    config: NodeConfig,
    mode: ConfirmationHeightMode,
    bounded: BoundedMode,
    unbounded: UnboundedMode,
    state: Mutex<State>,
    condition: Condvar,
    // Observers are wired during node construction, then read-only
    cemented_observers: Mutex<Vec<CementedObserver>>,
    already_cemented_observers: Mutex<Vec<AlreadyCementedObserver>>,
}

/// Consumes candidate hashes committed by the block processor or elections
/// and advances per-account confirmation heights, monotonically and
/// prefix-closed, notifying observers once per newly cemented block in
/// ascending height order.
pub struct ConfirmationHeightProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConfirmationHeightProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        write_queue: Arc<WriteDatabaseQueue>,
        config: NodeConfig,
        mode: ConfirmationHeightMode,
    ) -> ConfirmationHeightProcessor {
        let shared = Arc::new(Shared {
            bounded: BoundedMode::new(
                Arc::clone(&ledger),
                Arc::clone(&write_queue),
                config.conf_height_batch_write_size,
                config.conf_height_target_write_time,
            ),
            unbounded: UnboundedMode::new(Arc::clone(&ledger), write_queue),
            ledger,
            config,
            mode,
            state: Mutex::new(State {
                awaiting: LinkedHashMap::new(),
                original_hash: BlockHash::zero(),
                paused: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            cemented_observers: Mutex::new(Vec::new()),
            already_cemented_observers: Mutex::new(Vec::new()),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("conf height".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        ConfirmationHeightProcessor {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn add_cemented_observer(&self, observer: CementedObserver) {
        self.shared.cemented_observers.lock().push(observer);
    }

    pub fn add_block_already_cemented_observer(&self, observer: AlreadyCementedObserver) {
        self.shared.already_cemented_observers.lock().push(observer);
    }

    pub fn add(&self, hash: BlockHash) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            state.awaiting.insert(hash, ());
        }
        self.shared.condition.notify_all();
    }

    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn unpause(&self) {
        self.shared.state.lock().paused = false;
        self.shared.condition.notify_all();
    }

    pub fn awaiting_processing_len(&self) -> usize {
        self.shared.state.lock().awaiting.len()
    }

    pub fn is_processing_block(&self, hash: &BlockHash) -> bool {
        let state = self.shared.state.lock();
        state.original_hash == *hash || state.awaiting.contains_key(hash)
    }

    pub fn current(&self) -> BlockHash {
        self.shared.state.lock().original_hash
    }

    /// Waits until every queued candidate has been walked
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !state.stopped && (!state.awaiting.is_empty() || !state.original_hash.is_zero()) {
            self.shared.condition.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().unwrap();
        }
    }

    fn run(shared: &Arc<Shared>) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if state.paused {
                shared.condition.wait(&mut state);
                continue
            }
            let next = state.awaiting.pop_front().map(|(hash, ())| hash);
            match next {
                Some(hash) => {
                    state.original_hash = hash;
                    drop(state);
                    Self::process_candidate(shared, &hash);
                    state = shared.state.lock();
                    state.original_hash = BlockHash::zero();
                    shared.condition.notify_all();
                }
                None => {
                    shared.condition.notify_all();
                    shared.condition.wait(&mut state);
                }
            }
        }
    }

    fn process_candidate(shared: &Arc<Shared>, hash: &BlockHash) {
        let cemented_observers = shared.cemented_observers.lock();
        let already_observers = shared.already_cemented_observers.lock();
        let cemented = |block: &Arc<Block>| {
            for observer in cemented_observers.iter() {
                observer(block);
            }
        };
        let already = |hash: &BlockHash| {
            for observer in already_observers.iter() {
                observer(hash);
            }
        };
        let callbacks = CementCallbacks {
            cemented: &cemented,
            already_cemented: &already,
        };

        // The store failure contract: roll back, retry the candidate once,
        // abort the process when the second attempt fails too
        for attempt in 0..2 {
            if Self::walk(shared, hash, &callbacks).is_ok() {
                return
            }
            lerror!(CONFIRM, "Attempt {} to cement {:?} failed, the write was rolled back", attempt + 1, hash);
        }
        panic!("Cementing failed twice, refusing to continue with an inconsistent store");
    }

    fn walk(shared: &Arc<Shared>, hash: &BlockHash, callbacks: &CementCallbacks<'_>) -> Result<(), ()> {
        match shared.mode {
            ConfirmationHeightMode::Bounded => shared.bounded.process(hash, callbacks),
            ConfirmationHeightMode::Unbounded => shared.unbounded.process(hash, callbacks),
            ConfirmationHeightMode::Automatic => {
                // Few uncemented blocks suggest short, wide chains where the
                // in-memory walker wins; deep backlogs stream through the
                // bounded walker instead. Walkers keep no cross-candidate
                // state, so switching between candidates is always safe.
                let block_count = shared.ledger.cache.block_count.load(AtomicOrdering::Relaxed);
                let cemented_count = shared.ledger.cache.cemented_count.load(AtomicOrdering::Relaxed);
                let backlog = block_count.saturating_sub(cemented_count);
                if backlog < shared.config.conf_height_unbounded_cutoff {
                    shared.unbounded.process(hash, callbacks)
                } else {
                    shared.bounded.process(hash, callbacks)
                }
            }
        }
    }

    pub fn batch_write_size(&self) -> u64 {
        self.shared.bounded.batch_write_size()
    }
}

impl Drop for ConfirmationHeightProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use ltypes::Amount;

    use super::*;
    use crate::testing::LedgerContext;
    use crate::write_queue::WriteDatabaseQueue;

    fn build(
        ctx: &LedgerContext,
        mode: ConfirmationHeightMode,
    ) -> (ConfirmationHeightProcessor, std::sync::mpsc::Receiver<BlockHash>, std::sync::mpsc::Receiver<BlockHash>)
    {
        let processor = ConfirmationHeightProcessor::new(
            Arc::clone(&ctx.ledger),
            Arc::new(WriteDatabaseQueue::new()),
            NodeConfig::test_default(),
            mode,
        );
        let (cemented_sender, cemented_receiver) = channel();
        processor.add_cemented_observer(Box::new(move |block: &Arc<Block>| {
            let _ = cemented_sender.send(block.hash());
        }));
        let (already_sender, already_receiver) = channel();
        processor.add_block_already_cemented_observer(Box::new(move |hash: &BlockHash| {
            let _ = already_sender.send(*hash);
        }));
        (processor, cemented_receiver, already_receiver)
    }

    fn chain_of_sends(ctx: &LedgerContext, count: u64) -> Vec<BlockHash> {
        let mut hashes = Vec::new();
        for i in 0..count {
            let key = LedgerContext::keypair(1000 + i);
            let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
            ctx.process_ok(&send);
            hashes.push(send.hash());
        }
        hashes
    }

    fn cements_ascending(mode: ConfirmationHeightMode) {
        let ctx = LedgerContext::new();
        let hashes = chain_of_sends(&ctx, 3);
        let (processor, cemented, _) = build(&ctx, mode);
        processor.add(*hashes.last().unwrap());
        for expected in &hashes {
            let seen = cemented.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(seen, *expected);
        }
        processor.flush();
        let tx = ctx.ledger.store.tx_begin_read();
        let info = ctx.ledger.store.confirmation_height_get(&tx, ctx.genesis_key.public()).unwrap();
        assert_eq!(info.height, 4);
        assert_eq!(info.frontier, *hashes.last().unwrap());
        assert!(cemented.try_recv().is_err());
        processor.stop();
    }

    #[test]
    fn bounded_cements_ascending_exactly_once() {
        cements_ascending(ConfirmationHeightMode::Bounded);
    }

    #[test]
    fn unbounded_cements_ascending_exactly_once() {
        cements_ascending(ConfirmationHeightMode::Unbounded);
    }

    #[test]
    fn replay_fires_already_cemented() {
        let ctx = LedgerContext::new();
        let hashes = chain_of_sends(&ctx, 1);
        let (processor, cemented, already) = build(&ctx, ConfirmationHeightMode::Automatic);
        processor.add(hashes[0]);
        assert_eq!(cemented.recv_timeout(Duration::from_secs(5)).unwrap(), hashes[0]);
        processor.add(hashes[0]);
        assert_eq!(already.recv_timeout(Duration::from_secs(5)).unwrap(), hashes[0]);
        processor.stop();
    }

    #[test]
    fn receives_cement_their_source_chain_first() {
        let ctx = LedgerContext::new();
        let key = LedgerContext::keypair(10);
        let send = ctx.state_send(&ctx.genesis_key, *key.public(), Amount::from(4u64));
        ctx.process_ok(&send);
        let receive = ctx.state_receive(&key, &send.hash(), Amount::from(4u64));
        ctx.process_ok(&receive);

        let (processor, cemented, _) = build(&ctx, ConfirmationHeightMode::Automatic);
        // Only the receive is requested; its source must land first
        processor.add(receive.hash());
        assert_eq!(cemented.recv_timeout(Duration::from_secs(5)).unwrap(), send.hash());
        assert_eq!(cemented.recv_timeout(Duration::from_secs(5)).unwrap(), receive.hash());
        processor.flush();
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(ctx.ledger.block_confirmed(&tx, &send.hash()));
        assert!(ctx.ledger.block_confirmed(&tx, &receive.hash()));
        processor.stop();
    }

    #[test]
    fn heights_never_decrease() {
        let ctx = LedgerContext::new();
        let hashes = chain_of_sends(&ctx, 4);
        let (processor, cemented, _) = build(&ctx, ConfirmationHeightMode::Bounded);
        processor.add(hashes[3]);
        for _ in 0..4 {
            cemented.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        processor.flush();
        // Requesting an earlier block afterwards does not lower the height
        processor.add(hashes[0]);
        processor.flush();
        let tx = ctx.ledger.store.tx_begin_read();
        let info = ctx.ledger.store.confirmation_height_get(&tx, ctx.genesis_key.public()).unwrap();
        assert_eq!(info.height, 5);
        processor.stop();
    }
}
