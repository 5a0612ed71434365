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
use std::sync::Arc;
use std::thread;

use lnetwork::Channel;
use ltypes::Vote;
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::config::NodeConfig;
use crate::election::ActiveTransactions;
use crate::gap_cache::GapCache;
use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;
use crate::signatures::{SignatureCheckSet, SignatureChecker, VERIFICATION_VALID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteCode {
    /// The signature did not verify
    Invalid,
    /// Already seen an equal or newer vote from this account
    Replay,
    /// Processed by at least one election
    Vote,
    /// None of the hashes matched a live election
    Indeterminate,
}

pub type VoteObserver = Box<dyn Fn(&Arc<Vote>, VoteCode) + Send + Sync>;

struct State {
    votes: VecDeque<(Arc<Vote>, Arc<dyn Channel>)>,
    stopped: bool,
    is_active: bool,
}

struct Shared {
    checker: Arc<SignatureChecker>,
    active: Arc<ActiveTransactions>,
    gap_cache: Arc<GapCache>,
    online_reps: Arc<OnlineReps>,
    ledger: Arc<Ledger>,
    config: NodeConfig,
    state: Mutex<State>,
    condition: Condvar,
    observers: Mutex<Vec<VoteObserver>>,
}

/// Bounded ingestion queue for inbound votes. A worker thread batches
/// signature verification through the shared checker and applies the
/// survivors to live elections. Overload sheds low-weight representatives
/// first.
pub struct VoteProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VoteProcessor {
    pub fn new(
        checker: Arc<SignatureChecker>,
        active: Arc<ActiveTransactions>,
        gap_cache: Arc<GapCache>,
        online_reps: Arc<OnlineReps>,
        ledger: Arc<Ledger>,
        config: NodeConfig,
    ) -> VoteProcessor {
        let shared = Arc::new(Shared {
            checker,
            active,
            gap_cache,
            online_reps,
            ledger,
            config,
            state: Mutex::new(State {
                votes: VecDeque::new(),
                stopped: false,
                is_active: false,
            }),
            condition: Condvar::new(),
            observers: Mutex::new(Vec::new()),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("vote processing".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        VoteProcessor {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn add_vote_observer(&self, observer: VoteObserver) {
        self.shared.observers.lock().push(observer);
    }

    /// Weight class of a representative against the trended online stake
    fn tier(shared: &Shared, vote: &Vote) -> usize {
        let stake = shared.online_reps.online_stake();
        let weight = shared.ledger.weight(&vote.account);
        if weight >= stake / ltypes::Amount::from(20u64) {
            3
        } else if weight >= stake / ltypes::Amount::from(100u64) {
            2
        } else if weight >= stake / ltypes::Amount::from(1000u64) {
            1
        } else {
            0
        }
    }

    /// Random early detection: the heaviest representatives are always
    /// admitted; each lighter tier is dropped with a probability that ramps
    /// from zero at its occupancy threshold to one at full capacity.
    fn admitted(tier: usize, occupancy: usize, capacity: usize) -> bool {
        if tier >= 3 {
            return true
        }
        let threshold = capacity * (6 + tier) / 9;
        if occupancy < threshold {
            true
        } else if occupancy >= capacity {
            false
        } else {
            let survival = (capacity - occupancy) as f64 / (capacity - threshold) as f64;
            rand::thread_rng().gen::<f64>() < survival
        }
    }

    /// Returns false if the vote was queued for processing. Under pressure
    /// admission narrows to ever heavier representatives.
    pub fn vote(&self, vote: Arc<Vote>, channel: Arc<dyn Channel>) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return true
        }
        let capacity = self.shared.config.vote_processor_capacity;
        let occupancy = state.votes.len();
        let admitted = occupancy < capacity * 6 / 9
            || Self::admitted(Self::tier(&self.shared, &vote), occupancy, capacity);
        if admitted {
            state.votes.push_back((vote, channel));
            drop(state);
            self.shared.condition.notify_all();
        } else {
            ltrace!(VOTE, "Vote overflow from {:?}", vote.account);
        }
        !admitted
    }

    fn run(shared: &Arc<Shared>) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if !state.votes.is_empty() {
                let batch: Vec<_> = state.votes.drain(..).collect();
                state.is_active = true;
                drop(state);
                Self::verify_votes(shared, &batch);
                state = shared.state.lock();
                state.is_active = false;
                shared.condition.notify_all();
            } else {
                shared.condition.notify_all();
                shared.condition.wait(&mut state);
            }
        }
    }

    /// Batch signature verification, then blocking application of the
    /// valid votes
    fn verify_votes(shared: &Arc<Shared>, batch: &[(Arc<Vote>, Arc<dyn Channel>)]) {
        let messages = batch.iter().map(|(vote, _)| vote.hash()).collect();
        let pub_keys = batch.iter().map(|(vote, _)| vote.account).collect();
        let signatures = batch.iter().map(|(vote, _)| vote.signature).collect();
        let mut check_set = SignatureCheckSet::new(messages, pub_keys, signatures);
        shared.checker.verify(&mut check_set);
        for ((vote, channel), verification) in batch.iter().zip(check_set.verifications) {
            if verification == VERIFICATION_VALID && !vote.hashes.is_empty() {
                Self::vote_blocking(shared, vote, channel);
            } else {
                Self::notify(shared, vote, VoteCode::Invalid);
            }
        }
    }

    fn vote_blocking(shared: &Arc<Shared>, vote: &Arc<Vote>, channel: &Arc<dyn Channel>) -> VoteCode {
        shared.online_reps.observe(&vote.account);
        let code = shared.active.vote(vote);
        if code == VoteCode::Indeterminate {
            // Votes for blocks this node has never seen feed the gap cache
            shared.gap_cache.vote(vote);
        }
        ltrace!(VOTE, "Vote from {:?} via {:?}: {:?}", vote.account, channel.endpoint(), code);
        Self::notify(shared, vote, code);
        code
    }

    fn notify(shared: &Arc<Shared>, vote: &Arc<Vote>, code: VoteCode) {
        for observer in shared.observers.lock().iter() {
            observer(vote, code);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the queue synchronously
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !state.stopped && (state.is_active || !state.votes.is_empty()) {
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
}

impl Drop for VoteProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use lnetwork::LoopbackChannel;
    use ltypes::{Amount, BlockHash};

    use super::*;
    use crate::confirmation_height::{ConfirmationHeightMode, ConfirmationHeightProcessor};
    use crate::testing::LedgerContext;
    use crate::write_queue::WriteDatabaseQueue;

    struct Fixture {
        ctx: LedgerContext,
        active: Arc<ActiveTransactions>,
        processor: VoteProcessor,
    }

    fn build() -> Fixture {
        let ctx = LedgerContext::new();
        let config = NodeConfig::test_default();
        let online_reps =
            Arc::new(OnlineReps::new(Arc::clone(&ctx.ledger), config.online_weight_minimum, config.max_weight_samples));
        let confirmation_height = Arc::new(ConfirmationHeightProcessor::new(
            Arc::clone(&ctx.ledger),
            Arc::new(WriteDatabaseQueue::new()),
            config.clone(),
            ConfirmationHeightMode::Automatic,
        ));
        let active = ActiveTransactions::new(
            Arc::clone(&ctx.ledger),
            Arc::clone(&online_reps),
            confirmation_height,
            config.clone(),
        );
        let alarm = Arc::new(ltimer::Alarm::new());
        let gap_cache = Arc::new(GapCache::new(
            Arc::clone(&ctx.ledger),
            Arc::clone(&online_reps),
            alarm,
            config.clone(),
        ));
        let checker = Arc::new(SignatureChecker::new(0));
        let processor = VoteProcessor::new(
            checker,
            Arc::clone(&active),
            gap_cache,
            online_reps,
            Arc::clone(&ctx.ledger),
            config,
        );
        Fixture {
            ctx,
            active,
            processor,
        }
    }

    #[test]
    fn valid_vote_reaches_elections() {
        let fixture = build();
        let ctx = &fixture.ctx;
        let (sender, receiver) = channel();
        fixture.processor.add_vote_observer(Box::new(move |vote, code| {
            let _ = sender.send((vote.account, code));
        }));
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        ctx.process_ok(&send);
        fixture.active.start(Arc::clone(&send));

        let vote = Arc::new(Vote::new(&ctx.genesis_key, 1, vec![send.hash()]));
        let channel = Arc::new(LoopbackChannel::new(7100));
        assert!(!fixture.processor.vote(vote, channel));
        let (account, code) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(account, *ctx.genesis_key.public());
        assert_eq!(code, VoteCode::Vote);
        fixture.processor.stop();
    }

    #[test]
    fn forged_vote_is_invalid() {
        let fixture = build();
        let ctx = &fixture.ctx;
        let (sender, receiver) = channel();
        fixture.processor.add_vote_observer(Box::new(move |_, code| {
            let _ = sender.send(code);
        }));
        let keypair = LedgerContext::keypair(10);
        let mut vote = Vote::new(&keypair, 1, vec![BlockHash::from_low_u64_be(1)]);
        vote.account = *ctx.genesis_key.public();
        let channel = Arc::new(LoopbackChannel::new(7101));
        fixture.processor.vote(Arc::new(vote), channel);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), VoteCode::Invalid);
        fixture.processor.stop();
    }

    #[test]
    fn unknown_hash_is_indeterminate() {
        let fixture = build();
        let ctx = &fixture.ctx;
        let (sender, receiver) = channel();
        fixture.processor.add_vote_observer(Box::new(move |_, code| {
            let _ = sender.send(code);
        }));
        let vote = Arc::new(Vote::new(&ctx.genesis_key, 1, vec![BlockHash::from_low_u64_be(404)]));
        let channel = Arc::new(LoopbackChannel::new(7102));
        fixture.processor.vote(vote, channel);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), VoteCode::Indeterminate);
        fixture.processor.stop();
    }

    #[test]
    fn admission_narrows_probabilistically_under_pressure() {
        let capacity = 90;
        // The top tier is admitted even over capacity
        for _ in 0..32 {
            assert!(VoteProcessor::admitted(3, capacity * 2, capacity));
        }
        // Everyone passes while the queue is comfortable
        assert!(VoteProcessor::admitted(0, 0, capacity));
        assert!(VoteProcessor::admitted(0, capacity * 6 / 9 - 1, capacity));
        // A full queue sheds everything below the top tier
        for tier in 0..3 {
            assert!(!VoteProcessor::admitted(tier, capacity, capacity));
        }
        // In between, lighter votes survive only sometimes
        let occupancy = (capacity * 6 / 9 + capacity) / 2;
        let survived = (0..256).filter(|_| VoteProcessor::admitted(0, occupancy, capacity)).count();
        assert!(survived > 0);
        assert!(survived < 256);
    }

    #[test]
    fn flush_drains_the_queue() {
        let fixture = build();
        let ctx = &fixture.ctx;
        let channel = Arc::new(LoopbackChannel::new(7103));
        for sequence in 1..=8u64 {
            let vote = Arc::new(Vote::new(&ctx.genesis_key, sequence, vec![BlockHash::from_low_u64_be(sequence)]));
            fixture.processor.vote(vote, Arc::clone(&channel) as Arc<dyn Channel>);
        }
        fixture.processor.flush();
        assert!(fixture.processor.is_empty());
        fixture.processor.stop();
    }
}
