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

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use linked_hash_map::LinkedHashMap;
use lkey::KeyPair;
use ltypes::{Account, BlockHash, Vote, VOTE_HASHES_MAX};
use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;

/// LRU cache of recent votes indexed by the block hashes they mention.
/// At most one vote per (hash, account); a later sequence supersedes.
pub struct VotesCache {
    cache: Mutex<LinkedHashMap<BlockHash, Vec<Arc<Vote>>>>,
    max_size: usize,
    max_per_hash: usize,
}

impl VotesCache {
    pub fn new(max_size: usize, max_per_hash: usize) -> VotesCache {
        VotesCache {
            cache: Mutex::new(LinkedHashMap::new()),
            max_size,
            max_per_hash,
        }
    }

    pub fn add(&self, vote: &Arc<Vote>) {
        let mut cache = self.cache.lock();
        for hash in &vote.hashes {
            let known = cache.contains_key(hash);
            if !known && cache.len() >= self.max_size {
                cache.pop_front();
            }
            let entry = cache.entry(*hash).or_insert_with(Vec::new);
            match entry.iter().position(|cached| cached.account == vote.account) {
                Some(index) => {
                    if entry[index].sequence < vote.sequence {
                        entry[index] = Arc::clone(vote);
                    }
                }
                None => {
                    if entry.len() < self.max_per_hash {
                        entry.push(Arc::clone(vote));
                    }
                }
            }
        }
    }

    pub fn find(&self, hash: &BlockHash) -> Vec<Arc<Vote>> {
        self.cache.lock().get(hash).cloned().unwrap_or_default()
    }

    pub fn remove(&self, hash: &BlockHash) {
        self.cache.lock().remove(hash);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type VoteSink = Box<dyn Fn(Arc<Vote>) + Send + Sync>;

struct GeneratorState {
    hashes: VecDeque<BlockHash>,
    stopped: bool,
}

struct GeneratorShared {
    votes_cache: Arc<VotesCache>,
    config: NodeConfig,
    /// Wallet stand-in: the representative keys this node votes with
    local_reps: Vec<KeyPair>,
    state: Mutex<GeneratorState>,
    condition: Condvar,
    sequences: Mutex<HashMap<Account, u64>>,
    sink: Mutex<Option<VoteSink>>,
}

/// Accumulates hashes to vote on and flushes one signed vote per local
/// representative every 12 hashes or `vote_generator_delay`, whichever
/// comes first.
pub struct VoteGenerator {
    shared: Arc<GeneratorShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VoteGenerator {
    pub fn new(votes_cache: Arc<VotesCache>, local_reps: Vec<KeyPair>, config: NodeConfig) -> VoteGenerator {
        let shared = Arc::new(GeneratorShared {
            votes_cache,
            config,
            local_reps,
            state: Mutex::new(GeneratorState {
                hashes: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            sequences: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("voting".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        VoteGenerator {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Generated votes are handed here for flooding and local processing
    pub fn set_vote_sink(&self, sink: VoteSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    pub fn add(&self, hash: &BlockHash) {
        let full = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            state.hashes.push_back(*hash);
            state.hashes.len() >= VOTE_HASHES_MAX
        };
        if full {
            self.shared.condition.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().hashes.len()
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

    fn run(shared: &Arc<GeneratorShared>) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if state.hashes.len() >= VOTE_HASHES_MAX {
                Self::send(shared, &mut state);
            } else {
                shared.condition.wait_for(&mut state, shared.config.vote_generator_delay);
                if !state.stopped && !state.hashes.is_empty() {
                    Self::send(shared, &mut state);
                }
            }
        }
    }

    fn send(shared: &Arc<GeneratorShared>, state: &mut parking_lot::MutexGuard<'_, GeneratorState>) {
        let count = state.hashes.len().min(VOTE_HASHES_MAX);
        let hashes: Vec<BlockHash> = state.hashes.drain(..count).collect();
        parking_lot::MutexGuard::unlocked(state, || {
            for rep in &shared.local_reps {
                let sequence = {
                    let mut sequences = shared.sequences.lock();
                    let entry = sequences.entry(*rep.public()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let vote = Arc::new(Vote::new(rep, sequence, hashes.clone()));
                shared.votes_cache.add(&vote);
                if let Some(sink) = shared.sink.lock().as_ref() {
                    sink(Arc::clone(&vote));
                }
            }
        });
    }
}

impl Drop for VoteGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-request batching helper that releases its hashes to the generator
/// all at once
pub struct VoteGeneratorSession<'a> {
    generator: &'a VoteGenerator,
    hashes: Vec<BlockHash>,
}

impl<'a> VoteGeneratorSession<'a> {
    pub fn new(generator: &'a VoteGenerator) -> VoteGeneratorSession<'a> {
        VoteGeneratorSession {
            generator,
            hashes: Vec::new(),
        }
    }

    pub fn add(&mut self, hash: &BlockHash) {
        self.hashes.push(*hash);
    }

    pub fn flush(&mut self) {
        for hash in self.hashes.drain(..) {
            self.generator.add(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;
    use crate::testing::LedgerContext;

    #[test]
    fn cache_holds_the_higher_sequence() {
        let cache = VotesCache::new(16, 8);
        let keypair = LedgerContext::keypair(10);
        let hash = BlockHash::from_low_u64_be(1);
        let v1 = Arc::new(Vote::new(&keypair, 1, vec![hash]));
        let v2 = Arc::new(Vote::new(&keypair, 2, vec![hash]));
        cache.add(&v1);
        cache.add(&v2);
        let found = cache.find(&hash);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sequence, 2);
        // An out of date vote does not displace the newer one
        let v3 = Arc::new(Vote::new(&keypair, 1, vec![hash]));
        cache.add(&v3);
        assert_eq!(cache.find(&hash)[0].sequence, 2);
    }

    #[test]
    fn cache_keeps_votes_per_account() {
        let cache = VotesCache::new(16, 8);
        let hash = BlockHash::from_low_u64_be(1);
        let a = Arc::new(Vote::new(&LedgerContext::keypair(10), 1, vec![hash]));
        let b = Arc::new(Vote::new(&LedgerContext::keypair(11), 1, vec![hash]));
        cache.add(&a);
        cache.add(&b);
        assert_eq!(cache.find(&hash).len(), 2);
        cache.remove(&hash);
        assert!(cache.find(&hash).is_empty());
    }

    #[test]
    fn cache_evicts_oldest_entry() {
        let cache = VotesCache::new(2, 8);
        let keypair = LedgerContext::keypair(10);
        for i in 1..=3u64 {
            let vote = Arc::new(Vote::new(&keypair, i, vec![BlockHash::from_low_u64_be(i)]));
            cache.add(&vote);
        }
        assert!(cache.find(&BlockHash::from_low_u64_be(1)).is_empty());
        assert!(!cache.find(&BlockHash::from_low_u64_be(3)).is_empty());
    }

    #[test]
    fn generator_flushes_on_timeout() {
        let cache = Arc::new(VotesCache::new(16, 8));
        let rep = LedgerContext::keypair(10);
        let generator = VoteGenerator::new(Arc::clone(&cache), vec![rep.clone()], NodeConfig::test_default());
        let (sender, receiver) = channel();
        generator.set_vote_sink(Box::new(move |vote| {
            let _ = sender.send(vote);
        }));
        let hash = BlockHash::from_low_u64_be(1);
        generator.add(&hash);
        let vote = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(vote.hashes, vec![hash]);
        assert_eq!(vote.account, *rep.public());
        assert!(!cache.find(&hash).is_empty());
        generator.stop();
    }

    #[test]
    fn generator_flushes_full_batches_immediately() {
        let cache = Arc::new(VotesCache::new(64, 8));
        let rep = LedgerContext::keypair(10);
        let generator = VoteGenerator::new(Arc::clone(&cache), vec![rep], NodeConfig::test_default());
        let (sender, receiver) = channel();
        generator.set_vote_sink(Box::new(move |vote| {
            let _ = sender.send(vote);
        }));
        let mut session = VoteGeneratorSession::new(&generator);
        for i in 0..VOTE_HASHES_MAX as u64 {
            session.add(&BlockHash::from_low_u64_be(i + 1));
        }
        session.flush();
        let vote = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(vote.hashes.len(), VOTE_HASHES_MAX);
        assert_eq!(vote.sequence, 1);
        generator.stop();
    }
}
