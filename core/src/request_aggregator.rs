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
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use lnetwork::{Channel, Message};
use ltypes::{BlockHash, Root};
use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::voting::{VoteGenerator, VoteGeneratorSession, VotesCache};

/// Buffer of one endpoint's outstanding confirmation requests. Only the
/// newest channel from the endpoint is retained.
struct ChannelPool {
    channel: Arc<dyn Channel>,
    hashes_roots: Vec<(BlockHash, Root)>,
    start: Instant,
    deadline: Instant,
}

struct State {
    pools: HashMap<SocketAddr, ChannelPool>,
    stopped: bool,
}

struct Shared {
    ledger: Arc<Ledger>,
    votes_cache: Arc<VotesCache>,
    generator: Arc<VoteGenerator>,
    config: NodeConfig,
    state: Mutex<State>,
    condition: Condvar,
}

/// Pools confirmation requests per endpoint, aggregated to minimize
/// bandwidth and vote generation. Cached votes answer immediately at the
/// deadline; the rest are handed to the vote generator.
pub struct RequestAggregator {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RequestAggregator {
    pub fn new(
        ledger: Arc<Ledger>,
        votes_cache: Arc<VotesCache>,
        generator: Arc<VoteGenerator>,
        config: NodeConfig,
    ) -> RequestAggregator {
        let shared = Arc::new(Shared {
            ledger,
            votes_cache,
            generator,
            config,
            state: Mutex::new(State {
                pools: HashMap::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("request agg".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        RequestAggregator {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Queues `hashes_roots` for `channel`, extending its deadline window
    pub fn add(&self, channel: Arc<dyn Channel>, hashes_roots: &[(BlockHash, Root)]) {
        if hashes_roots.is_empty() {
            return
        }
        let endpoint = channel.endpoint();
        let now = Instant::now();
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            let max_channel_requests = self.shared.config.aggregator_max_channel_requests;
            let pool = state.pools.entry(endpoint).or_insert_with(|| ChannelPool {
                channel: Arc::clone(&channel),
                hashes_roots: Vec::new(),
                start: now,
                deadline: now + self.shared.config.aggregator_small_delay,
            });
            // Only the newest channel is kept alive
            pool.channel = channel;
            for hash_root in hashes_roots {
                if !pool.hashes_roots.iter().any(|existing| existing.0 == hash_root.0) {
                    pool.hashes_roots.push(*hash_root);
                }
            }
            // Drop oldest requests beyond the cap
            if pool.hashes_roots.len() > max_channel_requests {
                let excess = pool.hashes_roots.len() - max_channel_requests;
                pool.hashes_roots.drain(..excess);
            }
            let capped = pool.start + self.shared.config.aggregator_max_delay;
            pool.deadline = (now + self.shared.config.aggregator_small_delay).min(capped);
        }
        self.shared.condition.notify_all();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
            let earliest = state.pools.values().map(|pool| pool.deadline).min();
            match earliest {
                None => {
                    shared.condition.wait(&mut state);
                }
                Some(deadline) if deadline > Instant::now() => {
                    shared.condition.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let due: Vec<SocketAddr> = state
                        .pools
                        .iter()
                        .filter(|(_, pool)| pool.deadline <= Instant::now())
                        .map(|(endpoint, _)| *endpoint)
                        .collect();
                    let pools: Vec<ChannelPool> =
                        due.iter().filter_map(|endpoint| state.pools.remove(endpoint)).collect();
                    drop(state);
                    for pool in pools {
                        Self::aggregate(shared, pool);
                    }
                    state = shared.state.lock();
                }
            }
        }
    }

    /// Replies from the votes cache where possible and generates votes for
    /// the remainder
    fn aggregate(shared: &Arc<Shared>, pool: ChannelPool) {
        let tx = shared.ledger.store.tx_begin_read();
        let mut session = VoteGeneratorSession::new(&shared.generator);
        let mut cached_sent = 0usize;
        let mut generated = 0usize;
        for (hash, _root) in &pool.hashes_roots {
            let cached = shared.votes_cache.find(hash);
            if !cached.is_empty() {
                for vote in cached {
                    pool.channel.send(&Message::ConfirmAck(vote.as_ref().clone()));
                    cached_sent += 1;
                }
            } else if shared.ledger.block_exists(&tx, hash) {
                session.add(hash);
                generated += 1;
            } else {
                ltrace!(AGGREGATOR, "Request for unknown block {:?}", hash);
            }
        }
        session.flush();
        ldebug!(
            AGGREGATOR,
            "Replied to {:?} with {} cached votes, {} generation requests",
            pool.channel.endpoint(),
            cached_sent,
            generated
        );
    }
}

impl Drop for RequestAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lnetwork::LoopbackChannel;
    use ltypes::{Amount, Vote};

    use super::*;
    use crate::testing::LedgerContext;

    struct Fixture {
        ctx: LedgerContext,
        cache: Arc<VotesCache>,
        generator: Arc<VoteGenerator>,
        aggregator: RequestAggregator,
    }

    fn build(local_reps: Vec<lkey::KeyPair>) -> Fixture {
        let ctx = LedgerContext::new();
        let config = NodeConfig::test_default();
        let cache = Arc::new(VotesCache::new(config.votes_cache_size, config.votes_cache_entries_max));
        let generator = Arc::new(VoteGenerator::new(Arc::clone(&cache), local_reps, config.clone()));
        let aggregator =
            RequestAggregator::new(Arc::clone(&ctx.ledger), Arc::clone(&cache), Arc::clone(&generator), config);
        Fixture {
            ctx,
            cache,
            generator,
            aggregator,
        }
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "Timed out waiting for condition");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn cached_votes_are_forwarded() {
        let fixture = build(Vec::new());
        let ctx = &fixture.ctx;
        let hash = BlockHash::from_low_u64_be(1);
        let vote = Arc::new(Vote::new(&ctx.genesis_key, 1, vec![hash]));
        fixture.cache.add(&vote);

        let channel = Arc::new(LoopbackChannel::new(7200));
        fixture.aggregator.add(Arc::clone(&channel) as Arc<dyn Channel>, &[(hash, Root::from_low_u64_be(9))]);
        wait_for(|| channel.sent_count() == 1);
        match &channel.sent()[0] {
            Message::ConfirmAck(sent) => assert_eq!(*sent, *vote.as_ref()),
            other => panic!("Unexpected message {:?}", other),
        }
        assert!(fixture.aggregator.is_empty());
        fixture.aggregator.stop();
    }

    #[test]
    fn uncached_known_blocks_get_generated_votes() {
        let rep = LedgerContext::keypair(40);
        let fixture = build(vec![rep.clone()]);
        let ctx = &fixture.ctx;
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        ctx.process_ok(&send);

        let channel = Arc::new(LoopbackChannel::new(7201));
        fixture.aggregator.add(Arc::clone(&channel) as Arc<dyn Channel>, &[(send.hash(), send.root())]);
        // The generator signs with the local representative and caches it
        wait_for(|| !fixture.cache.find(&send.hash()).is_empty());
        let cached = fixture.cache.find(&send.hash());
        assert_eq!(cached[0].account, *rep.public());
        fixture.aggregator.stop();
        fixture.generator.stop();
    }

    #[test]
    fn duplicate_hashes_collapse_into_one_pool() {
        let fixture = build(Vec::new());
        let hash = BlockHash::from_low_u64_be(1);
        let channel = Arc::new(LoopbackChannel::new(7202));
        let pairs = vec![(hash, Root::from_low_u64_be(1)), (hash, Root::from_low_u64_be(1))];
        fixture.aggregator.add(Arc::clone(&channel) as Arc<dyn Channel>, &pairs);
        fixture.aggregator.add(Arc::clone(&channel) as Arc<dyn Channel>, &pairs);
        assert_eq!(fixture.aggregator.len(), 1);
        {
            let state = fixture.aggregator.shared.state.lock();
            assert_eq!(state.pools.values().next().unwrap().hashes_roots.len(), 1);
        }
        fixture.aggregator.stop();
    }
}
