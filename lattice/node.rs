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

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lcore::{
    ActiveTransactions, BlockProcessor, BlockProcessorObservers, ConfirmationHeightMode,
    ConfirmationHeightProcessor, GapCache, Ledger, NodeConfig, OnlineReps, RequestAggregator, SignatureChecker,
    Store, VoteGenerator, VoteProcessor, VotesCache,
};
use lnetwork::{Message, PeerExclusion, PeerRoster};
use lsync::{BootstrapInitiator, BootstrapPeer, PeerConnector, PeerError};
use ltimer::Alarm;
use ltypes::{blake2b_hash, Block, Epoch, Epochs, Link, NetworkConstants};

/// The socket layer is a collaborator this binary does not carry; a node
/// without one simply has no bootstrap candidates.
struct NoPeers;

impl PeerConnector for NoPeers {
    fn connect(&self, _endpoint: SocketAddr) -> Result<Arc<dyn BootstrapPeer>, PeerError> {
        Err(PeerError::ConnectionRefused)
    }

    fn candidate_endpoints(&self) -> Vec<SocketAddr> {
        Vec::new()
    }
}

fn epoch_link(text: &str) -> Link {
    blake2b_hash(text.as_bytes())
}

/// All core subsystems wired together in dependency order. Observer lists
/// are registered here, before anything runs, and never change afterwards.
pub struct Node {
    pub ledger: Arc<Ledger>,
    pub alarm: Arc<Alarm>,
    pub peer_roster: Arc<PeerRoster>,
    pub online_reps: Arc<OnlineReps>,
    pub block_processor: Arc<BlockProcessor>,
    pub confirmation_height: Arc<ConfirmationHeightProcessor>,
    pub active: Arc<ActiveTransactions>,
    pub votes_cache: Arc<VotesCache>,
    pub vote_generator: Arc<VoteGenerator>,
    pub vote_processor: Arc<VoteProcessor>,
    pub aggregator: RequestAggregator,
    pub bootstrap: Arc<BootstrapInitiator>,
    checker: Arc<SignatureChecker>,
}

impl Node {
    pub fn start(constants: NetworkConstants) -> Node {
        let config = NodeConfig::new(constants.clone());
        let genesis_key = Ledger::dev_genesis_key();
        let mut epochs = Epochs::new();
        epochs.add(Epoch::Epoch1, *genesis_key.public(), epoch_link("epoch v1 block"));
        epochs.add(Epoch::Epoch2, *genesis_key.public(), epoch_link("epoch v2 block"));
        let genesis_block = Ledger::dev_genesis_block(&constants);
        let ledger = Arc::new(Ledger::new(Store::new_in_memory(), constants, epochs, genesis_block));

        let write_queue = Arc::new(lcore::WriteDatabaseQueue::new());
        let alarm = Arc::new(Alarm::new());
        // Filled by the connection layer as peers come and go
        let peer_roster = Arc::new(PeerRoster::new());
        let online_reps = Arc::new(OnlineReps::new(
            Arc::clone(&ledger),
            config.online_weight_minimum,
            config.max_weight_samples,
        ));
        let gap_cache =
            Arc::new(GapCache::new(Arc::clone(&ledger), Arc::clone(&online_reps), Arc::clone(&alarm), config.clone()));
        let checker = Arc::new(SignatureChecker::new(config.signature_checker_threads));

        let block_processor = BlockProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&write_queue),
            Arc::clone(&gap_cache),
            Arc::clone(&checker),
            config.clone(),
        );
        let confirmation_height = Arc::new(ConfirmationHeightProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&write_queue),
            config.clone(),
            ConfirmationHeightMode::Automatic,
        ));
        let active = ActiveTransactions::new(
            Arc::clone(&ledger),
            Arc::clone(&online_reps),
            Arc::clone(&confirmation_height),
            config.clone(),
        );

        let votes_cache = Arc::new(VotesCache::new(config.votes_cache_size, config.votes_cache_entries_max));
        // On the test network the development key doubles as this node's
        // voting representative
        let local_reps = if config.network.is_test_network() {
            vec![genesis_key]
        } else {
            Vec::new()
        };
        let vote_generator = Arc::new(VoteGenerator::new(Arc::clone(&votes_cache), local_reps, config.clone()));
        let vote_processor = Arc::new(VoteProcessor::new(
            Arc::clone(&checker),
            Arc::clone(&active),
            Arc::clone(&gap_cache),
            Arc::clone(&online_reps),
            Arc::clone(&ledger),
            config.clone(),
        ));
        let aggregator = RequestAggregator::new(
            Arc::clone(&ledger),
            Arc::clone(&votes_cache),
            Arc::clone(&vote_generator),
            config.clone(),
        );
        let bootstrap = BootstrapInitiator::new(
            Arc::clone(&ledger),
            Arc::clone(&block_processor),
            Arc::new(NoPeers),
            Arc::new(PeerExclusion::new()),
            config.clone(),
        );

        // Observer wiring, all before the first block can arrive
        {
            let active_for_live = Arc::clone(&active);
            let active_for_fork = Arc::clone(&active);
            block_processor.set_observers(BlockProcessorObservers {
                block_processed: vec![Box::new(move |block: &Arc<Block>| {
                    active_for_live.start(Arc::clone(block));
                })],
                fork: vec![Box::new(move |block: &Arc<Block>| {
                    active_for_fork.start(Arc::clone(block));
                })],
            });
        }
        confirmation_height.add_cemented_observer(Box::new(|block: &Arc<Block>| {
            ltrace!(CONFIRM, "Cemented {:?}", block.hash());
        }));
        {
            let bootstrap = Arc::clone(&bootstrap);
            gap_cache.set_bootstrap_starter(Arc::new(move |hash, lazy| {
                if lazy {
                    bootstrap.bootstrap_lazy(hash, false);
                } else {
                    bootstrap.bootstrap();
                }
            }));
        }
        {
            let generator = Arc::clone(&vote_generator);
            let active_for_votes = Arc::clone(&active);
            let roster_for_votes = Arc::clone(&peer_roster);
            generator.set_vote_sink(Box::new(move |vote| {
                // Locally generated votes flood the network and loop
                // straight back into our own elections
                roster_for_votes.flood(&Message::ConfirmAck(vote.as_ref().clone()), 0.5);
                active_for_votes.vote(&vote);
            }));
        }
        active.set_representatives_provider(Box::new(|| Vec::new()));
        active.set_peer_roster(Arc::clone(&peer_roster));
        active.start_request_loop();
        Self::schedule_weight_sampling(&alarm, &online_reps, &config);

        Node {
            ledger,
            alarm,
            peer_roster,
            online_reps,
            block_processor,
            confirmation_height,
            active,
            votes_cache,
            vote_generator,
            vote_processor,
            aggregator,
            bootstrap,
            checker,
        }
    }

    fn schedule_weight_sampling(alarm: &Arc<Alarm>, online_reps: &Arc<OnlineReps>, config: &NodeConfig) {
        let period = if config.network.is_test_network() {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(60)
        };
        fn tick(alarm: Weak<Alarm>, online_reps: Weak<OnlineReps>, period: Duration) {
            let alarm_strong = match alarm.upgrade() {
                Some(alarm_strong) => alarm_strong,
                None => return,
            };
            alarm_strong.add(
                Instant::now() + period,
                Box::new(move || {
                    if let Some(reps) = online_reps.upgrade() {
                        reps.sample();
                    }
                    tick(alarm, online_reps, period);
                }),
            );
        }
        tick(Arc::downgrade(alarm), Arc::downgrade(online_reps), period);
    }

    pub fn stop(&self) {
        self.bootstrap.stop();
        self.aggregator.stop();
        self.vote_processor.stop();
        self.vote_generator.stop();
        self.active.stop();
        self.block_processor.stop();
        self.confirmation_height.stop();
        self.checker.stop();
    }
}
