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

use std::sync::Arc;
use std::time::Instant;

use linked_hash_map::LinkedHashMap;
use ltypes::{Account, Amount, BlockHash, Vote};
use parking_lot::Mutex;

use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;

/// For each gap in account chains, track arrival time and voters
#[derive(Debug, Clone)]
pub struct GapInformation {
    pub arrival: Instant,
    pub voters: Vec<Account>,
    pub bootstrap_started: bool,
}

const MAX_GAPS: usize = 256;

pub type BootstrapStarter = Arc<dyn Fn(BlockHash, bool) + Send + Sync>;

/// Voting and arrival bookkeeping for blocks whose previous or source is
/// missing. Once enough independent voting weight lands on a missing hash
/// a deferred bootstrap of it is scheduled.
pub struct GapCache {
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    alarm: Arc<ltimer::Alarm>,
    config: NodeConfig,
    blocks: Mutex<LinkedHashMap<BlockHash, GapInformation>>,
    /// (hash, lazy) -> start a bootstrap attempt; wired during node startup
    bootstrap_starter: Mutex<Option<BootstrapStarter>>,
}

impl GapCache {
    pub fn new(
        ledger: Arc<Ledger>,
        online_reps: Arc<OnlineReps>,
        alarm: Arc<ltimer::Alarm>,
        config: NodeConfig,
    ) -> GapCache {
        GapCache {
            ledger,
            online_reps,
            alarm,
            config,
            blocks: Mutex::new(LinkedHashMap::new()),
            bootstrap_starter: Mutex::new(None),
        }
    }

    pub fn set_bootstrap_starter(&self, starter: BootstrapStarter) {
        *self.bootstrap_starter.lock() = Some(starter);
    }

    pub fn add(&self, hash: &BlockHash, arrival: Instant) {
        let mut blocks = self.blocks.lock();
        if let Some(mut info) = blocks.remove(hash) {
            info.arrival = arrival;
            blocks.insert(*hash, info);
        } else {
            blocks.insert(*hash, GapInformation {
                arrival,
                voters: Vec::new(),
                bootstrap_started: false,
            });
            if blocks.len() > MAX_GAPS {
                blocks.pop_front();
            }
        }
    }

    pub fn erase(&self, hash: &BlockHash) {
        self.blocks.lock().remove(hash);
    }

    /// Accumulates `vote`'s weight behind any of its hashes that are gaps
    pub fn vote(&self, vote: &Vote) {
        let mut blocks = self.blocks.lock();
        for hash in &vote.hashes {
            let (is_new, voters) = match blocks.get_mut(hash) {
                Some(info) if !info.bootstrap_started => {
                    let is_new = !info.voters.contains(&vote.account);
                    if is_new {
                        info.voters.push(vote.account);
                    }
                    (is_new, info.voters.clone())
                }
                _ => continue,
            };
            if is_new && self.bootstrap_check(&voters, hash) {
                if let Some(info) = blocks.get_mut(hash) {
                    info.bootstrap_started = true;
                }
            }
        }
    }

    /// Returns true when the tallied weight warrants bootstrapping `hash`,
    /// scheduling the deferred start as a side effect
    pub fn bootstrap_check(&self, voters: &[Account], hash: &BlockHash) -> bool {
        let mut tally = Amount::zero();
        for voter in voters {
            tally = tally.saturating_add(self.ledger.weight(voter));
        }
        let start_bootstrap = if !self.config.disable_lazy_bootstrap {
            tally >= self.online_reps.online_stake()
        } else if !self.config.disable_legacy_bootstrap {
            tally > self.bootstrap_threshold()
        } else {
            false
        };
        if start_bootstrap && !self.ledger.block_exists(&self.ledger.store.tx_begin_read(), hash) {
            self.bootstrap_start(*hash);
        }
        start_bootstrap
    }

    fn bootstrap_start(&self, hash: BlockHash) {
        let ledger = Arc::clone(&self.ledger);
        let starter = self.bootstrap_starter.lock().clone();
        let lazy = !self.config.disable_lazy_bootstrap;
        let legacy = !self.config.disable_legacy_bootstrap;
        self.alarm.add(
            Instant::now() + self.config.gap_cache_bootstrap_start_interval,
            Box::new(move || {
                let tx = ledger.store.tx_begin_read();
                if !ledger.block_exists(&tx, &hash) {
                    linfo!(LEDGER, "Missing block {:?} which has enough votes to warrant lazy bootstrapping it", hash);
                    if let Some(starter) = &starter {
                        if lazy {
                            starter(hash, true);
                        } else if legacy {
                            starter(hash, false);
                        }
                    }
                }
            }),
        );
    }

    pub fn bootstrap_threshold(&self) -> Amount {
        (self.online_reps.online_stake() / Amount::from(256u64)) * Amount::from(self.config.bootstrap_fraction_numerator)
    }

    pub fn size(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn earliest(&self) -> Option<Instant> {
        self.blocks.lock().front().map(|(_, info)| info.arrival)
    }

    pub fn bootstrap_started(&self, hash: &BlockHash) -> bool {
        self.blocks.lock().get(hash).map(|info| info.bootstrap_started).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;
    use crate::testing::LedgerContext;

    fn build(ctx: &LedgerContext) -> (Arc<GapCache>, Arc<OnlineReps>) {
        let config = NodeConfig::test_default();
        let online_reps =
            Arc::new(OnlineReps::new(Arc::clone(&ctx.ledger), config.online_weight_minimum, config.max_weight_samples));
        let alarm = Arc::new(ltimer::Alarm::new());
        let gap_cache = Arc::new(GapCache::new(Arc::clone(&ctx.ledger), Arc::clone(&online_reps), alarm, config));
        (gap_cache, online_reps)
    }

    #[test]
    fn weighted_votes_trigger_lazy_bootstrap() {
        let ctx = LedgerContext::new();
        let (gap_cache, _) = build(&ctx);
        let (sender, receiver) = channel();
        gap_cache.set_bootstrap_starter(Arc::new(move |hash, lazy| {
            sender.send((hash, lazy)).unwrap();
        }));

        let missing = BlockHash::from_low_u64_be(999);
        gap_cache.add(&missing, Instant::now());
        assert_eq!(gap_cache.size(), 1);

        // Genesis holds every unit of weight, well past online_stake
        let vote = Vote::new(&ctx.genesis_key, 1, vec![missing]);
        gap_cache.vote(&vote);
        assert!(gap_cache.bootstrap_started(&missing));

        let (hash, lazy) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hash, missing);
        assert!(lazy);
    }

    #[test]
    fn no_bootstrap_when_block_arrives_in_time() {
        let ctx = LedgerContext::new();
        let (gap_cache, _) = build(&ctx);
        let (sender, receiver) = channel::<(BlockHash, bool)>();
        gap_cache.set_bootstrap_starter(Arc::new(move |hash, lazy| {
            sender.send((hash, lazy)).unwrap();
        }));

        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        gap_cache.add(&send.hash(), Instant::now());
        let vote = Vote::new(&ctx.genesis_key, 1, vec![send.hash()]);
        gap_cache.vote(&vote);
        // The block lands before the deferred check fires
        ctx.process_ok(&send);
        assert!(receiver.recv_timeout(Duration::from_millis(600)).is_err());
    }

    #[test]
    fn duplicate_voters_count_once() {
        let ctx = LedgerContext::new();
        let (gap_cache, _) = build(&ctx);
        let weak = LedgerContext::keypair(10);
        let missing = BlockHash::from_low_u64_be(999);
        gap_cache.add(&missing, Instant::now());
        // A zero weight voter never reaches the threshold however often it votes
        for sequence in 1..4 {
            let vote = Vote::new(&weak, sequence, vec![missing]);
            gap_cache.vote(&vote);
        }
        assert!(!gap_cache.bootstrap_started(&missing));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let ctx = LedgerContext::new();
        let (gap_cache, _) = build(&ctx);
        let first = BlockHash::from_low_u64_be(1);
        gap_cache.add(&first, Instant::now());
        for i in 2..(MAX_GAPS as u64 + 2) {
            gap_cache.add(&BlockHash::from_low_u64_be(i), Instant::now());
        }
        assert_eq!(gap_cache.size(), MAX_GAPS);
        // Refreshed entries survive, stale ones are evicted first
        assert!(!gap_cache.bootstrap_started(&first));
        let mut blocks = gap_cache.blocks.lock();
        assert!(blocks.get(&first).is_none());
        assert!(blocks.get_mut(&BlockHash::from_low_u64_be(5)).is_some());
    }
}
