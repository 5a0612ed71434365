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
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lnetwork::{Channel, PeerRoster};
use ltypes::{Account, Amount, Block, BlockHash, Root, Vote};
use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;
use crate::confirmation_height::ConfirmationHeightProcessor;
use crate::confirmation_solicitor::ConfirmationSolicitor;
use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;
use crate::vote_processor::VoteCode;

/// A representative peer a solicitation can be directed at
#[derive(Clone)]
pub struct Representative {
    pub account: Account,
    pub channel: Arc<dyn Channel>,
}

#[derive(Debug, Clone)]
pub struct VoteInfo {
    pub time: Instant,
    pub sequence: u64,
    pub hash: BlockHash,
}

/// Per-root tracking of competing blocks and their vote tallies.
/// Identity is (root, winner hash).
pub struct Election {
    pub root: Root,
    pub winner: Arc<Block>,
    pub blocks: HashMap<BlockHash, Arc<Block>>,
    pub last_votes: HashMap<Account, VoteInfo>,
    pub confirmed: bool,
    pub election_start: Instant,
}

impl Election {
    fn new(block: Arc<Block>) -> Election {
        let mut blocks = HashMap::new();
        blocks.insert(block.hash(), Arc::clone(&block));
        Election {
            root: block.root(),
            winner: block,
            blocks,
            last_votes: HashMap::new(),
            confirmed: false,
            election_start: Instant::now(),
        }
    }

    /// Voting weight currently behind each competing block
    pub fn tally(&self, ledger: &Ledger) -> HashMap<BlockHash, Amount> {
        let mut tally: HashMap<BlockHash, Amount> = HashMap::new();
        for (account, info) in &self.last_votes {
            let entry = tally.entry(info.hash).or_default();
            *entry = entry.saturating_add(ledger.weight(account));
        }
        tally
    }
}

struct ActiveState {
    roots: HashMap<Root, Election>,
    blocks: HashMap<BlockHash, Root>,
    stopped: bool,
}

pub type RepresentativesProvider = Box<dyn Fn() -> Vec<Representative> + Send + Sync>;

/// The set of elections awaiting confirmation. Votes flow in through the
/// vote processor; confirmed winners are handed to the confirmation height
/// processor and the losing forks are forgotten.
pub struct ActiveTransactions {
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    confirmation_height: Arc<ConfirmationHeightProcessor>,
    config: NodeConfig,
    state: Mutex<ActiveState>,
    condition: Condvar,
    representatives_provider: Mutex<Option<RepresentativesProvider>>,
    peer_roster: Mutex<Option<Arc<PeerRoster>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ActiveTransactions {
    pub fn new(
        ledger: Arc<Ledger>,
        online_reps: Arc<OnlineReps>,
        confirmation_height: Arc<ConfirmationHeightProcessor>,
        config: NodeConfig,
    ) -> Arc<ActiveTransactions> {
        Arc::new(ActiveTransactions {
            ledger,
            online_reps,
            confirmation_height,
            config,
            state: Mutex::new(ActiveState {
                roots: HashMap::new(),
                blocks: HashMap::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            representatives_provider: Mutex::new(None),
            peer_roster: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    pub fn set_representatives_provider(&self, provider: RepresentativesProvider) {
        *self.representatives_provider.lock() = Some(provider);
    }

    pub fn set_peer_roster(&self, roster: Arc<PeerRoster>) {
        *self.peer_roster.lock() = Some(roster);
    }

    /// Spawns the periodic solicitation loop
    pub fn start_request_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = if self.config.network.is_test_network() {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(500)
        };
        let thread = thread::Builder::new()
            .name("request loop".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut state = this.state.lock();
                        if state.stopped {
                            break
                        }
                        this.condition.wait_for(&mut state, interval);
                        if state.stopped {
                            break
                        }
                    }
                    let representatives = match this.representatives_provider.lock().as_ref() {
                        Some(provider) => provider(),
                        None => continue,
                    };
                    let roster = this.peer_roster.lock().clone();
                    let fanout =
                        roster.as_ref().map(|roster| roster.len()).unwrap_or(0).max(representatives.len());
                    let mut solicitor = ConfirmationSolicitor::new(&this.config.network, fanout, roster);
                    solicitor.prepare(&representatives);
                    this.request_confirmations(&mut solicitor);
                    solicitor.flush();
                }
            })
            .unwrap();
        *self.thread.lock() = Some(thread);
    }

    /// One pass of winner broadcasts and confirm_req batching over every
    /// live election
    pub fn request_confirmations(&self, solicitor: &mut ConfirmationSolicitor) {
        let state = self.state.lock();
        for election in state.roots.values() {
            if election.confirmed {
                continue
            }
            // Rebroadcast the winner to laggards before asking for votes
            let _ = solicitor.broadcast(election);
            let _ = solicitor.add(election);
        }
    }

    /// Starts an election for `block` unless one exists for its root.
    /// Returns false when inserted.
    pub fn start(&self, block: Arc<Block>) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return true
        }
        let root = block.root();
        let hash = block.hash();
        match state.roots.get_mut(&root) {
            Some(election) => {
                // A competing fork joins the existing election
                election.blocks.entry(hash).or_insert_with(|| Arc::clone(&block));
                state.blocks.entry(hash).or_insert(root);
                true
            }
            None => {
                state.roots.insert(root, Election::new(Arc::clone(&block)));
                state.blocks.insert(hash, root);
                false
            }
        }
    }

    /// Applies `vote` to every election one of its hashes belongs to
    pub fn vote(&self, vote: &Vote) -> VoteCode {
        let mut processed = false;
        let mut replay = false;
        let mut confirmed_winners = Vec::new();
        {
            let mut state = self.state.lock();
            for hash in &vote.hashes {
                let root = match state.blocks.get(hash) {
                    Some(root) => *root,
                    None => continue,
                };
                let election = match state.roots.get_mut(&root) {
                    Some(election) => election,
                    None => continue,
                };
                match election.last_votes.get(&vote.account) {
                    Some(existing) if existing.sequence >= vote.sequence => {
                        replay = true;
                        continue
                    }
                    _ => {}
                }
                election.last_votes.insert(vote.account, VoteInfo {
                    time: Instant::now(),
                    sequence: vote.sequence,
                    hash: *hash,
                });
                processed = true;
                if let Some(winner) = Self::confirm_if_quorum(&self.ledger, &self.online_reps, election) {
                    confirmed_winners.push((root, winner));
                }
            }
            for (root, _) in &confirmed_winners {
                Self::erase_election(&mut state, root);
            }
        }
        for (_, winner) in confirmed_winners {
            linfo!(CONFIRM, "Election winner {:?} reached quorum", winner.hash());
            self.confirmation_height.add(winner.hash());
        }
        if processed {
            VoteCode::Vote
        } else if replay {
            VoteCode::Replay
        } else {
            VoteCode::Indeterminate
        }
    }

    /// Promotes the best tallied block and reports whether quorum was hit
    fn confirm_if_quorum(
        ledger: &Ledger,
        online_reps: &OnlineReps,
        election: &mut Election,
    ) -> Option<Arc<Block>> {
        let tally = election.tally(ledger);
        let (best_hash, best_weight) =
            tally.into_iter().max_by_key(|(_, weight)| *weight)?;
        if let Some(block) = election.blocks.get(&best_hash) {
            election.winner = Arc::clone(block);
        }
        // Two thirds of the online stake confirms
        let quorum = online_reps.online_stake() / Amount::from(100u64) * Amount::from(67u64);
        if best_weight >= quorum && election.winner.hash() == best_hash {
            election.confirmed = true;
            Some(Arc::clone(&election.winner))
        } else {
            None
        }
    }

    fn erase_election(state: &mut ActiveState, root: &Root) {
        if let Some(election) = state.roots.remove(root) {
            for hash in election.blocks.keys() {
                state.blocks.remove(hash);
            }
        }
    }

    pub fn erase(&self, root: &Root) {
        let mut state = self.state.lock();
        Self::erase_election(&mut state, root);
    }

    pub fn active(&self, hash: &BlockHash) -> bool {
        self.state.lock().blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn winner(&self, root: &Root) -> Option<Arc<Block>> {
        self.state.lock().roots.get(root).map(|election| Arc::clone(&election.winner))
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for ActiveTransactions {
    fn drop(&mut self) {
        self.stop();
    }
}
