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

use lnetwork::{Channel, Message, PeerRoster, CONFIRM_REQ_HASHES_MAX};
use ltypes::{BlockHash, NetworkConstants, Root};

use crate::election::{Election, Representative};

/// Fraction of the peer roster a winner rebroadcast floods on top of the
/// directed sends
const BROADCAST_FLOOD_SCALE: f32 = 0.5;

/// Accepts elections that need further votes and bundles them into
/// confirm_req batches per representative channel, plus bounded winner
/// rebroadcasts for laggards.
pub struct ConfirmationSolicitor {
    /// Maximum amount of confirmation requests (batches) to be sent to each channel
    pub max_confirm_req_batches: usize,
    /// Global maximum amount of block broadcasts
    pub max_block_broadcasts: usize,
    /// Maximum amount of requests to be sent per election
    pub max_election_requests: usize,
    /// Maximum amount of directed broadcasts to be sent per election
    pub max_election_broadcasts: usize,
    roster: Option<Arc<PeerRoster>>,
    representatives_requests: Vec<Representative>,
    representatives_broadcasts: Vec<Representative>,
    requests: HashMap<SocketAddr, (Arc<dyn Channel>, Vec<(BlockHash, Root)>)>,
    rebroadcasted: usize,
    prepared: bool,
}

impl ConfirmationSolicitor {
    pub fn new(
        constants: &NetworkConstants,
        fanout: usize,
        roster: Option<Arc<PeerRoster>>,
    ) -> ConfirmationSolicitor {
        ConfirmationSolicitor {
            max_confirm_req_batches: if constants.is_test_network() {
                1
            } else {
                20
            },
            max_block_broadcasts: if constants.is_test_network() {
                4
            } else {
                30
            },
            max_election_requests: 30,
            max_election_broadcasts: (fanout / 2).max(1),
            roster,
            representatives_requests: Vec::new(),
            representatives_broadcasts: Vec::new(),
            requests: HashMap::new(),
            rebroadcasted: 0,
            prepared: false,
        }
    }

    /// Prepare object for batching election confirmation requests
    pub fn prepare(&mut self, representatives: &[Representative]) {
        debug_assert!(!self.prepared);
        self.requests.clear();
        self.rebroadcasted = 0;
        // Two copies are required as representatives can be erased from the
        // requests set when their queue fills
        self.representatives_requests = representatives.to_vec();
        self.representatives_broadcasts = representatives.to_vec();
        self.prepared = true;
    }

    /// Broadcast the winner of an election if the broadcast limit has not
    /// been reached. Returns false if the broadcast was performed.
    pub fn broadcast(&mut self, election: &Election) -> bool {
        debug_assert!(self.prepared);
        if self.rebroadcasted >= self.max_block_broadcasts {
            return true
        }
        self.rebroadcasted += 1;
        let hash = election.winner.hash();
        let winner = Message::Publish(election.winner.as_ref().clone());
        let mut count = 0;
        // Directed broadcasting to principal representatives
        for representative in &self.representatives_broadcasts {
            if count >= self.max_election_broadcasts {
                break
            }
            let voted_for_winner =
                election.last_votes.get(&representative.account).map(|info| info.hash == hash).unwrap_or(false);
            if !voted_for_winner {
                representative.channel.send(&winner);
                count += 1;
            }
        }
        // Random flood for block propagation
        if let Some(roster) = &self.roster {
            roster.flood(&winner, BROADCAST_FLOOD_SCALE);
        }
        false
    }

    /// Add an election that needs to be confirmed. Returns false if
    /// successfully added.
    pub fn add(&mut self, election: &Election) -> bool {
        debug_assert!(self.prepared);
        let max_channel_requests = self.max_confirm_req_batches * CONFIRM_REQ_HASHES_MAX;
        let hash = election.winner.hash();
        let root = election.winner.root();
        let mut count = 0;
        let mut index = 0;
        while index < self.representatives_requests.len() && count < self.max_election_requests {
            let representative = &self.representatives_requests[index];
            let voted_for_winner =
                election.last_votes.get(&representative.account).map(|info| info.hash == hash).unwrap_or(false);
            let mut full_queue = false;
            if !voted_for_winner {
                let endpoint = representative.channel.endpoint();
                let entry = self
                    .requests
                    .entry(endpoint)
                    .or_insert_with(|| (Arc::clone(&representative.channel), Vec::new()));
                if entry.1.len() < max_channel_requests {
                    entry.1.push((hash, root));
                    count += 1;
                } else {
                    full_queue = true;
                }
            }
            if full_queue {
                self.representatives_requests.remove(index);
            } else {
                index += 1;
            }
        }
        count == 0
    }

    /// Dispatch bundled requests to each channel
    pub fn flush(&mut self) {
        debug_assert!(self.prepared);
        for (channel, hashes_roots) in self.requests.values() {
            let mut batch = Vec::with_capacity(CONFIRM_REQ_HASHES_MAX);
            for hash_root in hashes_roots {
                batch.push(*hash_root);
                if batch.len() == CONFIRM_REQ_HASHES_MAX {
                    channel.send(&Message::ConfirmReq(std::mem::take(&mut batch)));
                }
            }
            if !batch.is_empty() {
                channel.send(&Message::ConfirmReq(batch));
            }
        }
        self.prepared = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use lnetwork::LoopbackChannel;
    use ltypes::{Amount, Vote};

    use super::*;
    use crate::election::VoteInfo;
    use crate::testing::LedgerContext;

    fn representative(port: u16, account: ltypes::Account) -> (Representative, Arc<LoopbackChannel>) {
        let channel = Arc::new(LoopbackChannel::new(port));
        (
            Representative {
                account,
                channel: Arc::clone(&channel) as Arc<dyn Channel>,
            },
            channel,
        )
    }

    fn election_for(ctx: &LedgerContext) -> Election {
        let key = LedgerContext::keypair(10);
        let send = ctx.legacy_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        let mut blocks = HashMap::new();
        blocks.insert(send.hash(), Arc::clone(&send));
        Election {
            root: send.root(),
            winner: send,
            blocks,
            last_votes: HashMap::new(),
            confirmed: false,
            election_start: Instant::now(),
        }
    }

    #[test]
    fn flush_packs_batches_of_seven() {
        let ctx = LedgerContext::new();
        let constants = ctx.ledger.constants.clone();
        let (rep, channel) = representative(7000, *LedgerContext::keypair(50).public());
        let mut solicitor = ConfirmationSolicitor::new(&constants, 2, None);
        // Test networks allow one batch of seven per channel
        assert_eq!(solicitor.max_confirm_req_batches, 1);
        solicitor.prepare(&[rep]);
        let election = election_for(&ctx);
        assert!(!solicitor.add(&election));
        solicitor.flush();
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::ConfirmReq(pairs) => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0], (election.winner.hash(), election.winner.root()));
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn reps_that_voted_for_the_winner_are_skipped() {
        let ctx = LedgerContext::new();
        let constants = ctx.ledger.constants.clone();
        let voter = LedgerContext::keypair(50);
        let (rep, channel) = representative(7001, *voter.public());
        let mut solicitor = ConfirmationSolicitor::new(&constants, 2, None);
        solicitor.prepare(&[rep]);
        let mut election = election_for(&ctx);
        let vote = Vote::new(&voter, 1, vec![election.winner.hash()]);
        election.last_votes.insert(vote.account, VoteInfo {
            time: Instant::now(),
            sequence: 1,
            hash: election.winner.hash(),
        });
        // Broadcast skips them and add has no one left to ask
        assert!(!solicitor.broadcast(&election));
        assert!(solicitor.add(&election));
        solicitor.flush();
        assert_eq!(channel.sent_count(), 0);
    }

    #[test]
    fn broadcast_respects_global_limit() {
        let ctx = LedgerContext::new();
        let constants = ctx.ledger.constants.clone();
        let (rep, channel) = representative(7002, *LedgerContext::keypair(50).public());
        let mut solicitor = ConfirmationSolicitor::new(&constants, 2, None);
        solicitor.prepare(&[rep]);
        let election = election_for(&ctx);
        for _ in 0..solicitor.max_block_broadcasts {
            assert!(!solicitor.broadcast(&election));
        }
        // Limit reached
        assert!(solicitor.broadcast(&election));
        assert_eq!(channel.sent_count(), solicitor.max_block_broadcasts);
        solicitor.flush();
    }

    #[test]
    fn broadcast_floods_half_the_roster() {
        let ctx = LedgerContext::new();
        let constants = ctx.ledger.constants.clone();
        let roster = Arc::new(PeerRoster::new());
        let peers: Vec<Arc<LoopbackChannel>> = (0..4)
            .map(|i| {
                let channel = Arc::new(LoopbackChannel::new(7100 + i));
                roster.add(Arc::clone(&channel) as Arc<dyn Channel>);
                channel
            })
            .collect();
        let (rep, rep_channel) = representative(7003, *LedgerContext::keypair(50).public());
        let mut solicitor = ConfirmationSolicitor::new(&constants, 2, Some(Arc::clone(&roster)));
        solicitor.prepare(&[rep]);
        let election = election_for(&ctx);
        assert!(!solicitor.broadcast(&election));
        // The directed send plus a random half of the roster
        assert_eq!(rep_channel.sent_count(), 1);
        let flooded: usize = peers.iter().map(|channel| channel.sent_count()).sum();
        assert_eq!(flooded, roster.fanout(0.5));
        for peer in &peers {
            for message in peer.sent() {
                assert_eq!(message, Message::Publish(election.winner.as_ref().clone()));
            }
        }
        // Past the limit nothing floods either
        for _ in 0..solicitor.max_block_broadcasts {
            solicitor.broadcast(&election);
        }
        let after_limit: usize = peers.iter().map(|channel| channel.sent_count()).sum();
        assert_eq!(after_limit, roster.fanout(0.5) * solicitor.max_block_broadcasts);
        solicitor.flush();
    }
}
