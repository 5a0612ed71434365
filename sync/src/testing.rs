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

//! In-process bootstrap counterparties serving straight from a ledger,
//! standing in for remote nodes in tests and single-machine setups.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use lcore::testing::LedgerContext;
use lcore::{BlockProcessor, GapCache, Ledger, NodeConfig, OnlineReps, SignatureChecker, WriteDatabaseQueue};
use ltypes::{Account, Amount, Block, BlockHash, HashOrAccount, PendingInfo, PendingKey};
use parking_lot::Mutex;

use crate::peer::{BlockStream, BootstrapPeer, FrontierStream, PeerConnector, PeerError, PendingStream};

pub fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
}

struct VecFrontierStream {
    frontiers: VecDeque<(Account, BlockHash)>,
}

impl FrontierStream for VecFrontierStream {
    fn next_frontier(&mut self) -> Result<Option<(Account, BlockHash)>, PeerError> {
        Ok(self.frontiers.pop_front())
    }
}

struct VecBlockStream {
    blocks: VecDeque<Arc<Block>>,
}

impl BlockStream for VecBlockStream {
    fn next_block(&mut self) -> Result<Option<Arc<Block>>, PeerError> {
        Ok(self.blocks.pop_front())
    }
}

struct VecPendingStream {
    pending: VecDeque<(PendingKey, PendingInfo)>,
}

impl PendingStream for VecPendingStream {
    fn next_pending(&mut self) -> Result<Option<(PendingKey, PendingInfo)>, PeerError> {
        Ok(self.pending.pop_front())
    }
}

/// A bootstrap peer answering every request from its own ledger
pub struct LedgerPeer {
    pub ledger: Arc<Ledger>,
    endpoint: SocketAddr,
    pub pushed: Mutex<Vec<Arc<Block>>>,
}

impl LedgerPeer {
    pub fn new(ledger: Arc<Ledger>, port: u16) -> Arc<LedgerPeer> {
        Arc::new(LedgerPeer {
            ledger,
            endpoint: endpoint(port),
            pushed: Mutex::new(Vec::new()),
        })
    }
}

impl BootstrapPeer for LedgerPeer {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn frontier_req(&self, start: Account, _age_seconds: u32, count: u32) -> Result<Box<dyn FrontierStream>, PeerError> {
        let tx = self.ledger.store.tx_begin_read();
        let frontiers: VecDeque<(Account, BlockHash)> = self
            .ledger
            .store
            .accounts(&tx)
            .into_iter()
            .filter(|(account, _)| *account >= start)
            .take(count as usize)
            .map(|(account, info)| (account, info.head))
            .collect();
        Ok(Box::new(VecFrontierStream {
            frontiers,
        }))
    }

    fn bulk_pull(&self, start: HashOrAccount, end: BlockHash, count: u32) -> Result<Box<dyn BlockStream>, PeerError> {
        let tx = self.ledger.store.tx_begin_read();
        let head = match self.ledger.store.account_get(&tx, &start) {
            Some(info) => info.head,
            None => start,
        };
        let mut blocks = VecDeque::new();
        let mut current = head;
        while !current.is_zero() && current != end {
            if count != 0 && blocks.len() >= count as usize {
                break
            }
            match self.ledger.store.block_get(&tx, &current) {
                Some((block, _)) => {
                    current = block.previous();
                    blocks.push_back(block);
                }
                None => break,
            }
        }
        Ok(Box::new(VecBlockStream {
            blocks,
        }))
    }

    fn bulk_pull_account(&self, account: Account, minimum: Amount) -> Result<Box<dyn PendingStream>, PeerError> {
        let tx = self.ledger.store.tx_begin_read();
        let pending: VecDeque<(PendingKey, PendingInfo)> = self
            .ledger
            .store
            .pending_for_account(&tx, &account)
            .into_iter()
            .filter(|(_, info)| info.amount >= minimum)
            .collect();
        Ok(Box::new(VecPendingStream {
            pending,
        }))
    }

    fn bulk_push(&self, blocks: Vec<Arc<Block>>) -> Result<(), PeerError> {
        self.pushed.lock().extend(blocks);
        Ok(())
    }

    fn disconnect(&self) {}
}

/// A peer refusing every request, for failure-path tests
pub struct FailingPeer {
    endpoint: SocketAddr,
}

impl FailingPeer {
    pub fn new(port: u16) -> Arc<FailingPeer> {
        Arc::new(FailingPeer {
            endpoint: endpoint(port),
        })
    }
}

impl BootstrapPeer for FailingPeer {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn frontier_req(&self, _: Account, _: u32, _: u32) -> Result<Box<dyn FrontierStream>, PeerError> {
        Err(PeerError::Disconnected)
    }

    fn bulk_pull(&self, _: HashOrAccount, _: BlockHash, _: u32) -> Result<Box<dyn BlockStream>, PeerError> {
        Err(PeerError::Disconnected)
    }

    fn bulk_pull_account(&self, _: Account, _: Amount) -> Result<Box<dyn PendingStream>, PeerError> {
        Err(PeerError::Disconnected)
    }

    fn bulk_push(&self, _: Vec<Arc<Block>>) -> Result<(), PeerError> {
        Err(PeerError::Disconnected)
    }

    fn disconnect(&self) {}
}

/// Connector over a fixed peer table, optionally refusing the first few
/// connection attempts
pub struct StaticConnector {
    peers: Mutex<HashMap<SocketAddr, Arc<dyn BootstrapPeer>>>,
    refuse_first: AtomicUsize,
}

impl StaticConnector {
    pub fn new() -> Arc<StaticConnector> {
        Arc::new(StaticConnector {
            peers: Mutex::new(HashMap::new()),
            refuse_first: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, peer: Arc<dyn BootstrapPeer>) {
        self.peers.lock().insert(peer.endpoint(), peer);
    }

    pub fn refuse_next(&self, count: usize) {
        self.refuse_first.store(count, AtomicOrdering::SeqCst);
    }
}

impl PeerConnector for StaticConnector {
    fn connect(&self, endpoint: SocketAddr) -> Result<Arc<dyn BootstrapPeer>, PeerError> {
        let remaining = self.refuse_first.load(AtomicOrdering::SeqCst);
        if remaining > 0 {
            self.refuse_first.store(remaining - 1, AtomicOrdering::SeqCst);
            return Err(PeerError::ConnectionRefused)
        }
        self.peers.lock().get(&endpoint).cloned().ok_or(PeerError::ConnectionRefused)
    }

    fn candidate_endpoints(&self) -> Vec<SocketAddr> {
        self.peers.lock().keys().copied().collect()
    }
}

/// Everything a bootstrapping node under test needs: a ledger context plus
/// a wired block processor
pub struct NodeFixture {
    pub ctx: LedgerContext,
    pub processor: Arc<BlockProcessor>,
    pub config: NodeConfig,
}

impl NodeFixture {
    pub fn new() -> NodeFixture {
        let ctx = LedgerContext::new();
        let config = NodeConfig::test_default();
        let write_queue = Arc::new(WriteDatabaseQueue::new());
        let online_reps =
            Arc::new(OnlineReps::new(Arc::clone(&ctx.ledger), config.online_weight_minimum, config.max_weight_samples));
        let alarm = Arc::new(ltimer::Alarm::new());
        let gap_cache = Arc::new(GapCache::new(Arc::clone(&ctx.ledger), online_reps, alarm, config.clone()));
        let checker = Arc::new(SignatureChecker::new(0));
        let processor =
            BlockProcessor::new(Arc::clone(&ctx.ledger), write_queue, gap_cache, checker, config.clone());
        NodeFixture {
            ctx,
            processor,
            config,
        }
    }
}

impl Default for NodeFixture {
    fn default() -> NodeFixture {
        NodeFixture::new()
    }
}
