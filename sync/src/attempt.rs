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

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lcore::{BlockProcessor, Ledger, NodeConfig};
use lnetwork::PeerExclusion;
use ltypes::{Account, Block, HashOrAccount};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::connections::{BootstrapConnections, PullInfo};
use crate::lazy::LazyAttempt;
use crate::legacy::LegacyAttempt;
use crate::peer::PeerConnector;
use crate::wallet::WalletAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Legacy,
    Lazy,
    WalletLazy,
}

/// State shared by every attempt variant: pull accounting, lifecycle flags
/// and the condition the attempt thread parks on.
pub struct BootstrapAttempt {
    pub ledger: Arc<Ledger>,
    pub block_processor: Arc<BlockProcessor>,
    pub config: NodeConfig,
    pub mode: BootstrapMode,
    pub incremental_id: u64,
    pub id: String,
    pub pulling: AtomicU32,
    pub total_blocks: AtomicU64,
    pub requeued_pulls: AtomicU32,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub attempt_start: Instant,
    pub mutex: Mutex<()>,
    pub condition: Condvar,
}

impl BootstrapAttempt {
    pub fn new(
        ledger: Arc<Ledger>,
        block_processor: Arc<BlockProcessor>,
        config: NodeConfig,
        mode: BootstrapMode,
        incremental_id: u64,
        id: String,
    ) -> BootstrapAttempt {
        let id = if id.is_empty() {
            format!("{:016x}", rand::thread_rng().gen::<u64>())
        } else {
            id
        };
        linfo!(SYNC, "Starting bootstrap attempt {} ({:?})", id, mode);
        BootstrapAttempt {
            ledger,
            block_processor,
            config,
            mode,
            incremental_id,
            id,
            pulling: AtomicU32::new(0),
            total_blocks: AtomicU64::new(0),
            requeued_pulls: AtomicU32::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            attempt_start: Instant::now(),
            mutex: Mutex::new(()),
            condition: Condvar::new(),
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::SeqCst)
    }

    pub fn still_pulling(&self) -> bool {
        self.pulling.load(AtomicOrdering::SeqCst) > 0
    }

    pub fn pull_started(&self) {
        self.pulling.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn pull_finished(&self) {
        self.pulling.fetch_sub(1, AtomicOrdering::SeqCst);
        self.condition.notify_all();
    }

    /// Parks until all outstanding pulls finish or the attempt stops
    pub fn wait_for_pulls(&self) {
        let mut guard = self.mutex.lock();
        while !self.stopped() && self.still_pulling() {
            self.condition.wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.condition.notify_all();
    }
}

/// The three attempt variants share this contract; `run` drives the whole
/// catch-up on a dedicated thread and `process_block` receives every pulled
/// block before it reaches the block processor.
pub trait BootstrapStrategy: Send + Sync {
    fn attempt(&self) -> &BootstrapAttempt;
    fn mode_text(&self) -> &'static str;
    fn run(self: Arc<Self>, connections: Arc<BootstrapConnections>);
    /// Returns true when the current pull should stop early
    fn process_block(
        &self,
        block: Arc<Block>,
        known_account: &Account,
        pull_blocks: u64,
        max_blocks: u32,
        block_expected: bool,
        retry_limit: u32,
    ) -> bool;
    /// A pull was dropped after exhausting its retries
    fn pull_dropped(&self, pull: &PullInfo);
    /// Seeds a running lazy attempt with another start hash; other modes
    /// ignore it
    fn lazy_start(&self, hash: &HashOrAccount) {
        let _ = hash;
    }
}

/// Owns the connection pool and the attempt threads. Lazy, legacy and
/// wallet attempts run in parallel with the live path but write through the
/// same block processor.
pub struct BootstrapInitiator {
    ledger: Arc<Ledger>,
    block_processor: Arc<BlockProcessor>,
    config: NodeConfig,
    pub connections: Arc<BootstrapConnections>,
    attempts: Mutex<Vec<Arc<dyn BootstrapStrategy>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    incremental: AtomicU64,
}

impl BootstrapInitiator {
    pub fn new(
        ledger: Arc<Ledger>,
        block_processor: Arc<BlockProcessor>,
        connector: Arc<dyn PeerConnector>,
        exclusion: Arc<PeerExclusion>,
        config: NodeConfig,
    ) -> Arc<BootstrapInitiator> {
        let connections = BootstrapConnections::new(connector, exclusion, config.clone());
        connections.start();
        Arc::new(BootstrapInitiator {
            ledger,
            block_processor,
            config,
            connections,
            attempts: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            incremental: AtomicU64::new(0),
        })
    }

    fn next_id(&self) -> u64 {
        self.incremental.fetch_add(1, AtomicOrdering::SeqCst)
    }

    fn spawn(&self, strategy: Arc<dyn BootstrapStrategy>) {
        self.attempts.lock().push(Arc::clone(&strategy));
        let connections = Arc::clone(&self.connections);
        let handle = thread::Builder::new()
            .name(format!("bootstrap {}", strategy.mode_text()))
            .spawn(move || {
                let for_run = Arc::clone(&strategy);
                for_run.run(connections);
                strategy.attempt().stop();
            })
            .unwrap();
        self.threads.lock().push(handle);
    }

    /// Starts a legacy frontier-diff attempt unless one is already running
    pub fn bootstrap(&self) {
        if self.in_progress_mode(BootstrapMode::Legacy) {
            return
        }
        let attempt = BootstrapAttempt::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.block_processor),
            self.config.clone(),
            BootstrapMode::Legacy,
            self.next_id(),
            String::new(),
        );
        self.spawn(Arc::new(LegacyAttempt::new(attempt)));
    }

    /// Starts a lazy hash-chasing attempt seeded with `hash`
    pub fn bootstrap_lazy(&self, hash: HashOrAccount, force: bool) -> bool {
        if !force && self.in_progress_mode(BootstrapMode::Lazy) {
            // Feed the running attempt instead of starting another
            for strategy in self.attempts.lock().iter() {
                if strategy.attempt().mode == BootstrapMode::Lazy && !strategy.attempt().stopped() {
                    strategy.lazy_start(&hash);
                }
            }
            return false
        }
        let attempt = BootstrapAttempt::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.block_processor),
            self.config.clone(),
            BootstrapMode::Lazy,
            self.next_id(),
            String::new(),
        );
        self.spawn(Arc::new(LazyAttempt::new(attempt, hash)));
        true
    }

    /// Starts a wallet attempt fetching pending receives for `accounts`
    pub fn bootstrap_wallet(&self, accounts: Vec<Account>) {
        if accounts.is_empty() {
            return
        }
        let attempt = BootstrapAttempt::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.block_processor),
            self.config.clone(),
            BootstrapMode::WalletLazy,
            self.next_id(),
            String::new(),
        );
        self.spawn(Arc::new(WalletAttempt::new(attempt, accounts)));
    }

    pub fn in_progress(&self) -> bool {
        self.attempts.lock().iter().any(|strategy| !strategy.attempt().stopped())
    }

    fn in_progress_mode(&self, mode: BootstrapMode) -> bool {
        self.attempts.lock().iter().any(|strategy| strategy.attempt().mode == mode && !strategy.attempt().stopped())
    }

    /// Blocks until every spawned attempt has run to completion
    pub fn join(&self) {
        for handle in self.threads.lock().drain(..) {
            handle.join().unwrap();
        }
    }

    pub fn stop(&self) {
        for strategy in self.attempts.lock().iter() {
            strategy.attempt().stop();
        }
        self.connections.stop();
        self.join();
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().len()
    }
}

/// Blocks per lazy pull before the pull is re-queued for continuation
pub const LAZY_MAX_PULL_BLOCKS: u32 = 512;
/// The maximum number of records drained while iterating over long lazy
/// containers
pub const BATCH_READ_SIZE: usize = 256;

#[cfg(test)]
mod tests {
    use ltypes::{Amount, BlockHash, PendingKey};

    use super::*;
    use crate::testing::{LedgerPeer, NodeFixture, StaticConnector};
    use lcore::testing::LedgerContext;

    fn wait_until<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !predicate() {
            assert!(Instant::now() < deadline, "Timed out waiting for condition");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn initiator_for(fixture: &NodeFixture, connector: Arc<StaticConnector>) -> Arc<BootstrapInitiator> {
        BootstrapInitiator::new(
            Arc::clone(&fixture.ctx.ledger),
            Arc::clone(&fixture.processor),
            connector,
            Arc::new(PeerExclusion::new()),
            fixture.config.clone(),
        )
    }

    #[test]
    fn legacy_pulls_divergent_frontiers() {
        // The source node has history the fresh target lacks
        let source = LedgerContext::new();
        let k1 = LedgerContext::keypair(10);
        let k2 = LedgerContext::keypair(11);
        let send_1 = source.legacy_send(&source.genesis_key, *k1.public(), Amount::from(5u64));
        source.process_ok(&send_1);
        let open_1 = source.legacy_open(&k1, &send_1.hash(), *k1.public());
        source.process_ok(&open_1);
        let send_2 = source.legacy_send(&source.genesis_key, *k2.public(), Amount::from(3u64));
        source.process_ok(&send_2);

        let target = NodeFixture::new();
        let connector = StaticConnector::new();
        connector.insert(LedgerPeer::new(Arc::clone(&source.ledger), 7500));
        let initiator = initiator_for(&target, connector);
        initiator.bootstrap();
        wait_until(|| !initiator.in_progress());
        initiator.stop();

        let tx = target.ctx.ledger.store.tx_begin_read();
        for block in [&send_1, &open_1, &send_2] {
            assert!(target.ctx.ledger.block_exists(&tx, &block.hash()), "missing {:?}", block.hash());
        }
        let genesis_info =
            target.ctx.ledger.store.account_get(&tx, target.ctx.genesis_key.public()).unwrap();
        assert_eq!(genesis_info.head, send_2.hash());
        let k1_info = target.ctx.ledger.store.account_get(&tx, k1.public()).unwrap();
        assert_eq!(k1_info.head, open_1.hash());
        target.processor.stop();
    }

    #[test]
    fn legacy_pushes_what_the_peer_lacks() {
        // This node is ahead of its only peer
        let node = NodeFixture::new();
        let k1 = LedgerContext::keypair(10);
        let extra = node.ctx.legacy_send(&node.ctx.genesis_key, *k1.public(), Amount::from(2u64));
        node.ctx.process_ok(&extra);

        let behind = LedgerContext::new();
        let connector = StaticConnector::new();
        let peer = LedgerPeer::new(Arc::clone(&behind.ledger), 7501);
        connector.insert(Arc::clone(&peer) as Arc<dyn crate::peer::BootstrapPeer>);
        let initiator = initiator_for(&node, connector);
        initiator.bootstrap();
        wait_until(|| !initiator.in_progress());
        initiator.stop();

        let pushed = peer.pushed.lock();
        assert!(pushed.iter().any(|block| block.hash() == extra.hash()));
        node.processor.stop();
    }

    #[test]
    fn lazy_chases_links_to_closure() {
        let source = LedgerContext::new();
        let k1 = LedgerContext::keypair(10);
        let send = source.state_send(&source.genesis_key, *k1.public(), Amount::from(5u64));
        source.process_ok(&send);
        let receive = source.state_receive(&k1, &send.hash(), Amount::from(5u64));
        source.process_ok(&receive);

        let target = NodeFixture::new();
        let connector = StaticConnector::new();
        connector.insert(LedgerPeer::new(Arc::clone(&source.ledger), 7502));
        let initiator = initiator_for(&target, connector);
        // Seeded with only the receive hash; the send is discovered through
        // its link
        assert!(initiator.bootstrap_lazy(receive.hash(), false));
        wait_until(|| !initiator.in_progress());
        initiator.stop();

        let tx = target.ctx.ledger.store.tx_begin_read();
        assert!(target.ctx.ledger.block_exists(&tx, &send.hash()));
        assert!(target.ctx.ledger.block_exists(&tx, &receive.hash()));
        target.processor.stop();
    }

    #[test]
    fn wallet_fetches_pending_sends() {
        let source = LedgerContext::new();
        let k1 = LedgerContext::keypair(10);
        let send = source.legacy_send(&source.genesis_key, *k1.public(), Amount::from(4u64));
        source.process_ok(&send);

        let target = NodeFixture::new();
        let connector = StaticConnector::new();
        connector.insert(LedgerPeer::new(Arc::clone(&source.ledger), 7503));
        let initiator = initiator_for(&target, connector);
        initiator.bootstrap_wallet(vec![*k1.public()]);
        wait_until(|| !initiator.in_progress());
        initiator.stop();

        let tx = target.ctx.ledger.store.tx_begin_read();
        assert!(target.ctx.ledger.block_exists(&tx, &send.hash()));
        assert!(target.ctx.ledger.store.pending_exists(&tx, &PendingKey::new(*k1.public(), send.hash())));
        target.processor.stop();
    }

    #[test]
    fn exhausted_pulls_are_dropped() {
        let target = NodeFixture::new();
        let connector = StaticConnector::new();
        connector.insert(crate::testing::FailingPeer::new(7504) as Arc<dyn crate::peer::BootstrapPeer>);
        let initiator = initiator_for(&target, connector);
        // Every bulk pull against the failing peer errors out and burns an
        // attempt until the retry limit drops the pull
        assert!(initiator.bootstrap_lazy(BlockHash::from_low_u64_be(42), false));
        wait_until(|| !initiator.in_progress());
        let requeued = {
            let attempts = initiator.attempts.lock();
            attempts[0].attempt().requeued_pulls.load(AtomicOrdering::SeqCst)
        };
        assert!(requeued >= 1);
        initiator.stop();
        target.processor.stop();
    }
}
