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
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use lcore::NodeConfig;
use lnetwork::PeerExclusion;
use ltypes::{BlockHash, HashOrAccount};
use parking_lot::{Condvar, Mutex};

use crate::attempt::BootstrapStrategy;
use crate::peer::{BootstrapPeer, PeerConnector};
use crate::pull::BulkPullClient;

/// How many queued pulls justify one more outbound connection
const PULLS_PER_CONNECTION: usize = 25;

/// One account- or hash-scoped download work item. Owned by the
/// connections queue; its lifetime is tied to the issuing attempt.
#[derive(Debug, Clone)]
pub struct PullInfo {
    pub account_or_head: HashOrAccount,
    /// Next expected block hash, moving toward `end` as the pull resumes
    pub head: BlockHash,
    pub head_original: BlockHash,
    pub end: BlockHash,
    /// 0 means unbounded
    pub count: u32,
    pub attempts: u32,
    pub processed: u64,
    pub retry_limit: u32,
    pub bootstrap_id: u64,
}

impl PullInfo {
    pub fn new(
        account_or_head: HashOrAccount,
        head: BlockHash,
        end: BlockHash,
        count: u32,
        retry_limit: u32,
        bootstrap_id: u64,
    ) -> PullInfo {
        PullInfo {
            account_or_head,
            head,
            head_original: head,
            end,
            count,
            attempts: 0,
            processed: 0,
            retry_limit,
            bootstrap_id,
        }
    }
}

/// An established peer wrapped with transfer accounting
pub struct BootstrapClient {
    pub peer: Arc<dyn BootstrapPeer>,
    pub block_count: AtomicU64,
    pub pending_stop: AtomicBool,
    pub hard_stop: AtomicBool,
    start_time: Mutex<Instant>,
}

impl BootstrapClient {
    pub fn new(peer: Arc<dyn BootstrapPeer>) -> Arc<BootstrapClient> {
        Arc::new(BootstrapClient {
            peer,
            block_count: AtomicU64::new(0),
            pending_stop: AtomicBool::new(false),
            hard_stop: AtomicBool::new(false),
            start_time: Mutex::new(Instant::now()),
        })
    }

    pub fn set_start_time(&self) {
        *self.start_time.lock() = Instant::now();
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.lock().elapsed().as_secs_f64()
    }

    pub fn block_rate(&self) -> f64 {
        let elapsed = self.elapsed_seconds().max(f64::EPSILON);
        self.block_count.load(AtomicOrdering::Relaxed) as f64 / elapsed
    }

    pub fn stop(&self, force: bool) {
        self.pending_stop.store(true, AtomicOrdering::SeqCst);
        if force {
            self.hard_stop.store(true, AtomicOrdering::SeqCst);
            self.peer.disconnect();
        }
    }
}

struct PoolState {
    pulls: VecDeque<(PullInfo, Arc<dyn BootstrapStrategy>)>,
    idle: VecDeque<Arc<BootstrapClient>>,
    clients: Vec<Weak<BootstrapClient>>,
    stopped: bool,
}

/// Shared pool of outbound bootstrap connections, multiplexing the pull
/// queues of every running attempt over them
pub struct BootstrapConnections {
    connector: Arc<dyn PeerConnector>,
    exclusion: Arc<PeerExclusion>,
    config: NodeConfig,
    state: Mutex<PoolState>,
    condition: Condvar,
    pub connections_count: AtomicUsize,
    attempts_count: AtomicUsize,
    populate_started: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl BootstrapConnections {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        exclusion: Arc<PeerExclusion>,
        config: NodeConfig,
    ) -> Arc<BootstrapConnections> {
        Arc::new(BootstrapConnections {
            connector,
            exclusion,
            config,
            state: Mutex::new(PoolState {
                pulls: VecDeque::new(),
                idle: VecDeque::new(),
                clients: Vec::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            connections_count: AtomicUsize::new(0),
            attempts_count: AtomicUsize::new(0),
            populate_started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the populate loop and the pull dispatch loop
    pub fn start(self: &Arc<Self>) {
        if self.populate_started.swap(true, AtomicOrdering::SeqCst) {
            return
        }
        let mut threads = self.threads.lock();
        {
            let this = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name("bootstrap conn".to_string())
                    .spawn(move || this.populate_connections_loop())
                    .unwrap(),
            );
        }
        {
            let this = Arc::clone(self);
            threads.push(
                thread::Builder::new().name("bootstrap pulls".to_string()).spawn(move || this.dispatch_loop()).unwrap(),
            );
        }
    }

    pub fn attempt_started(&self) {
        self.attempts_count.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn attempt_stopped(&self) {
        self.attempts_count.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    pub fn target_connections(&self, pulls_remaining: usize, attempts_count: usize) -> usize {
        if attempts_count == 0 && pulls_remaining == 0 {
            return 0
        }
        let wanted = (pulls_remaining + PULLS_PER_CONNECTION - 1) / PULLS_PER_CONNECTION;
        self.config.bootstrap_connections_max.min(wanted.max(1))
    }

    fn populate_connections_loop(self: Arc<Self>) {
        let interval = if self.config.network.is_test_network() {
            Duration::from_millis(20)
        } else {
            Duration::from_secs(1)
        };
        loop {
            {
                let state = self.state.lock();
                if state.stopped {
                    break
                }
            }
            self.populate_connections();
            let mut state = self.state.lock();
            if state.stopped {
                break
            }
            self.condition.wait_for(&mut state, interval);
        }
    }

    /// Opens outbound connections up to the current target, skipping
    /// excluded and already-connected peers
    pub fn populate_connections(&self) {
        let (pulls_remaining, connected): (usize, Vec<std::net::SocketAddr>) = {
            let mut state = self.state.lock();
            state.clients.retain(|client| client.upgrade().is_some());
            (
                state.pulls.len(),
                state
                    .clients
                    .iter()
                    .filter_map(|client| client.upgrade())
                    .map(|client| client.peer.endpoint())
                    .collect(),
            )
        };
        let target = self.target_connections(pulls_remaining, self.attempts_count.load(AtomicOrdering::SeqCst));
        let mut count = self.connections_count.load(AtomicOrdering::SeqCst);
        if count >= target {
            return
        }
        for endpoint in self.connector.candidate_endpoints() {
            if count >= target {
                break
            }
            if connected.contains(&endpoint) || self.exclusion.check(&endpoint) {
                continue
            }
            match self.connector.connect(endpoint) {
                Ok(peer) => {
                    let client = BootstrapClient::new(peer);
                    {
                        let mut state = self.state.lock();
                        state.clients.push(Arc::downgrade(&client));
                    }
                    self.connections_count.fetch_add(1, AtomicOrdering::SeqCst);
                    count += 1;
                    self.pool_connection(client);
                }
                Err(error) => {
                    ldebug!(SYNC, "Could not connect to bootstrap peer {}: {:?}", endpoint, error);
                    self.exclusion.add(&endpoint, connected.len());
                }
            }
        }
    }

    /// Returns an idle connection, waiting until one is pooled or the pool
    /// stops
    pub fn connection(&self) -> Option<Arc<BootstrapClient>> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None
            }
            if let Some(client) = state.idle.pop_back() {
                return Some(client)
            }
            self.condition.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    /// Idle clients park LIFO so hot connections are reused first
    pub fn pool_connection(&self, client: Arc<BootstrapClient>) {
        {
            let mut state = self.state.lock();
            if state.stopped || client.pending_stop.load(AtomicOrdering::SeqCst) {
                client.peer.disconnect();
                self.connections_count.fetch_sub(1, AtomicOrdering::SeqCst);
            } else {
                state.idle.push_back(client);
            }
        }
        self.condition.notify_all();
    }

    pub fn drop_connection(&self, client: Arc<BootstrapClient>) {
        client.peer.disconnect();
        self.connections_count.fetch_sub(1, AtomicOrdering::SeqCst);
        drop(client);
        self.condition.notify_all();
    }

    /// Queued pulls count as in flight for the issuing attempt until their
    /// client reports back
    pub fn add_pull(&self, pull: PullInfo, strategy: Arc<dyn BootstrapStrategy>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return
            }
            strategy.attempt().pull_started();
            state.pulls.push_back((pull, strategy));
        }
        self.condition.notify_all();
    }

    pub fn pulls_len(&self) -> usize {
        self.state.lock().pulls.len()
    }

    /// Failed pulls move toward the retry limit and preferably run on a
    /// different peer afterwards
    pub fn requeue_pull(&self, mut pull: PullInfo, strategy: Arc<dyn BootstrapStrategy>, network_error: bool) {
        pull.attempts += 1;
        strategy.attempt().requeued_pulls.fetch_add(1, AtomicOrdering::SeqCst);
        if pull.attempts <= pull.retry_limit {
            let mut state = self.state.lock();
            if state.stopped {
                return
            }
            strategy.attempt().pull_started();
            if network_error {
                // Bias toward a fresh connection by parking it behind the
                // other queued pulls
                state.pulls.push_back((pull, strategy));
            } else {
                state.pulls.push_front((pull, strategy));
            }
            drop(state);
            self.condition.notify_all();
        } else {
            lwarn!(
                SYNC,
                "Dropping pull of {:?} after {} attempts and {} blocks processed",
                pull.account_or_head,
                pull.attempts,
                pull.processed
            );
            strategy.pull_dropped(&pull);
        }
    }

    fn dispatch_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                loop {
                    if state.stopped {
                        return
                    }
                    if !state.pulls.is_empty() && !state.idle.is_empty() {
                        let client = state.idle.pop_back().expect("Checked nonempty");
                        let (pull, strategy) = state.pulls.pop_front().expect("Checked nonempty");
                        break Some((client, pull, strategy))
                    }
                    self.condition.wait_for(&mut state, Duration::from_millis(100));
                }
            };
            if let Some((client, pull, strategy)) = next {
                let this = Arc::clone(&self);
                thread::Builder::new()
                    .name("bulk pull".to_string())
                    .spawn(move || {
                        let bulk_pull = BulkPullClient::new(Arc::clone(&client), Arc::clone(&strategy), pull);
                        let result = bulk_pull.request();
                        strategy.attempt().pull_finished();
                        match result {
                            Ok(()) => this.pool_connection(client),
                            Err((pull, network_error)) => {
                                if network_error {
                                    this.drop_connection(client);
                                } else {
                                    this.pool_connection(client);
                                }
                                this.requeue_pull(pull, strategy, network_error);
                            }
                        }
                    })
                    .unwrap();
            }
        }
    }

    pub fn stop(&self) {
        let clients = {
            let mut state = self.state.lock();
            state.stopped = true;
            for (_, strategy) in state.pulls.drain(..) {
                strategy.attempt().pull_finished();
            }
            state.idle.clear();
            state.clients.drain(..).collect::<Vec<_>>()
        };
        self.condition.notify_all();
        for client in clients {
            if let Some(client) = client.upgrade() {
                client.stop(true);
            }
        }
        for handle in self.threads.lock().drain(..) {
            handle.join().unwrap();
        }
    }
}
