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

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use ltypes::{Account, Block, BlockHash};
use parking_lot::Mutex;

use crate::attempt::{BootstrapAttempt, BootstrapStrategy};
use crate::connections::{BootstrapConnections, PullInfo};
use crate::frontier::FrontierReqClient;
use crate::push::BulkPushClient;

/// Classic catch-up: one frontier exchange drives account-wide pulls, and
/// whatever the peer was missing is pushed back afterwards.
pub struct LegacyAttempt {
    base: BootstrapAttempt,
    push_targets: Mutex<Vec<(BlockHash, BlockHash)>>,
}

impl LegacyAttempt {
    pub fn new(base: BootstrapAttempt) -> LegacyAttempt {
        LegacyAttempt {
            base,
            push_targets: Mutex::new(Vec::new()),
        }
    }

    fn request_frontiers(self: &Arc<Self>, connections: &Arc<BootstrapConnections>) -> bool {
        while !self.base.stopped() {
            let client = match connections.connection() {
                Some(client) => client,
                None => return false,
            };
            match FrontierReqClient::new(Arc::clone(&client), Arc::clone(&self.base.ledger))
                .run(self.base.config.bootstrap_pull_retry_limit, self.base.incremental_id)
            {
                Ok(diff) => {
                    connections.pool_connection(client);
                    *self.push_targets.lock() = diff.push_targets;
                    let strategy: Arc<dyn BootstrapStrategy> = Arc::clone(self) as Arc<dyn BootstrapStrategy>;
                    for pull in diff.pulls {
                        connections.add_pull(pull, Arc::clone(&strategy));
                    }
                    return true
                }
                Err(error) => {
                    lwarn!(SYNC, "Frontier request failed: {:?}, retrying with another peer", error);
                    connections.drop_connection(client);
                }
            }
        }
        false
    }

    fn request_push(&self, connections: &Arc<BootstrapConnections>) {
        let targets = std::mem::take(&mut *self.push_targets.lock());
        if targets.is_empty() || self.base.stopped() {
            return
        }
        if let Some(client) = connections.connection() {
            match BulkPushClient::new(Arc::clone(&client), Arc::clone(&self.base.ledger)).run(&targets) {
                Ok(()) => connections.pool_connection(client),
                Err(error) => {
                    lwarn!(SYNC, "Bulk push failed: {:?}", error);
                    connections.drop_connection(client);
                }
            }
        }
    }
}

impl BootstrapStrategy for LegacyAttempt {
    fn attempt(&self) -> &BootstrapAttempt {
        &self.base
    }

    fn mode_text(&self) -> &'static str {
        "legacy"
    }

    fn run(self: Arc<Self>, connections: Arc<BootstrapConnections>) {
        connections.attempt_started();
        self.base.started.store(true, AtomicOrdering::SeqCst);
        if self.request_frontiers(&connections) {
            self.base.wait_for_pulls();
            self.base.block_processor.flush();
            self.request_push(&connections);
        }
        connections.attempt_stopped();
        linfo!(
            SYNC,
            "Legacy bootstrap attempt {} finished after {} blocks in {:.1}s",
            self.base.id,
            self.base.total_blocks.load(AtomicOrdering::Relaxed),
            self.base.attempt_start.elapsed().as_secs_f64()
        );
    }

    fn process_block(
        &self,
        block: Arc<Block>,
        _known_account: &Account,
        _pull_blocks: u64,
        _max_blocks: u32,
        _block_expected: bool,
        _retry_limit: u32,
    ) -> bool {
        self.base.block_processor.add(block);
        false
    }

    fn pull_dropped(&self, pull: &PullInfo) {
        ldebug!(SYNC, "Legacy attempt {} abandoned pull of {:?}", self.base.id, pull.account_or_head);
    }
}
