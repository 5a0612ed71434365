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
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use ltypes::{Account, Block};
use parking_lot::Mutex;

use crate::attempt::{BootstrapAttempt, BootstrapStrategy};
use crate::connections::{BootstrapConnections, PullInfo};
use crate::pull::BulkPullAccountClient;

/// Pending-only catch-up for a set of wallet accounts: fetches each
/// account's pending receive table and pulls the unknown send blocks.
pub struct WalletAttempt {
    base: BootstrapAttempt,
    accounts: Mutex<VecDeque<Account>>,
}

impl WalletAttempt {
    pub fn new(base: BootstrapAttempt, accounts: Vec<Account>) -> WalletAttempt {
        WalletAttempt {
            base,
            accounts: Mutex::new(accounts.into()),
        }
    }

    pub fn wallet_size(&self) -> usize {
        self.accounts.lock().len()
    }

    fn requeue_pending(&self, account: Account) {
        self.accounts.lock().push_back(account);
    }
}

impl BootstrapStrategy for WalletAttempt {
    fn attempt(&self) -> &BootstrapAttempt {
        &self.base
    }

    fn mode_text(&self) -> &'static str {
        "wallet_lazy"
    }

    fn run(self: Arc<Self>, connections: Arc<BootstrapConnections>) {
        connections.attempt_started();
        self.base.started.store(true, AtomicOrdering::SeqCst);
        let mut failures = 0u32;
        loop {
            if self.base.stopped() {
                break
            }
            let account = match self.accounts.lock().pop_front() {
                Some(account) => account,
                None => break,
            };
            let client = match connections.connection() {
                Some(client) => client,
                None => break,
            };
            let puller = BulkPullAccountClient::new(
                Arc::clone(&client),
                Arc::clone(&self) as Arc<dyn BootstrapStrategy>,
                Arc::clone(&connections),
                account,
            );
            match puller.request() {
                Ok(()) => {
                    failures = 0;
                    connections.pool_connection(client);
                }
                Err(error) => {
                    lwarn!(SYNC, "Pending pull for {:?} failed: {:?}", account, error);
                    connections.drop_connection(client);
                    self.requeue_pending(account);
                    failures += 1;
                    if failures > self.base.config.bootstrap_pull_retry_limit {
                        break
                    }
                }
            }
        }
        self.base.wait_for_pulls();
        self.base.block_processor.flush();
        connections.attempt_stopped();
        linfo!(
            SYNC,
            "Wallet bootstrap attempt {} finished after {} blocks in {:.1}s",
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
        ldebug!(SYNC, "Wallet attempt {} abandoned pull of {:?}", self.base.id, pull.account_or_head);
    }
}
