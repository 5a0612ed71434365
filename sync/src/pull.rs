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

use ltypes::{Account, BlockHash};

use crate::attempt::BootstrapStrategy;
use crate::connections::{BootstrapClient, BootstrapConnections, PullInfo};
use crate::peer::PeerError;

/// Allowed chain mismatches before a peer is considered off the rails
const MAX_UNEXPECTED: u64 = 16;

/// Streams one account chain (or hash-rooted subchain) from a peer into
/// the issuing attempt, validating chain continuity along the way.
pub struct BulkPullClient {
    connection: Arc<BootstrapClient>,
    strategy: Arc<dyn BootstrapStrategy>,
    pull: PullInfo,
}

impl BulkPullClient {
    pub fn new(
        connection: Arc<BootstrapClient>,
        strategy: Arc<dyn BootstrapStrategy>,
        pull: PullInfo,
    ) -> BulkPullClient {
        BulkPullClient {
            connection,
            strategy,
            pull,
        }
    }

    /// Drives the pull to completion. On failure the updated pull is
    /// returned for requeueing along with whether the fault was the
    /// network's.
    pub fn request(self) -> Result<(), (PullInfo, bool)> {
        self.connection.set_start_time();
        let known_account =
            Account::from_slice(self.pull.account_or_head.as_bytes());
        let mut stream = match self.connection.peer.bulk_pull(self.pull.account_or_head, self.pull.end, self.pull.count)
        {
            Ok(stream) => stream,
            Err(error) => {
                ldebug!(SYNC, "Error initiating bulk pull from {}: {:?}", self.connection.peer.endpoint(), error);
                return Err((self.pull, true))
            }
        };
        let mut expected = self.pull.head;
        let mut pull_blocks: u64 = 0;
        let mut unexpected_count: u64 = 0;
        loop {
            if self.strategy.attempt().stopped() || self.connection.hard_stop.load(AtomicOrdering::SeqCst) {
                return Err((self.advance(expected, pull_blocks), false))
            }
            match stream.next_block() {
                Ok(Some(block)) => {
                    let hash = block.hash();
                    let block_expected = if expected.is_zero() {
                        // An unpinned pull accepts whatever frontier the
                        // peer currently has
                        expected = hash;
                        true
                    } else {
                        hash == expected
                    };
                    if block_expected {
                        expected = block.previous();
                    } else {
                        unexpected_count += 1;
                        if unexpected_count > MAX_UNEXPECTED {
                            ldebug!(SYNC, "Breaking off-chain bulk pull from {}", self.connection.peer.endpoint());
                            return Err((self.advance(expected, pull_blocks), false))
                        }
                    }
                    pull_blocks += 1;
                    self.connection.block_count.fetch_add(1, AtomicOrdering::Relaxed);
                    self.strategy.attempt().total_blocks.fetch_add(1, AtomicOrdering::Relaxed);
                    let stop_pull = self.strategy.process_block(
                        block,
                        &known_account,
                        pull_blocks,
                        self.pull.count,
                        block_expected,
                        self.pull.retry_limit,
                    );
                    if stop_pull {
                        return Ok(())
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    ldebug!(SYNC, "Error streaming bulk pull from {}: {:?}", self.connection.peer.endpoint(), error);
                    return Err((self.advance(expected, pull_blocks), true))
                }
            }
        }
        // The chain is complete when the walk arrived at the requested end
        // (or at an open block for unbounded pulls)
        if self.pull.end.is_zero() || expected == self.pull.end || expected.is_zero() {
            Ok(())
        } else {
            Err((self.advance(expected, pull_blocks), false))
        }
    }

    fn advance(&self, expected: BlockHash, pull_blocks: u64) -> PullInfo {
        let mut pull = self.pull.clone();
        if pull_blocks > 0 && !expected.is_zero() {
            // Resume from where this pull got to
            pull.head = expected;
            pull.processed += pull_blocks;
        }
        pull
    }
}

/// Fetches the pending receive table for one account, scheduling a
/// single-block pull for each unknown send hash
pub struct BulkPullAccountClient {
    connection: Arc<BootstrapClient>,
    strategy: Arc<dyn BootstrapStrategy>,
    connections: Arc<BootstrapConnections>,
    account: Account,
}

impl BulkPullAccountClient {
    pub fn new(
        connection: Arc<BootstrapClient>,
        strategy: Arc<dyn BootstrapStrategy>,
        connections: Arc<BootstrapConnections>,
        account: Account,
    ) -> BulkPullAccountClient {
        BulkPullAccountClient {
            connection,
            strategy,
            connections,
            account,
        }
    }

    pub fn request(&self) -> Result<(), PeerError> {
        self.connection.set_start_time();
        let attempt = self.strategy.attempt();
        let minimum = ltypes::Amount::from(1u64);
        let mut stream = self.connection.peer.bulk_pull_account(self.account, minimum)?;
        while let Some((key, info)) = stream.next_pending()? {
            if attempt.stopped() {
                return Err(PeerError::Disconnected)
            }
            debug_assert_eq!(key.account, self.account);
            let tx = attempt.ledger.store.tx_begin_read();
            if !attempt.ledger.block_exists(&tx, &key.hash) {
                ltrace!(SYNC, "Pulling pending block {:?} worth {} from {:?}", key.hash, info.amount, info.source);
                let pull = PullInfo::new(
                    key.hash,
                    BlockHash::zero(),
                    BlockHash::zero(),
                    1,
                    attempt.config.bootstrap_pull_retry_limit,
                    attempt.incremental_id,
                );
                self.connections.add_pull(pull, Arc::clone(&self.strategy));
            }
        }
        Ok(())
    }
}
