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

use lcore::Ledger;
use ltypes::{Account, BlockHash};

use crate::connections::{BootstrapClient, PullInfo};
use crate::peer::PeerError;

/// The frontier exchange outcome: chains to pull from the peer and chains
/// to push back at it
#[derive(Debug, Default)]
pub struct FrontierDiff {
    pub pulls: Vec<PullInfo>,
    /// (our head, their frontier or zero)
    pub push_targets: Vec<(BlockHash, BlockHash)>,
}

/// Requests the peer's account frontiers and merges them against the local
/// frontier table, account by account in key order.
pub struct FrontierReqClient {
    connection: Arc<BootstrapClient>,
    ledger: Arc<Ledger>,
}

impl FrontierReqClient {
    pub fn new(connection: Arc<BootstrapClient>, ledger: Arc<Ledger>) -> FrontierReqClient {
        FrontierReqClient {
            connection,
            ledger,
        }
    }

    pub fn run(&self, retry_limit: u32, bootstrap_id: u64) -> Result<FrontierDiff, PeerError> {
        self.connection.set_start_time();
        let mut stream = self.connection.peer.frontier_req(Account::zero(), u32::max_value(), u32::max_value())?;
        let tx = self.ledger.store.tx_begin_read();
        let local = self.ledger.store.accounts(&tx);
        let mut local_iter = local.iter().peekable();
        let mut diff = FrontierDiff::default();
        let mut received = 0usize;

        while let Some((account, their_frontier)) = stream.next_frontier()? {
            received += 1;
            // Accounts only we know about are push material
            while let Some((local_account, info)) = local_iter.peek() {
                if *local_account >= account {
                    break
                }
                diff.push_targets.push((info.head, BlockHash::zero()));
                local_iter.next();
            }
            match local_iter.peek() {
                Some((local_account, info)) if *local_account == account => {
                    let ours = info.head;
                    if ours != their_frontier {
                        if self.ledger.block_exists(&tx, &their_frontier) {
                            // We are ahead of the peer
                            diff.push_targets.push((ours, their_frontier));
                        } else {
                            diff.pulls.push(PullInfo::new(
                                account,
                                their_frontier,
                                ours,
                                0,
                                retry_limit,
                                bootstrap_id,
                            ));
                        }
                    }
                    local_iter.next();
                }
                _ => {
                    // A chain we have never seen
                    diff.pulls.push(PullInfo::new(
                        account,
                        their_frontier,
                        BlockHash::zero(),
                        0,
                        retry_limit,
                        bootstrap_id,
                    ));
                }
            }
        }
        for (_, info) in local_iter {
            diff.push_targets.push((info.head, BlockHash::zero()));
        }
        ldebug!(
            SYNC,
            "Frontier exchange with {} covered {} accounts: {} pulls, {} push targets",
            self.connection.peer.endpoint(),
            received,
            diff.pulls.len(),
            diff.push_targets.len()
        );
        Ok(diff)
    }
}
