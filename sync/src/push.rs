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
use ltypes::{Block, BlockHash};

use crate::connections::BootstrapClient;
use crate::peer::PeerError;

/// Pipes locally-unique blocks at a peer that proved to be behind during
/// the frontier exchange
pub struct BulkPushClient {
    connection: Arc<BootstrapClient>,
    ledger: Arc<Ledger>,
}

impl BulkPushClient {
    pub fn new(connection: Arc<BootstrapClient>, ledger: Arc<Ledger>) -> BulkPushClient {
        BulkPushClient {
            connection,
            ledger,
        }
    }

    /// Each target is (our head, their frontier); blocks stream oldest
    /// first so the peer can apply them in order
    pub fn run(&self, targets: &[(BlockHash, BlockHash)]) -> Result<(), PeerError> {
        for (head, end) in targets {
            let blocks = self.collect(head, end);
            if blocks.is_empty() {
                continue
            }
            ldebug!(SYNC, "Pushing {} blocks toward {}", blocks.len(), self.connection.peer.endpoint());
            self.connection.peer.bulk_push(blocks)?;
        }
        Ok(())
    }

    fn collect(&self, head: &BlockHash, end: &BlockHash) -> Vec<Arc<Block>> {
        let tx = self.ledger.store.tx_begin_read();
        let mut blocks = Vec::new();
        let mut current = *head;
        while !current.is_zero() && current != *end {
            match self.ledger.store.block_get(&tx, &current) {
                Some((block, _)) => {
                    current = block.previous();
                    blocks.push(block);
                }
                None => break,
            }
        }
        blocks.reverse();
        blocks
    }
}
