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
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use ltypes::{Account, Block, BlockHash, BlockSideband, ConfirmationHeightInfo};

use crate::ledger::Ledger;
use crate::write_queue::{WriteDatabaseQueue, Writer};

use super::CementCallbacks;

/// Walks the receive-source graph with explicit stacks and hash-keyed maps,
/// then cements everything it gathered in a single write transaction.
/// Suited to short, wide chains where the bounded walker would pay one
/// transaction per account.
pub(crate) struct UnboundedMode {
    ledger: Arc<Ledger>,
    write_queue: Arc<WriteDatabaseQueue>,
}

impl UnboundedMode {
    pub fn new(ledger: Arc<Ledger>, write_queue: Arc<WriteDatabaseQueue>) -> UnboundedMode {
        UnboundedMode {
            ledger,
            write_queue,
        }
    }

    pub fn process(&self, original_hash: &BlockHash, callbacks: &CementCallbacks) -> Result<(), ()> {
        let tx = self.ledger.store.tx_begin_read();
        if self.ledger.block_confirmed(&tx, original_hash) {
            (callbacks.already_cemented)(original_hash);
            return Ok(())
        }

        // Dependency-first list of (account, ascending blocks) segments
        let mut cement_list: Vec<(Account, Vec<(Arc<Block>, BlockSideband)>)> = Vec::new();
        // Heights already gathered this run, keyed by account
        let mut scheduled: HashMap<Account, u64> = HashMap::new();
        let mut stack = vec![*original_hash];
        while let Some(current) = stack.last().copied() {
            let (_, sideband) = match self.ledger.store.block_get(&tx, &current) {
                Some(found) => found,
                None => {
                    stack.pop();
                    continue
                }
            };
            let account = sideband.account;
            let cemented_floor = self.ledger.store.confirmation_height_get(&tx, &account).unwrap_or_default().height;
            let floor = cemented_floor.max(scheduled.get(&account).copied().unwrap_or(0));
            if floor >= sideband.height {
                stack.pop();
                continue
            }

            let mut segment = Vec::new();
            let mut dependency = None;
            let mut cursor = current;
            loop {
                let (block, block_sideband) = match self.ledger.store.block_get(&tx, &cursor) {
                    Some(found) => found,
                    None => break,
                };
                if block_sideband.height <= floor {
                    break
                }
                if block_sideband.details.is_receive {
                    if let Some(source) = self.ledger.block_source(&block, &block_sideband) {
                        if let Some((_, source_sideband)) = self.ledger.store.block_get(&tx, &source) {
                            let source_floor = self
                                .ledger
                                .store
                                .confirmation_height_get(&tx, &source_sideband.account)
                                .unwrap_or_default()
                                .height
                                .max(scheduled.get(&source_sideband.account).copied().unwrap_or(0));
                            if source_sideband.account != account && source_floor < source_sideband.height {
                                dependency = Some(source);
                            }
                        }
                    }
                }
                cursor = block.previous();
                segment.push((block, block_sideband));
            }

            if let Some(source) = dependency {
                stack.push(source);
                continue
            }
            segment.reverse();
            if let Some((_, top_sideband)) = segment.last() {
                scheduled.insert(account, top_sideband.height);
            }
            cement_list.push((account, segment));
            stack.pop();
        }
        drop(tx);

        if cement_list.iter().all(|(_, segment)| segment.is_empty()) {
            return Ok(())
        }

        // One transaction cements the whole gathered graph
        let grant = self.write_queue.wait(Writer::ConfirmationHeight);
        let mut tx = self.ledger.store.tx_begin_write();
        for (account, segment) in &cement_list {
            if let Some((block, top_sideband)) = segment.last() {
                self.ledger.store.confirmation_height_put(&mut tx, account, &ConfirmationHeightInfo {
                    height: top_sideband.height,
                    frontier: block.hash(),
                });
            }
        }
        if tx.commit().is_err() {
            return Err(())
        }
        drop(grant);

        for (_, segment) in cement_list {
            self.ledger.cache.cemented_count.fetch_add(segment.len() as u64, AtomicOrdering::Relaxed);
            for (block, _) in segment {
                (callbacks.cemented)(&block);
            }
        }
        Ok(())
    }
}
