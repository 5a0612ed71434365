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

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ltypes::{Block, BlockHash, ConfirmationHeightInfo};

use crate::ledger::Ledger;
use crate::write_queue::{WriteDatabaseQueue, Writer};

use super::CementCallbacks;

const MINIMUM_BATCH_WRITE_SIZE: u64 = 128;

/// Iterative frontier walker for deep chains. Accumulates one account
/// segment at a time and commits it in slices sized to hit the target
/// write transaction duration.
pub(crate) struct BoundedMode {
    ledger: Arc<Ledger>,
    write_queue: Arc<WriteDatabaseQueue>,
    batch_write_size: AtomicU64,
    target_write_time: Duration,
}

impl BoundedMode {
    pub fn new(
        ledger: Arc<Ledger>,
        write_queue: Arc<WriteDatabaseQueue>,
        batch_write_size: u64,
        target_write_time: Duration,
    ) -> BoundedMode {
        BoundedMode {
            ledger,
            write_queue,
            batch_write_size: AtomicU64::new(batch_write_size),
            target_write_time,
        }
    }

    pub fn batch_write_size(&self) -> u64 {
        self.batch_write_size.load(AtomicOrdering::Relaxed)
    }

    pub fn process(&self, original_hash: &BlockHash, callbacks: &CementCallbacks) -> Result<(), ()> {
        let mut stack = vec![*original_hash];
        while let Some(current) = stack.last().copied() {
            let tx = self.ledger.store.tx_begin_read();
            let (_, sideband) = match self.ledger.store.block_get(&tx, &current) {
                Some(found) => found,
                None => {
                    lwarn!(CONFIRM, "Candidate {:?} disappeared before cementing", current);
                    stack.pop();
                    continue
                }
            };
            let account = sideband.account;
            let info = self.ledger.store.confirmation_height_get(&tx, &account).unwrap_or_default();
            if info.height >= sideband.height {
                stack.pop();
                if current == *original_hash {
                    (callbacks.already_cemented)(&current);
                }
                continue
            }

            // Walk down to the cemented frontier, remembering the lowest
            // receive whose source chain is not cemented yet
            let mut segment = Vec::new();
            let mut dependency = None;
            let mut cursor = current;
            loop {
                let (block, block_sideband) = match self.ledger.store.block_get(&tx, &cursor) {
                    Some(found) => found,
                    None => break,
                };
                if block_sideband.height <= info.height {
                    break
                }
                if block_sideband.details.is_receive {
                    if let Some(source) = self.ledger.block_source(&block, &block_sideband) {
                        if let Some((_, source_sideband)) = self.ledger.store.block_get(&tx, &source) {
                            let foreign = source_sideband.account != account;
                            if foreign && !self.ledger.block_confirmed(&tx, &source) {
                                dependency = Some(source);
                            }
                        }
                    }
                }
                cursor = block.previous();
                segment.push((block, block_sideband));
            }
            drop(tx);

            if let Some(source) = dependency {
                stack.push(source);
                continue
            }
            segment.reverse();
            self.cement(&account, segment, callbacks)?;
            stack.pop();
        }
        Ok(())
    }

    fn cement(
        &self,
        account: &ltypes::Account,
        segment: Vec<(Arc<Block>, ltypes::BlockSideband)>,
        callbacks: &CementCallbacks,
    ) -> Result<(), ()> {
        if segment.is_empty() {
            return Ok(())
        }
        let batch = self.batch_write_size().max(MINIMUM_BATCH_WRITE_SIZE) as usize;
        for slice in segment.chunks(batch) {
            let (_, top_sideband) = slice.last().expect("Chunks are never empty");
            let frontier = slice.last().expect("Chunks are never empty").0.hash();
            let grant = self.write_queue.wait(Writer::ConfirmationHeight);
            let timer = Instant::now();
            let mut tx = self.ledger.store.tx_begin_write();
            self.ledger.store.confirmation_height_put(&mut tx, account, &ConfirmationHeightInfo {
                height: top_sideband.height,
                frontier,
            });
            if tx.commit().is_err() {
                return Err(())
            }
            drop(grant);
            let duration = timer.elapsed();
            self.tune_batch_size(duration);
            self.ledger.cache.cemented_count.fetch_add(slice.len() as u64, AtomicOrdering::Relaxed);
            for (block, _) in slice {
                (callbacks.cemented)(block);
            }
        }
        Ok(())
    }

    /// Nudges the slice size toward the target write transaction duration
    fn tune_batch_size(&self, duration: Duration) {
        let current = self.batch_write_size.load(AtomicOrdering::Relaxed);
        let amount = (current / 10).max(1);
        if duration > self.target_write_time {
            let reduced = current.saturating_sub(amount).max(MINIMUM_BATCH_WRITE_SIZE);
            self.batch_write_size.store(reduced, AtomicOrdering::Relaxed);
        } else if duration < self.target_write_time / 2 {
            self.batch_write_size.store(current + amount, AtomicOrdering::Relaxed);
        }
    }
}
