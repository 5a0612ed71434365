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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ltypes::{Account, Amount};
use parking_lot::Mutex;

use crate::ledger::Ledger;

fn system_time_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("Clock runs after 1970").as_nanos() as u64
}

/// Track online representatives and trend online voting weight.
/// The trend is the median over the persisted sample history so brief
/// outages do not crater the confirmation quorum.
pub struct OnlineReps {
    ledger: Arc<Ledger>,
    minimum: Amount,
    max_weight_samples: u64,
    reps: Mutex<HashSet<Account>>,
    online: Mutex<Amount>,
}

impl OnlineReps {
    pub fn new(ledger: Arc<Ledger>, minimum: Amount, max_weight_samples: u64) -> OnlineReps {
        let initial = {
            let tx = ledger.store.tx_begin_read();
            let samples: Vec<Amount> = ledger.store.online_weights(&tx).into_iter().map(|(_, weight)| weight).collect();
            Self::median(samples, minimum)
        };
        OnlineReps {
            ledger,
            minimum,
            max_weight_samples,
            reps: Mutex::new(HashSet::new()),
            online: Mutex::new(initial),
        }
    }

    fn median(mut samples: Vec<Amount>, minimum: Amount) -> Amount {
        samples.push(minimum);
        samples.sort();
        samples[samples.len() / 2]
    }

    /// Notes a voting representative seen in this sampling window
    pub fn observe(&self, rep: &Account) {
        if self.ledger.weight(rep) > Amount::zero() {
            self.reps.lock().insert(*rep);
        }
    }

    /// Called periodically to persist the current window and re-trend
    pub fn sample(&self) {
        let mut samples: Vec<(u64, Amount)> = {
            let tx = self.ledger.store.tx_begin_read();
            self.ledger.store.online_weights(&tx)
        };
        let mut tx = self.ledger.store.tx_begin_write();
        // Discard oldest entries
        while samples.len() as u64 >= self.max_weight_samples {
            let (time, _) = samples.remove(0);
            self.ledger.store.online_weight_del(&mut tx, time);
        }
        // Current active rep weight
        let reps_window: HashSet<Account> = {
            let mut reps = self.reps.lock();
            std::mem::take(&mut *reps)
        };
        let mut current = Amount::zero();
        for rep in &reps_window {
            current = current.saturating_add(self.ledger.weight(rep));
        }
        let now = system_time_ns();
        self.ledger.store.online_weight_put(&mut tx, now, &current);
        if tx.commit().is_err() {
            lerror!(VOTE, "Failed to persist online weight sample");
            return
        }
        samples.push((now, current));
        let trend = Self::median(samples.into_iter().map(|(_, weight)| weight).collect(), self.minimum);
        *self.online.lock() = trend;
    }

    /// Trended online stake, never less than the configured minimum
    pub fn online_stake(&self) -> Amount {
        (*self.online.lock()).max(self.minimum)
    }

    /// Snapshot of representatives seen this window
    pub fn list(&self) -> Vec<Account> {
        self.reps.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LedgerContext;

    #[test]
    fn observe_ignores_zero_weight_reps() {
        let ctx = LedgerContext::new();
        let online_reps = OnlineReps::new(Arc::clone(&ctx.ledger), Amount::from(1000u64), 288);
        online_reps.observe(&Account::from_low_u64_be(42));
        assert!(online_reps.list().is_empty());
        online_reps.observe(ctx.genesis_key.public());
        assert_eq!(online_reps.list(), vec![*ctx.genesis_key.public()]);
    }

    #[test]
    fn sample_trends_toward_observed_weight() {
        let ctx = LedgerContext::new();
        let minimum = Amount::from(1000u64);
        let online_reps = OnlineReps::new(Arc::clone(&ctx.ledger), minimum, 288);
        assert_eq!(online_reps.online_stake(), minimum);

        // Observe the full genesis weight for enough samples to move the median
        for _ in 0..3 {
            online_reps.observe(ctx.genesis_key.public());
            online_reps.sample();
        }
        assert_eq!(online_reps.online_stake(), Amount::max_value());
        // The window is consumed by each sample
        assert!(online_reps.list().is_empty());
    }

    #[test]
    fn samples_are_capped() {
        let ctx = LedgerContext::new();
        let online_reps = OnlineReps::new(Arc::clone(&ctx.ledger), Amount::from(1u64), 4);
        for _ in 0..10 {
            online_reps.sample();
        }
        let tx = ctx.ledger.store.tx_begin_read();
        assert!(ctx.ledger.store.online_weight_count(&tx) <= 4);
    }
}
