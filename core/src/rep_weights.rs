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

use ltypes::{Account, Amount};
use parking_lot::Mutex;

/// In-memory tally of voting weight delegated to each representative.
/// Rebuilt from the account table at startup and moved incrementally as
/// blocks are processed and rolled back.
#[derive(Default)]
pub struct RepWeights {
    rep_amounts: Mutex<HashMap<Account, Amount>>,
}

impl RepWeights {
    pub fn new() -> RepWeights {
        Default::default()
    }

    pub fn representation_get(&self, account: &Account) -> Amount {
        self.rep_amounts.lock().get(account).copied().unwrap_or_default()
    }

    pub fn representation_add(&self, account: &Account, amount: Amount) {
        let mut rep_amounts = self.rep_amounts.lock();
        let entry = rep_amounts.entry(*account).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn representation_subtract(&self, account: &Account, amount: Amount) {
        let mut rep_amounts = self.rep_amounts.lock();
        if let Some(entry) = rep_amounts.get_mut(account) {
            *entry = entry.saturating_sub(amount);
            if entry.is_zero() {
                rep_amounts.remove(account);
            }
        }
    }

    pub fn representation_put(&self, account: &Account, amount: Amount) {
        let mut rep_amounts = self.rep_amounts.lock();
        if amount.is_zero() {
            rep_amounts.remove(account);
        } else {
            rep_amounts.insert(*account, amount);
        }
    }

    pub fn get_rep_amounts(&self) -> HashMap<Account, Amount> {
        self.rep_amounts.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_subtract() {
        let weights = RepWeights::new();
        let rep = Account::from_low_u64_be(1);
        weights.representation_add(&rep, Amount::from(10u64));
        weights.representation_add(&rep, Amount::from(5u64));
        assert_eq!(weights.representation_get(&rep), Amount::from(15u64));
        weights.representation_subtract(&rep, Amount::from(15u64));
        assert_eq!(weights.representation_get(&rep), Amount::zero());
        assert!(weights.get_rep_amounts().is_empty());
    }

    #[test]
    fn subtract_saturates() {
        let weights = RepWeights::new();
        let rep = Account::from_low_u64_be(1);
        weights.representation_add(&rep, Amount::from(3u64));
        weights.representation_subtract(&rep, Amount::from(10u64));
        assert_eq!(weights.representation_get(&rep), Amount::zero());
    }
}
