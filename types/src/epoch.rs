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

use crate::{Account, Link};

/// Tag for which ledger epoch an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Epoch {
    Invalid,
    Unspecified,
    Epoch0,
    Epoch1,
    Epoch2,
}

impl Default for Epoch {
    fn default() -> Epoch {
        Epoch::Epoch0
    }
}

impl Epoch {
    pub const MAX: Epoch = Epoch::Epoch2;

    pub fn as_u8(self) -> u8 {
        match self {
            Epoch::Invalid => 0,
            Epoch::Unspecified => 1,
            Epoch::Epoch0 => 2,
            Epoch::Epoch1 => 3,
            Epoch::Epoch2 => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Epoch> {
        match value {
            0 => Some(Epoch::Invalid),
            1 => Some(Epoch::Unspecified),
            2 => Some(Epoch::Epoch0),
            3 => Some(Epoch::Epoch1),
            4 => Some(Epoch::Epoch2),
            _ => None,
        }
    }

    /// Turns Epoch0 into 0, Epoch1 into 1 and so on
    pub fn normalized(self) -> u8 {
        debug_assert!(self.as_u8() >= Epoch::Epoch0.as_u8());
        self.as_u8() - Epoch::Epoch0.as_u8()
    }

    pub fn successor(self) -> Option<Epoch> {
        match self {
            Epoch::Epoch0 => Some(Epoch::Epoch1),
            Epoch::Epoch1 => Some(Epoch::Epoch2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochInfo {
    pub signer: Account,
    pub link: Link,
}

/// Registry of upgrade epochs, their designated signers and well-known links
#[derive(Debug, Default)]
pub struct Epochs {
    epochs: HashMap<Epoch, EpochInfo>,
}

impl Epochs {
    pub fn new() -> Epochs {
        Default::default()
    }

    pub fn add(&mut self, epoch: Epoch, signer: Account, link: Link) {
        debug_assert!(!self.epochs.contains_key(&epoch));
        self.epochs.insert(epoch, EpochInfo {
            signer,
            link,
        });
    }

    pub fn is_epoch_link(&self, link: &Link) -> bool {
        self.epochs.values().any(|info| info.link == *link)
    }

    pub fn link(&self, epoch: Epoch) -> Option<&Link> {
        self.epochs.get(&epoch).map(|info| &info.link)
    }

    pub fn signer(&self, epoch: Epoch) -> Option<&Account> {
        self.epochs.get(&epoch).map(|info| &info.signer)
    }

    pub fn epoch(&self, link: &Link) -> Option<Epoch> {
        self.epochs.iter().find(|(_, info)| info.link == *link).map(|(epoch, _)| *epoch)
    }

    /// Checks that new_epoch is exactly one version higher than epoch.
    /// Unspecified is not a predecessor of Epoch0.
    pub fn is_sequential(epoch: Epoch, new_epoch: Epoch) -> bool {
        let head = epoch.as_u8();
        let is_valid_epoch = head >= Epoch::Epoch0.as_u8();
        is_valid_epoch && new_epoch.as_u8() == head + 1
    }
}
