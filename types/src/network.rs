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

use blake2b_simd::Params;

use crate::block::BlockDetails;
use crate::epoch::Epoch;
use crate::Root;

/// The wire-level magic, first byte of every message header
pub const MAGIC: u8 = b'L';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Networks {
    Live,
    Beta,
    Test,
}

impl Networks {
    pub fn id(self) -> u8 {
        match self {
            Networks::Live => b'A',
            Networks::Beta => b'B',
            Networks::Test => b'C',
        }
    }

    pub fn from_id(id: u8) -> Option<Networks> {
        match id {
            b'A' => Some(Networks::Live),
            b'B' => Some(Networks::Beta),
            b'C' => Some(Networks::Test),
            _ => None,
        }
    }
}

/// Uniformly distributed difficulty measure of a work nonce against a root
pub fn work_value(root: &Root, work: u64) -> u64 {
    let digest = Params::new()
        .hash_length(8)
        .to_state()
        .update(&work.to_le_bytes())
        .update(root.as_bytes())
        .finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(digest.as_bytes());
    u64::from_le_bytes(bytes)
}

/// Brute-force a nonce meeting the threshold. Only feasible against the
/// trivial test-network thresholds; production work arrives precomputed.
pub fn work_generate(root: &Root, threshold: u64) -> u64 {
    let mut work = 0u64;
    while work_value(root, work) < threshold {
        work += 1;
    }
    work
}

/// Per-network protocol and difficulty constants
#[derive(Debug, Clone)]
pub struct NetworkConstants {
    pub network: Networks,
    pub protocol_version: u8,
    pub protocol_version_min: u8,
    /// Base threshold, also the epoch_1 threshold
    pub epoch_1_threshold: u64,
    /// Raised threshold for epoch_2 sends and epoch upgrades
    pub epoch_2_threshold: u64,
    /// Lowered threshold for epoch_2 receives
    pub epoch_2_receive_threshold: u64,
}

impl NetworkConstants {
    pub fn live() -> NetworkConstants {
        NetworkConstants {
            network: Networks::Live,
            protocol_version: 18,
            protocol_version_min: 16,
            epoch_1_threshold: 0xffff_ffc0_0000_0000,
            epoch_2_threshold: 0xffff_fff8_0000_0000,
            epoch_2_receive_threshold: 0xffff_fe00_0000_0000,
        }
    }

    pub fn beta() -> NetworkConstants {
        NetworkConstants {
            network: Networks::Beta,
            epoch_1_threshold: 0xffff_f000_0000_0000,
            epoch_2_threshold: 0xffff_f800_0000_0000,
            epoch_2_receive_threshold: 0xffff_e000_0000_0000,
            ..Self::live()
        }
    }

    /// Thresholds are trivial so tests never mine
    pub fn test() -> NetworkConstants {
        NetworkConstants {
            network: Networks::Test,
            epoch_1_threshold: 0x0000_0000_0000_0100,
            epoch_2_threshold: 0x0000_0000_0000_0200,
            epoch_2_receive_threshold: 0x0000_0000_0000_0080,
            ..Self::live()
        }
    }

    pub fn is_test_network(&self) -> bool {
        self.network == Networks::Test
    }

    pub fn threshold_base(&self) -> u64 {
        self.epoch_1_threshold
    }

    /// Version-dependent difficulty for a block with the given ledger details
    pub fn threshold(&self, details: &BlockDetails) -> u64 {
        match details.epoch {
            Epoch::Epoch2 => {
                if details.is_receive && !details.is_epoch {
                    self.epoch_2_receive_threshold
                } else {
                    self.epoch_2_threshold
                }
            }
            _ => self.epoch_1_threshold,
        }
    }

    pub fn work_valid(&self, root: &Root, work: u64, details: &BlockDetails) -> bool {
        work_value(root, work) >= self.threshold(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_by_epoch() {
        let constants = NetworkConstants::live();
        let base = BlockDetails::default();
        assert_eq!(constants.threshold(&base), constants.epoch_1_threshold);
        let epoch_2_send = BlockDetails {
            epoch: Epoch::Epoch2,
            is_send: true,
            ..Default::default()
        };
        assert_eq!(constants.threshold(&epoch_2_send), constants.epoch_2_threshold);
        let epoch_2_receive = BlockDetails {
            epoch: Epoch::Epoch2,
            is_receive: true,
            ..Default::default()
        };
        assert_eq!(constants.threshold(&epoch_2_receive), constants.epoch_2_receive_threshold);
        let epoch_upgrade = BlockDetails {
            epoch: Epoch::Epoch2,
            is_epoch: true,
            ..Default::default()
        };
        assert_eq!(constants.threshold(&epoch_upgrade), constants.epoch_2_threshold);
    }

    #[test]
    fn generated_work_validates() {
        let constants = NetworkConstants::test();
        let root = Root::from_low_u64_be(42);
        let work = work_generate(&root, constants.threshold_base());
        assert!(constants.work_valid(&root, work, &BlockDetails::default()));
    }
}
