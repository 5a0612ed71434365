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

extern crate ed25519_dalek;
extern crate ethereum_types;
extern crate rand;

mod ed25519;
mod keypair;
mod random;

pub use crate::ed25519::{sign, verify, SIGNATURE_LENGTH};
pub use crate::keypair::KeyPair;
pub use crate::random::Random;

use ethereum_types::{H256, H512};

/// 32 bytes long signable message
pub type Message = H256;

pub type Secret = H256;
pub type Public = H256;
pub type Signature = H512;

/// Generates new keypair.
pub trait Generator {
    /// Should be called to generate new keypair.
    fn generate(&mut self) -> KeyPair;
}
