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

use rand::rngs::OsRng;
use rand::RngCore;

use super::{Generator, KeyPair, Secret};

pub struct Random;

impl Generator for Random {
    fn generate(&mut self) -> KeyPair {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        KeyPair::from_secret(Secret::from(secret))
    }
}
