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

use std::fmt;

use ed25519_dalek::SigningKey;

use super::{Public, Secret};

/// Ed25519 key pair
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPair {
    secret: Secret,
    public: Public,
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        writeln!(f, "secret:  {:x}", self.secret)?;
        write!(f, "public:  {:x}", self.public)
    }
}

impl KeyPair {
    /// Create a pair from the secret half, deriving the public half
    pub fn from_secret(secret: Secret) -> KeyPair {
        let key = SigningKey::from_bytes(secret.as_fixed_bytes());
        let public = Public::from_slice(key.verifying_key().as_bytes());
        KeyPair {
            secret,
            public,
        }
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn public(&self) -> &Public {
        &self.public
    }
}
