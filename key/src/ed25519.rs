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

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, VerifyingKey};

use super::{Message, Public, Secret, Signature};

pub const SIGNATURE_LENGTH: usize = 64;

pub fn sign(secret: &Secret, message: &Message) -> Signature {
    let key = SigningKey::from_bytes(secret.as_fixed_bytes());
    let signature = key.sign(message.as_bytes());
    Signature::from_slice(&signature.to_bytes())
}

/// Returns false for malformed public keys as well as for mismatching signatures.
pub fn verify(public: &Public, signature: &Signature, message: &Message) -> bool {
    let key = match VerifyingKey::from_bytes(public.as_fixed_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = DalekSignature::from_bytes(signature.as_fixed_bytes());
    key.verify_strict(message.as_bytes(), &signature).is_ok()
}
