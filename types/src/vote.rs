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

use lkey::{sign, verify, KeyPair};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::block::blake2b_hash;
use crate::{Account, BlockHash, Signature, H256};

/// Maximum number of hashes a single vote may carry on the wire
pub const VOTE_HASHES_MAX: usize = 12;

/// A representative's signed statement about up to 12 block hashes.
/// A higher sequence number supersedes earlier votes by the same account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub account: Account,
    pub signature: Signature,
    pub sequence: u64,
    pub hashes: Vec<BlockHash>,
}

impl Vote {
    pub fn new(keypair: &KeyPair, sequence: u64, hashes: Vec<BlockHash>) -> Vote {
        debug_assert!(!hashes.is_empty() && hashes.len() <= VOTE_HASHES_MAX);
        let digest = Self::digest(sequence, &hashes);
        Vote {
            account: *keypair.public(),
            signature: sign(keypair.secret(), &digest),
            sequence,
            hashes,
        }
    }

    /// Canonical signable digest over the carried hashes and the sequence
    fn digest(sequence: u64, hashes: &[BlockHash]) -> H256 {
        let mut bytes = Vec::with_capacity(6 + hashes.len() * 32 + 8);
        bytes.extend_from_slice(b"vote ");
        for hash in hashes {
            bytes.extend_from_slice(hash.as_bytes());
        }
        bytes.extend_from_slice(&sequence.to_le_bytes());
        blake2b_hash(&bytes)
    }

    pub fn hash(&self) -> H256 {
        Self::digest(self.sequence, &self.hashes)
    }

    pub fn validate(&self) -> bool {
        !self.hashes.is_empty()
            && self.hashes.len() <= VOTE_HASHES_MAX
            && verify(&self.account, &self.signature, &self.hash())
    }
}

impl Encodable for Vote {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4).append(&self.account).append(&self.signature).append(&self.sequence);
        s.begin_list(self.hashes.len());
        for hash in &self.hashes {
            s.append(hash);
        }
    }
}

impl Decodable for Vote {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let hashes: Vec<BlockHash> = rlp.list_at(3)?;
        if hashes.is_empty() || hashes.len() > VOTE_HASHES_MAX {
            return Err(DecoderError::Custom("Invalid vote hash count"))
        }
        Ok(Vote {
            account: rlp.val_at(0)?,
            signature: rlp.val_at(1)?,
            sequence: rlp.val_at(2)?,
            hashes,
        })
    }
}

#[cfg(test)]
mod tests {
    use lkey::{Generator, Random};

    use super::*;

    #[test]
    fn round_trip() {
        let keypair = Random.generate();
        let vote = Vote::new(&keypair, 3, vec![BlockHash::from_low_u64_be(1), BlockHash::from_low_u64_be(2)]);
        let encoded = rlp::encode(&vote);
        assert_eq!(vote, rlp::decode(&encoded).unwrap());
    }

    #[test]
    fn validates_own_signature() {
        let keypair = Random.generate();
        let vote = Vote::new(&keypair, 1, vec![BlockHash::from_low_u64_be(1)]);
        assert!(vote.validate());
    }

    #[test]
    fn tampered_sequence_fails_validation() {
        let keypair = Random.generate();
        let mut vote = Vote::new(&keypair, 1, vec![BlockHash::from_low_u64_be(1)]);
        vote.sequence = 2;
        assert!(!vote.validate());
    }

    #[test]
    fn digest_covers_sequence() {
        let keypair = Random.generate();
        let a = Vote::new(&keypair, 1, vec![BlockHash::from_low_u64_be(1)]);
        let b = Vote::new(&keypair, 2, vec![BlockHash::from_low_u64_be(1)]);
        assert_ne!(a.hash(), b.hash());
    }
}
