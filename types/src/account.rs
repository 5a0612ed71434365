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

use std::sync::Arc;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::block::Block;
use crate::epoch::Epoch;
use crate::{Account, Amount, BlockHash};

/// Latest state of an account chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub head: BlockHash,
    pub open_block: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    /// Seconds since unix epoch
    pub modified: u64,
    pub block_count: u64,
    pub epoch: Epoch,
}

impl Encodable for AccountInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7)
            .append(&self.head)
            .append(&self.open_block)
            .append(&self.representative)
            .append(&self.balance)
            .append(&self.modified)
            .append(&self.block_count)
            .append(&self.epoch.as_u8());
    }
}

impl Decodable for AccountInfo {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(AccountInfo {
            head: rlp.val_at(0)?,
            open_block: rlp.val_at(1)?,
            representative: rlp.val_at(2)?,
            balance: rlp.val_at(3)?,
            modified: rlp.val_at(4)?,
            block_count: rlp.val_at(5)?,
            epoch: Epoch::from_u8(rlp.val_at(6)?).ok_or(DecoderError::Custom("Invalid epoch tag"))?,
        })
    }
}

/// Cemented prefix marker for one account chain
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfirmationHeightInfo {
    pub height: u64,
    pub frontier: BlockHash,
}

impl Encodable for ConfirmationHeightInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2).append(&self.height).append(&self.frontier);
    }
}

impl Decodable for ConfirmationHeightInfo {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(ConfirmationHeightInfo {
            height: rlp.val_at(0)?,
            frontier: rlp.val_at(1)?,
        })
    }
}

/// (receiving account, send block hash), the key of one pending receive.
/// Serialized as account bytes followed by hash bytes so iteration groups
/// by account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub account: Account,
    pub hash: BlockHash,
}

impl PendingKey {
    pub fn new(account: Account, hash: BlockHash) -> PendingKey {
        PendingKey {
            account,
            hash,
        }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.account.as_bytes());
        bytes[32..].copy_from_slice(self.hash.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<PendingKey> {
        if bytes.len() != 64 {
            return None
        }
        Some(PendingKey {
            account: Account::from_slice(&bytes[..32]),
            hash: BlockHash::from_slice(&bytes[32..]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub source: Account,
    pub amount: Amount,
    pub epoch: Epoch,
}

impl Encodable for PendingInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3).append(&self.source).append(&self.amount).append(&self.epoch.as_u8());
    }
}

impl Decodable for PendingInfo {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(PendingInfo {
            source: rlp.val_at(0)?,
            amount: rlp.val_at(1)?,
            epoch: Epoch::from_u8(rlp.val_at(2)?).ok_or(DecoderError::Custom("Invalid epoch tag"))?,
        })
    }
}

/// Tri-state result of signature pre-verification carried with queued blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerification {
    Unknown,
    Invalid,
    Valid,
    /// Valid against the epoch signer rather than the account key
    ValidEpoch,
}

impl SignatureVerification {
    pub fn as_u8(self) -> u8 {
        match self {
            SignatureVerification::Unknown => 0,
            SignatureVerification::Invalid => 1,
            SignatureVerification::Valid => 2,
            SignatureVerification::ValidEpoch => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<SignatureVerification> {
        match value {
            0 => Some(SignatureVerification::Unknown),
            1 => Some(SignatureVerification::Invalid),
            2 => Some(SignatureVerification::Valid),
            3 => Some(SignatureVerification::ValidEpoch),
            _ => None,
        }
    }
}

/// (missing dependency hash, dependent block hash)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UncheckedKey {
    pub previous: BlockHash,
    pub hash: BlockHash,
}

impl UncheckedKey {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.previous.as_bytes());
        bytes[32..].copy_from_slice(self.hash.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<UncheckedKey> {
        if bytes.len() != 64 {
            return None
        }
        Some(UncheckedKey {
            previous: BlockHash::from_slice(&bytes[..32]),
            hash: BlockHash::from_slice(&bytes[32..]),
        })
    }
}

/// A block staged until its missing dependency arrives
#[derive(Debug, Clone)]
pub struct UncheckedInfo {
    pub block: Arc<Block>,
    /// Hint only, zero when the sender is unknown
    pub account: Account,
    /// Seconds since unix epoch at arrival
    pub modified: u64,
    pub verified: SignatureVerification,
}

impl UncheckedInfo {
    pub fn new(block: Arc<Block>, account: Account, modified: u64, verified: SignatureVerification) -> UncheckedInfo {
        UncheckedInfo {
            block,
            account,
            modified,
            verified,
        }
    }
}

impl Encodable for UncheckedInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(self.block.as_ref())
            .append(&self.account)
            .append(&self.modified)
            .append(&self.verified.as_u8());
    }
}

impl Decodable for UncheckedInfo {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(UncheckedInfo {
            block: Arc::new(rlp.val_at(0)?),
            account: rlp.val_at(1)?,
            modified: rlp.val_at(2)?,
            verified: SignatureVerification::from_u8(rlp.val_at(3)?)
                .ok_or(DecoderError::Custom("Invalid verification tag"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_key_bytes_round_trip() {
        let key = PendingKey::new(Account::from_low_u64_be(1), BlockHash::from_low_u64_be(2));
        assert_eq!(PendingKey::from_bytes(&key.to_bytes()), Some(key));
    }

    #[test]
    fn account_info_round_trip() {
        let info = AccountInfo {
            head: BlockHash::from_low_u64_be(1),
            open_block: BlockHash::from_low_u64_be(2),
            representative: Account::from_low_u64_be(3),
            balance: Amount::from(4u64),
            modified: 5,
            block_count: 6,
            epoch: Epoch::Epoch2,
        };
        let encoded = rlp::encode(&info);
        assert_eq!(info, rlp::decode(&encoded).unwrap());
    }
}
