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
use lkey::{sign, Secret};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::epoch::Epoch;
use crate::{Account, Amount, BlockHash, Link, Root, Signature};

pub fn blake2b_hash(bytes: &[u8]) -> BlockHash {
    let digest = Params::new().hash_length(32).to_state().update(bytes).finalize();
    BlockHash::from_slice(digest.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Send,
    Receive,
    Open,
    Change,
    State,
}

impl BlockType {
    pub fn code(self) -> u8 {
        match self {
            BlockType::Send => 2,
            BlockType::Receive => 3,
            BlockType::Open => 4,
            BlockType::Change => 5,
            BlockType::State => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<BlockType> {
        match code {
            2 => Some(BlockType::Send),
            3 => Some(BlockType::Receive),
            4 => Some(BlockType::Open),
            5 => Some(BlockType::Change),
            6 => Some(BlockType::State),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBlock {
    pub previous: BlockHash,
    pub destination: Account,
    pub balance: Amount,
    pub signature: Signature,
    pub work: u64,
    hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveBlock {
    pub previous: BlockHash,
    pub source: BlockHash,
    pub signature: Signature,
    pub work: u64,
    hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlock {
    pub source: BlockHash,
    pub representative: Account,
    pub account: Account,
    pub signature: Signature,
    pub work: u64,
    hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBlock {
    pub previous: BlockHash,
    pub representative: Account,
    pub signature: Signature,
    pub work: u64,
    hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlock {
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: Link,
    pub signature: Signature,
    pub work: u64,
    hash: BlockHash,
}

/// A ledger block. Identity is the blake2b hash of the signable fields,
/// independent of signature and work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Send(SendBlock),
    Receive(ReceiveBlock),
    Open(OpenBlock),
    Change(ChangeBlock),
    State(StateBlock),
}

fn signable_hash(block_type: BlockType, append_fields: impl Fn(&mut RlpStream)) -> BlockHash {
    let mut stream = RlpStream::new_list(2);
    stream.append(&block_type.code());
    append_fields(&mut stream);
    blake2b_hash(&stream.out())
}

impl SendBlock {
    fn compute_hash(previous: &BlockHash, destination: &Account, balance: &Amount) -> BlockHash {
        signable_hash(BlockType::Send, |s| {
            s.begin_list(3).append(previous).append(destination).append(balance);
        })
    }

    pub fn new(previous: BlockHash, destination: Account, balance: Amount, secret: &Secret, work: u64) -> SendBlock {
        let hash = Self::compute_hash(&previous, &destination, &balance);
        SendBlock {
            previous,
            destination,
            balance,
            signature: sign(secret, &hash),
            work,
            hash,
        }
    }

    pub fn from_parts(
        previous: BlockHash,
        destination: Account,
        balance: Amount,
        signature: Signature,
        work: u64,
    ) -> SendBlock {
        let hash = Self::compute_hash(&previous, &destination, &balance);
        SendBlock {
            previous,
            destination,
            balance,
            signature,
            work,
            hash,
        }
    }
}

impl ReceiveBlock {
    fn compute_hash(previous: &BlockHash, source: &BlockHash) -> BlockHash {
        signable_hash(BlockType::Receive, |s| {
            s.begin_list(2).append(previous).append(source);
        })
    }

    pub fn new(previous: BlockHash, source: BlockHash, secret: &Secret, work: u64) -> ReceiveBlock {
        let hash = Self::compute_hash(&previous, &source);
        ReceiveBlock {
            previous,
            source,
            signature: sign(secret, &hash),
            work,
            hash,
        }
    }

    pub fn from_parts(previous: BlockHash, source: BlockHash, signature: Signature, work: u64) -> ReceiveBlock {
        let hash = Self::compute_hash(&previous, &source);
        ReceiveBlock {
            previous,
            source,
            signature,
            work,
            hash,
        }
    }
}

impl OpenBlock {
    fn compute_hash(source: &BlockHash, representative: &Account, account: &Account) -> BlockHash {
        signable_hash(BlockType::Open, |s| {
            s.begin_list(3).append(source).append(representative).append(account);
        })
    }

    pub fn new(source: BlockHash, representative: Account, account: Account, secret: &Secret, work: u64) -> OpenBlock {
        let hash = Self::compute_hash(&source, &representative, &account);
        OpenBlock {
            source,
            representative,
            account,
            signature: sign(secret, &hash),
            work,
            hash,
        }
    }

    pub fn from_parts(
        source: BlockHash,
        representative: Account,
        account: Account,
        signature: Signature,
        work: u64,
    ) -> OpenBlock {
        let hash = Self::compute_hash(&source, &representative, &account);
        OpenBlock {
            source,
            representative,
            account,
            signature,
            work,
            hash,
        }
    }
}

impl ChangeBlock {
    fn compute_hash(previous: &BlockHash, representative: &Account) -> BlockHash {
        signable_hash(BlockType::Change, |s| {
            s.begin_list(2).append(previous).append(representative);
        })
    }

    pub fn new(previous: BlockHash, representative: Account, secret: &Secret, work: u64) -> ChangeBlock {
        let hash = Self::compute_hash(&previous, &representative);
        ChangeBlock {
            previous,
            representative,
            signature: sign(secret, &hash),
            work,
            hash,
        }
    }

    pub fn from_parts(previous: BlockHash, representative: Account, signature: Signature, work: u64) -> ChangeBlock {
        let hash = Self::compute_hash(&previous, &representative);
        ChangeBlock {
            previous,
            representative,
            signature,
            work,
            hash,
        }
    }
}

impl StateBlock {
    fn compute_hash(
        account: &Account,
        previous: &BlockHash,
        representative: &Account,
        balance: &Amount,
        link: &Link,
    ) -> BlockHash {
        signable_hash(BlockType::State, |s| {
            s.begin_list(5).append(account).append(previous).append(representative).append(balance).append(link);
        })
    }

    pub fn new(
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: Link,
        secret: &Secret,
        work: u64,
    ) -> StateBlock {
        let hash = Self::compute_hash(&account, &previous, &representative, &balance, &link);
        StateBlock {
            account,
            previous,
            representative,
            balance,
            link,
            signature: sign(secret, &hash),
            work,
            hash,
        }
    }

    pub fn from_parts(
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: Link,
        signature: Signature,
        work: u64,
    ) -> StateBlock {
        let hash = Self::compute_hash(&account, &previous, &representative, &balance, &link);
        StateBlock {
            account,
            previous,
            representative,
            balance,
            link,
            signature,
            work,
            hash,
        }
    }
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Open(_) => BlockType::Open,
            Block::Change(_) => BlockType::Change,
            Block::State(_) => BlockType::State,
        }
    }

    pub fn hash(&self) -> BlockHash {
        match self {
            Block::Send(block) => block.hash,
            Block::Receive(block) => block.hash,
            Block::Open(block) => block.hash,
            Block::Change(block) => block.hash,
            Block::State(block) => block.hash,
        }
    }

    /// Zero for opening blocks
    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Send(block) => block.previous,
            Block::Receive(block) => block.previous,
            Block::Open(_) => BlockHash::zero(),
            Block::Change(block) => block.previous,
            Block::State(block) => block.previous,
        }
    }

    /// Previous block hash, or the account key when the block opens its chain.
    /// Work threshold input and election primary key.
    pub fn root(&self) -> Root {
        match self {
            Block::Open(block) => block.account,
            Block::State(block) if block.previous.is_zero() => block.account,
            _ => self.previous(),
        }
    }

    /// The hash of the sent block this block receives, if any. State block
    /// links are interpreted by the ledger instead.
    pub fn source(&self) -> Option<BlockHash> {
        match self {
            Block::Receive(block) => Some(block.source),
            Block::Open(block) => Some(block.source),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<Link> {
        match self {
            Block::State(block) => Some(block.link),
            _ => None,
        }
    }

    pub fn representative(&self) -> Option<Account> {
        match self {
            Block::Open(block) => Some(block.representative),
            Block::Change(block) => Some(block.representative),
            Block::State(block) => Some(block.representative),
            _ => None,
        }
    }

    pub fn balance_field(&self) -> Option<Amount> {
        match self {
            Block::Send(block) => Some(block.balance),
            Block::State(block) => Some(block.balance),
            _ => None,
        }
    }

    pub fn account_field(&self) -> Option<Account> {
        match self {
            Block::Open(block) => Some(block.account),
            Block::State(block) => Some(block.account),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<Account> {
        match self {
            Block::Send(block) => Some(block.destination),
            _ => None,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Block::Send(block) => &block.signature,
            Block::Receive(block) => &block.signature,
            Block::Open(block) => &block.signature,
            Block::Change(block) => &block.signature,
            Block::State(block) => &block.signature,
        }
    }

    pub fn work(&self) -> u64 {
        match self {
            Block::Send(block) => block.work,
            Block::Receive(block) => block.work,
            Block::Open(block) => block.work,
            Block::Change(block) => block.work,
            Block::State(block) => block.work,
        }
    }

    pub fn is_open(&self) -> bool {
        self.previous().is_zero()
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.block_type().code());
        match self {
            Block::Send(block) => {
                s.begin_list(5)
                    .append(&block.previous)
                    .append(&block.destination)
                    .append(&block.balance)
                    .append(&block.signature)
                    .append(&block.work);
            }
            Block::Receive(block) => {
                s.begin_list(4)
                    .append(&block.previous)
                    .append(&block.source)
                    .append(&block.signature)
                    .append(&block.work);
            }
            Block::Open(block) => {
                s.begin_list(5)
                    .append(&block.source)
                    .append(&block.representative)
                    .append(&block.account)
                    .append(&block.signature)
                    .append(&block.work);
            }
            Block::Change(block) => {
                s.begin_list(4)
                    .append(&block.previous)
                    .append(&block.representative)
                    .append(&block.signature)
                    .append(&block.work);
            }
            Block::State(block) => {
                s.begin_list(7)
                    .append(&block.account)
                    .append(&block.previous)
                    .append(&block.representative)
                    .append(&block.balance)
                    .append(&block.link)
                    .append(&block.signature)
                    .append(&block.work);
            }
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let code: u8 = rlp.val_at(0)?;
        let body = rlp.at(1)?;
        let expect_items = |n| {
            if body.item_count()? != n {
                Err(DecoderError::RlpIncorrectListLen)
            } else {
                Ok(())
            }
        };
        Ok(match BlockType::from_code(code).ok_or(DecoderError::Custom("Unknown block type"))? {
            BlockType::Send => {
                expect_items(5)?;
                Block::Send(SendBlock::from_parts(
                    body.val_at(0)?,
                    body.val_at(1)?,
                    body.val_at(2)?,
                    body.val_at(3)?,
                    body.val_at(4)?,
                ))
            }
            BlockType::Receive => {
                expect_items(4)?;
                Block::Receive(ReceiveBlock::from_parts(
                    body.val_at(0)?,
                    body.val_at(1)?,
                    body.val_at(2)?,
                    body.val_at(3)?,
                ))
            }
            BlockType::Open => {
                expect_items(5)?;
                Block::Open(OpenBlock::from_parts(
                    body.val_at(0)?,
                    body.val_at(1)?,
                    body.val_at(2)?,
                    body.val_at(3)?,
                    body.val_at(4)?,
                ))
            }
            BlockType::Change => {
                expect_items(4)?;
                Block::Change(ChangeBlock::from_parts(
                    body.val_at(0)?,
                    body.val_at(1)?,
                    body.val_at(2)?,
                    body.val_at(3)?,
                ))
            }
            BlockType::State => {
                expect_items(7)?;
                Block::State(StateBlock::from_parts(
                    body.val_at(0)?,
                    body.val_at(1)?,
                    body.val_at(2)?,
                    body.val_at(3)?,
                    body.val_at(4)?,
                    body.val_at(5)?,
                    body.val_at(6)?,
                ))
            }
        })
    }
}

/// Ledger-derived properties of a stored block, not part of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockDetails {
    pub epoch: Epoch,
    pub is_send: bool,
    pub is_receive: bool,
    pub is_epoch: bool,
}

impl Encodable for BlockDetails {
    fn rlp_append(&self, s: &mut RlpStream) {
        let packed: u8 =
            (self.is_send as u8) | (self.is_receive as u8) << 1 | (self.is_epoch as u8) << 2;
        s.begin_list(2).append(&self.epoch.as_u8()).append(&packed);
    }
}

impl Decodable for BlockDetails {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let epoch = Epoch::from_u8(rlp.val_at(0)?).ok_or(DecoderError::Custom("Invalid epoch tag"))?;
        let packed: u8 = rlp.val_at(1)?;
        Ok(BlockDetails {
            epoch,
            is_send: packed & 1 != 0,
            is_receive: packed & 2 != 0,
            is_epoch: packed & 4 != 0,
        })
    }
}

/// Chain position metadata kept next to every stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSideband {
    pub account: Account,
    pub successor: BlockHash,
    pub height: u64,
    pub timestamp: u64,
    pub balance: Amount,
    pub details: BlockDetails,
}

impl Encodable for BlockSideband {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6)
            .append(&self.account)
            .append(&self.successor)
            .append(&self.height)
            .append(&self.timestamp)
            .append(&self.balance)
            .append(&self.details);
    }
}

impl Decodable for BlockSideband {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(BlockSideband {
            account: rlp.val_at(0)?,
            successor: rlp.val_at(1)?,
            height: rlp.val_at(2)?,
            timestamp: rlp.val_at(3)?,
            balance: rlp.val_at(4)?,
            details: rlp.val_at(5)?,
        })
    }
}
