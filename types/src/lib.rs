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

extern crate blake2b_simd;
extern crate ethereum_types;
extern crate lattice_key as lkey;
extern crate rlp;

mod account;
mod block;
mod epoch;
mod network;
mod vote;

pub use crate::account::{
    AccountInfo, ConfirmationHeightInfo, PendingInfo, PendingKey, SignatureVerification, UncheckedInfo, UncheckedKey,
};
pub use crate::block::{
    blake2b_hash, Block, BlockDetails, BlockSideband, BlockType, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock,
    StateBlock,
};
pub use crate::epoch::{Epoch, EpochInfo, Epochs};
pub use crate::network::{work_generate, work_value, NetworkConstants, Networks, MAGIC};
pub use crate::vote::{Vote, VOTE_HASHES_MAX};

pub use ethereum_types::{H256, H512, U128};
pub use lkey::{Public, Signature};

pub type Account = Public;
pub type BlockHash = H256;
pub type Root = H256;
pub type Link = H256;
pub type Amount = U128;
/// Bootstrap pulls address either a block hash or an account frontier.
pub type HashOrAccount = H256;
