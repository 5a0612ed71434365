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

extern crate lattice_types as ltypes;
#[cfg(test)]
extern crate lattice_key as lkey;
extern crate parking_lot;
extern crate rand;
extern crate rlp;
extern crate siphasher;

mod channel;
mod filter;
mod message;
mod peer_exclusion;
mod roster;

pub use crate::channel::{Channel, LoopbackChannel};
pub use crate::filter::NetworkFilter;
pub use crate::message::{Message, MessageHeader, MessageType, ParseError, CONFIRM_REQ_HASHES_MAX, HEADER_SIZE};
pub use crate::peer_exclusion::PeerExclusion;
pub use crate::roster::PeerRoster;
