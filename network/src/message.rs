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

use std::net::SocketAddr;

use ltypes::{Account, Amount, Block, BlockHash, HashOrAccount, NetworkConstants, Networks, Root, Vote, MAGIC};
use rlp::{DecoderError, Rlp, RlpStream};

/// Number of (hash, root) pairs a confirm_req may carry on the wire
pub const CONFIRM_REQ_HASHES_MAX: usize = 7;

pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Keepalive,
    Publish,
    ConfirmReq,
    ConfirmAck,
    BulkPull,
    BulkPush,
    FrontierReq,
    BulkPullAccount,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Keepalive => 2,
            MessageType::Publish => 3,
            MessageType::ConfirmReq => 4,
            MessageType::ConfirmAck => 5,
            MessageType::BulkPull => 6,
            MessageType::BulkPush => 7,
            MessageType::FrontierReq => 8,
            MessageType::BulkPullAccount => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            2 => Some(MessageType::Keepalive),
            3 => Some(MessageType::Publish),
            4 => Some(MessageType::ConfirmReq),
            5 => Some(MessageType::ConfirmAck),
            6 => Some(MessageType::BulkPull),
            7 => Some(MessageType::BulkPush),
            8 => Some(MessageType::FrontierReq),
            11 => Some(MessageType::BulkPullAccount),
            _ => None,
        }
    }
}

/// Fixed eight byte prefix of every wire message. The deduplication filter
/// operates on the payload that follows, never on the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub network: Networks,
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub extensions: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InsufficientBytes,
    InvalidMagic,
    InvalidNetwork,
    OutdatedVersion,
    InvalidMessageType,
    InvalidPayload(DecoderError),
}

impl From<DecoderError> for ParseError {
    fn from(err: DecoderError) -> ParseError {
        ParseError::InvalidPayload(err)
    }
}

impl MessageHeader {
    pub fn new(constants: &NetworkConstants, message_type: MessageType) -> MessageHeader {
        MessageHeader {
            network: constants.network,
            version_max: constants.protocol_version,
            version_using: constants.protocol_version,
            version_min: constants.protocol_version_min,
            message_type,
            extensions: 0,
        }
    }

    pub fn serialize(&self, bytes: &mut Vec<u8>) {
        bytes.push(MAGIC);
        bytes.push(self.network.id());
        bytes.push(self.version_max);
        bytes.push(self.version_using);
        bytes.push(self.version_min);
        bytes.push(self.message_type.code());
        bytes.extend_from_slice(&self.extensions.to_le_bytes());
    }

    pub fn deserialize(constants: &NetworkConstants, bytes: &[u8]) -> Result<MessageHeader, ParseError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientBytes)
        }
        if bytes[0] != MAGIC {
            return Err(ParseError::InvalidMagic)
        }
        let network = Networks::from_id(bytes[1]).ok_or(ParseError::InvalidNetwork)?;
        if network != constants.network {
            return Err(ParseError::InvalidNetwork)
        }
        let version_using = bytes[3];
        if version_using < constants.protocol_version_min {
            return Err(ParseError::OutdatedVersion)
        }
        let message_type = MessageType::from_code(bytes[5]).ok_or(ParseError::InvalidMessageType)?;
        Ok(MessageHeader {
            network,
            version_max: bytes[2],
            version_using,
            version_min: bytes[4],
            message_type,
            extensions: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Keepalive(Vec<SocketAddr>),
    Publish(Block),
    ConfirmReq(Vec<(BlockHash, Root)>),
    ConfirmAck(Vote),
    BulkPull {
        start: HashOrAccount,
        end: BlockHash,
        count: u32,
    },
    BulkPush,
    FrontierReq {
        start: Account,
        age: u32,
        count: u32,
    },
    BulkPullAccount {
        account: Account,
        minimum_amount: Amount,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keepalive(..) => MessageType::Keepalive,
            Message::Publish(..) => MessageType::Publish,
            Message::ConfirmReq(..) => MessageType::ConfirmReq,
            Message::ConfirmAck(..) => MessageType::ConfirmAck,
            Message::BulkPull {
                ..
            } => MessageType::BulkPull,
            Message::BulkPush => MessageType::BulkPush,
            Message::FrontierReq {
                ..
            } => MessageType::FrontierReq,
            Message::BulkPullAccount {
                ..
            } => MessageType::BulkPullAccount,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        match self {
            Message::Keepalive(peers) => {
                s.begin_list(peers.len());
                for peer in peers {
                    s.append(&peer.to_string());
                }
            }
            Message::Publish(block) => {
                s.append(block);
            }
            Message::ConfirmReq(hashes_roots) => {
                debug_assert!(hashes_roots.len() <= CONFIRM_REQ_HASHES_MAX);
                s.begin_list(hashes_roots.len());
                for (hash, root) in hashes_roots {
                    s.begin_list(2).append(hash).append(root);
                }
            }
            Message::ConfirmAck(vote) => {
                s.append(vote);
            }
            Message::BulkPull {
                start,
                end,
                count,
            } => {
                s.begin_list(3).append(start).append(end).append(count);
            }
            Message::BulkPush => {
                s.begin_list(0);
            }
            Message::FrontierReq {
                start,
                age,
                count,
            } => {
                s.begin_list(3).append(start).append(age).append(count);
            }
            Message::BulkPullAccount {
                account,
                minimum_amount,
            } => {
                s.begin_list(2).append(account).append(minimum_amount);
            }
        }
        s.out().to_vec()
    }

    pub fn serialize(&self, constants: &NetworkConstants) -> Vec<u8> {
        let mut bytes = Vec::new();
        MessageHeader::new(constants, self.message_type()).serialize(&mut bytes);
        bytes.extend_from_slice(&self.payload());
        bytes
    }

    pub fn deserialize(constants: &NetworkConstants, bytes: &[u8]) -> Result<(MessageHeader, Message), ParseError> {
        let header = MessageHeader::deserialize(constants, bytes)?;
        let payload = Rlp::new(&bytes[HEADER_SIZE..]);
        let message = match header.message_type {
            MessageType::Keepalive => {
                let mut peers = Vec::new();
                for item in payload.iter() {
                    let string: String = item.as_val()?;
                    let peer = string.parse().map_err(|_| ParseError::InvalidPayload(DecoderError::Custom("Bad endpoint")))?;
                    peers.push(peer);
                }
                Message::Keepalive(peers)
            }
            MessageType::Publish => Message::Publish(payload.as_val()?),
            MessageType::ConfirmReq => {
                if payload.item_count()? > CONFIRM_REQ_HASHES_MAX {
                    return Err(ParseError::InvalidPayload(DecoderError::Custom("Too many confirm_req pairs")))
                }
                let mut hashes_roots = Vec::with_capacity(payload.item_count()?);
                for item in payload.iter() {
                    if item.item_count()? != 2 {
                        return Err(ParseError::InvalidPayload(DecoderError::RlpIncorrectListLen))
                    }
                    hashes_roots.push((item.val_at(0)?, item.val_at(1)?));
                }
                Message::ConfirmReq(hashes_roots)
            }
            MessageType::ConfirmAck => Message::ConfirmAck(payload.as_val()?),
            MessageType::BulkPull => {
                if payload.item_count()? != 3 {
                    return Err(ParseError::InvalidPayload(DecoderError::RlpIncorrectListLen))
                }
                Message::BulkPull {
                    start: payload.val_at(0)?,
                    end: payload.val_at(1)?,
                    count: payload.val_at(2)?,
                }
            }
            MessageType::BulkPush => Message::BulkPush,
            MessageType::FrontierReq => {
                if payload.item_count()? != 3 {
                    return Err(ParseError::InvalidPayload(DecoderError::RlpIncorrectListLen))
                }
                Message::FrontierReq {
                    start: payload.val_at(0)?,
                    age: payload.val_at(1)?,
                    count: payload.val_at(2)?,
                }
            }
            MessageType::BulkPullAccount => {
                if payload.item_count()? != 2 {
                    return Err(ParseError::InvalidPayload(DecoderError::RlpIncorrectListLen))
                }
                Message::BulkPullAccount {
                    account: payload.val_at(0)?,
                    minimum_amount: payload.val_at(1)?,
                }
            }
        };
        Ok((header, message))
    }
}

#[cfg(test)]
mod tests {
    use lkey::{Generator, Random};
    use ltypes::{SendBlock, Vote};

    use super::*;

    fn constants() -> NetworkConstants {
        NetworkConstants::test()
    }

    #[test]
    fn header_round_trip() {
        let constants = constants();
        let header = MessageHeader::new(&constants, MessageType::ConfirmReq);
        let mut bytes = Vec::new();
        header.serialize(&mut bytes);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(MessageHeader::deserialize(&constants, &bytes).unwrap(), header);
    }

    #[test]
    fn rejects_foreign_network() {
        let test = constants();
        let live = NetworkConstants::live();
        let bytes = Message::BulkPush.serialize(&live);
        assert_eq!(MessageHeader::deserialize(&test, &bytes), Err(ParseError::InvalidNetwork));
    }

    #[test]
    fn publish_round_trip() {
        let constants = constants();
        let keypair = Random.generate();
        let block = Block::Send(SendBlock::new(
            BlockHash::from_low_u64_be(1),
            *keypair.public(),
            Amount::from(10u64),
            keypair.secret(),
            0,
        ));
        let message = Message::Publish(block);
        let bytes = message.serialize(&constants);
        let (header, parsed) = Message::deserialize(&constants, &bytes).unwrap();
        assert_eq!(header.message_type, MessageType::Publish);
        assert_eq!(parsed, message);
    }

    #[test]
    fn confirm_ack_round_trip() {
        let constants = constants();
        let keypair = Random.generate();
        let vote = Vote::new(&keypair, 1, vec![BlockHash::from_low_u64_be(1)]);
        let message = Message::ConfirmAck(vote);
        let bytes = message.serialize(&constants);
        let (_, parsed) = Message::deserialize(&constants, &bytes).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn confirm_req_pair_limit_is_enforced() {
        let constants = constants();
        let pairs: Vec<_> =
            (0..8).map(|i| (BlockHash::from_low_u64_be(i), Root::from_low_u64_be(i))).collect();
        let mut bytes = Vec::new();
        MessageHeader::new(&constants, MessageType::ConfirmReq).serialize(&mut bytes);
        let mut s = RlpStream::new_list(pairs.len());
        for (hash, root) in &pairs {
            s.begin_list(2).append(hash).append(root);
        }
        bytes.extend_from_slice(&s.out());
        assert!(Message::deserialize(&constants, &bytes).is_err());
    }
}
