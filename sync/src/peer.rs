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
use std::sync::Arc;

use ltypes::{Account, Amount, Block, BlockHash, HashOrAccount, PendingInfo, PendingKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    ConnectionRefused,
    Timeout,
    Disconnected,
    Malformed,
}

/// Streamed account frontiers from a frontier_req
pub trait FrontierStream: Send {
    fn next_frontier(&mut self) -> Result<Option<(Account, BlockHash)>, PeerError>;
}

/// Streamed blocks from a bulk_pull, newest first
pub trait BlockStream: Send {
    fn next_block(&mut self) -> Result<Option<Arc<Block>>, PeerError>;
}

/// Streamed pending entries from a bulk_pull_account
pub trait PendingStream: Send {
    fn next_pending(&mut self) -> Result<Option<(PendingKey, PendingInfo)>, PeerError>;
}

/// One connected bootstrap counterparty. The transport is a collaborator;
/// clients drive these blocking request streams as small state machines and
/// cancellation is a disconnect plus the attempt's stopped flag.
pub trait BootstrapPeer: Send + Sync {
    fn endpoint(&self) -> SocketAddr;
    fn frontier_req(&self, start: Account, age_seconds: u32, count: u32) -> Result<Box<dyn FrontierStream>, PeerError>;
    fn bulk_pull(&self, start: HashOrAccount, end: BlockHash, count: u32) -> Result<Box<dyn BlockStream>, PeerError>;
    fn bulk_pull_account(&self, account: Account, minimum: Amount) -> Result<Box<dyn PendingStream>, PeerError>;
    fn bulk_push(&self, blocks: Vec<Arc<Block>>) -> Result<(), PeerError>;
    fn disconnect(&self);
}

/// Supplies outbound connections and candidate endpoints learned from the
/// live network
pub trait PeerConnector: Send + Sync {
    fn connect(&self, endpoint: SocketAddr) -> Result<Arc<dyn BootstrapPeer>, PeerError>;
    fn candidate_endpoints(&self) -> Vec<SocketAddr>;
}
