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

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use parking_lot::Mutex;

use crate::message::Message;

/// An established outbound path to one peer. The socket layer is a
/// collaborator; the core only posts messages and never blocks on I/O.
pub trait Channel: Send + Sync {
    fn endpoint(&self) -> SocketAddr;
    fn send(&self, message: &Message);
}

/// In-process channel retaining everything sent through it. Stands in for
/// a TCP channel in unit tests and single-node setups.
pub struct LoopbackChannel {
    endpoint: SocketAddr,
    sent: Mutex<Vec<Message>>,
}

impl LoopbackChannel {
    pub fn new(port: u16) -> LoopbackChannel {
        LoopbackChannel {
            endpoint: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Channel for LoopbackChannel {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn send(&self, message: &Message) {
        self.sent.lock().push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_retains_sent_messages() {
        let channel = LoopbackChannel::new(7075);
        channel.send(&Message::BulkPush);
        channel.send(&Message::BulkPush);
        assert_eq!(channel.sent_count(), 2);
        assert_eq!(channel.endpoint().port(), 7075);
    }
}
