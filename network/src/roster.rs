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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::channel::Channel;
use crate::message::Message;

/// The live peer set as the core sees it: one channel per endpoint,
/// maintained by the connection layer. Flooding sends to a random subset
/// scaled against the roster size.
#[derive(Default)]
pub struct PeerRoster {
    channels: Mutex<HashMap<SocketAddr, Arc<dyn Channel>>>,
}

impl PeerRoster {
    pub fn new() -> PeerRoster {
        Default::default()
    }

    pub fn add(&self, channel: Arc<dyn Channel>) {
        self.channels.lock().insert(channel.endpoint(), channel);
    }

    pub fn remove(&self, endpoint: &SocketAddr) {
        self.channels.lock().remove(endpoint);
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Number of peers a scaled flood reaches
    pub fn fanout(&self, scale: f32) -> usize {
        debug_assert!(scale >= 0.0);
        (self.len() as f32 * scale).ceil() as usize
    }

    /// Sends `message` to `fanout(scale)` randomly chosen peers
    pub fn flood(&self, message: &Message, scale: f32) {
        let channels = self.channels();
        let count = self.fanout(scale).min(channels.len());
        for channel in channels.choose_multiple(&mut thread_rng(), count) {
            channel.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;

    fn roster_of(count: usize) -> (PeerRoster, Vec<Arc<LoopbackChannel>>) {
        let roster = PeerRoster::new();
        let channels: Vec<Arc<LoopbackChannel>> = (0..count)
            .map(|i| {
                let channel = Arc::new(LoopbackChannel::new(8000 + i as u16));
                roster.add(Arc::clone(&channel) as Arc<dyn Channel>);
                channel
            })
            .collect();
        (roster, channels)
    }

    #[test]
    fn flood_reaches_the_scaled_fanout() {
        let (roster, channels) = roster_of(4);
        assert_eq!(roster.fanout(0.5), 2);
        roster.flood(&Message::BulkPush, 0.5);
        let total: usize = channels.iter().map(|channel| channel.sent_count()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn full_scale_flood_reaches_everyone() {
        let (roster, channels) = roster_of(3);
        roster.flood(&Message::BulkPush, 1.0);
        for channel in &channels {
            assert_eq!(channel.sent_count(), 1);
        }
    }

    #[test]
    fn empty_roster_floods_nothing() {
        let roster = PeerRoster::new();
        assert_eq!(roster.fanout(0.5), 0);
        roster.flood(&Message::BulkPush, 0.5);
        assert!(roster.is_empty());
    }

    #[test]
    fn duplicate_endpoints_keep_the_newest_channel() {
        let roster = PeerRoster::new();
        let first = Arc::new(LoopbackChannel::new(9000));
        let second = Arc::new(LoopbackChannel::new(9000));
        roster.add(Arc::clone(&first) as Arc<dyn Channel>);
        roster.add(Arc::clone(&second) as Arc<dyn Channel>);
        assert_eq!(roster.len(), 1);
        roster.flood(&Message::BulkPush, 1.0);
        assert_eq!(first.sent_count(), 0);
        assert_eq!(second.sent_count(), 1);
    }
}
