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
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const SCORE_LIMIT: u64 = 2;
const SIZE_MAX: usize = 5000;
const PEERS_PERCENTAGE_LIMIT: f64 = 0.5;

#[derive(Debug, Clone)]
struct Item {
    exclude_until: Instant,
    score: u64,
}

/// Scored denylist of misbehaving peer addresses. Scores grow on repeated
/// misbehavior and the exclusion window grows super-linearly with them.
pub struct PeerExclusion {
    peers: Mutex<HashMap<IpAddr, Item>>,
    exclude_time: Duration,
    exclude_remove_time: Duration,
}

impl PeerExclusion {
    pub fn new() -> PeerExclusion {
        Self::with_times(Duration::from_secs(60 * 60), Duration::from_secs(60 * 60))
    }

    /// Exclusion windows are configurable so tests do not wait hours
    pub fn with_times(exclude_time: Duration, exclude_remove_time: Duration) -> PeerExclusion {
        PeerExclusion {
            peers: Mutex::new(HashMap::new()),
            exclude_time,
            exclude_remove_time,
        }
    }

    /// Bumps the score of `endpoint`, starting its exclusion window once the
    /// score reaches `SCORE_LIMIT`. Returns the new score.
    pub fn add(&self, endpoint: &SocketAddr, network_peers_count: usize) -> u64 {
        let mut peers = self.peers.lock();
        // Clean old excluded peers
        let limited = Self::limited_size(network_peers_count);
        while peers.len() > 1 && peers.len() > limited {
            let oldest =
                peers.iter().min_by_key(|(_, item)| item.exclude_until).map(|(address, _)| *address).expect("Nonempty");
            peers.remove(&oldest);
        }
        debug_assert!(peers.len() <= SIZE_MAX);
        let address = endpoint.ip();
        match peers.get_mut(&address) {
            None => {
                peers.insert(address, Item {
                    exclude_until: Instant::now() + self.exclude_time,
                    score: 1,
                });
                1
            }
            Some(item) => {
                item.score += 1;
                if item.score == SCORE_LIMIT {
                    item.exclude_until = Instant::now() + self.exclude_time;
                } else if item.score > SCORE_LIMIT {
                    item.exclude_until = Instant::now() + self.exclude_time * item.score as u32 * 2;
                }
                item.score
            }
        }
    }

    /// Returns true while `endpoint` is excluded. Entries long past their
    /// window are evicted on the way.
    pub fn check(&self, endpoint: &SocketAddr) -> bool {
        let mut peers = self.peers.lock();
        let address = endpoint.ip();
        match peers.get(&address) {
            Some(item) if item.score >= SCORE_LIMIT => {
                if item.exclude_until > Instant::now() {
                    true
                } else {
                    if item.exclude_until + self.exclude_remove_time * (item.score as u32) < Instant::now() {
                        peers.remove(&address);
                    }
                    false
                }
            }
            _ => false,
        }
    }

    pub fn remove(&self, endpoint: &SocketAddr) {
        self.peers.lock().remove(&endpoint.ip());
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.peers.lock().contains_key(&endpoint.ip())
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn limited_size(network_peers_count: usize) -> usize {
        SIZE_MAX.min((network_peers_count as f64 * PEERS_PERCENTAGE_LIMIT) as usize)
    }
}

impl Default for PeerExclusion {
    fn default() -> PeerExclusion {
        PeerExclusion::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn endpoint(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from([127, 0, 0, last]), port)
    }

    #[test]
    fn excluded_after_score_limit() {
        let exclusion = PeerExclusion::new();
        let peer = endpoint(1, 7075);
        assert_eq!(exclusion.add(&peer, 10), 1);
        assert!(!exclusion.check(&peer));
        assert_eq!(exclusion.add(&peer, 10), 2);
        assert!(exclusion.check(&peer));
        // Different port on the same address shares the exclusion
        assert!(exclusion.check(&endpoint(1, 8000)));
        assert!(!exclusion.check(&endpoint(2, 7075)));
    }

    #[test]
    fn expired_entry_is_removed_on_check() {
        let exclusion = PeerExclusion::with_times(Duration::from_millis(10), Duration::from_millis(10));
        let peer = endpoint(1, 7075);
        exclusion.add(&peer, 10);
        exclusion.add(&peer, 10);
        assert!(exclusion.check(&peer));
        // Wait out exclude_until plus remove_time * score
        thread::sleep(Duration::from_millis(50));
        assert!(!exclusion.check(&peer));
        assert!(!exclusion.contains(&peer));
    }

    #[test]
    fn eviction_respects_network_size() {
        let exclusion = PeerExclusion::new();
        for i in 0..10 {
            exclusion.add(&endpoint(i, 7075), 4);
        }
        // limited_size(4) == 2
        assert!(exclusion.len() <= 3);
    }

    #[test]
    fn remove_clears_entry() {
        let exclusion = PeerExclusion::new();
        let peer = endpoint(1, 7075);
        exclusion.add(&peer, 10);
        exclusion.add(&peer, 10);
        exclusion.remove(&peer);
        assert!(!exclusion.check(&peer));
        assert!(exclusion.is_empty());
    }
}
