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

use std::hash::Hasher;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip128::{Hasher128, SipHasher24};

/// Best-effort content-addressed deduplication of inbound payloads.
/// Fixed-size open-addressed table of 128 bit digests; slot collisions
/// overwrite, which only ever turns a duplicate into a miss for flood
/// traffic. The hash is keyed per process so remote peers cannot herd
/// payloads into one slot.
pub struct NetworkFilter {
    items: Mutex<Vec<u128>>,
    key0: u64,
    key1: u64,
}

impl NetworkFilter {
    pub fn new(size: usize) -> NetworkFilter {
        debug_assert!(size > 0);
        NetworkFilter {
            items: Mutex::new(vec![0u128; size]),
            key0: OsRng.next_u64(),
            key1: OsRng.next_u64(),
        }
    }

    /// Reads a digest of `bytes` and inserts it. Returns the digest and
    /// whether its slot was already occupied by it, i.e. a likely duplicate.
    pub fn apply(&self, bytes: &[u8]) -> (u128, bool) {
        // Hash before locking
        let digest = self.hash(bytes);
        let mut items = self.items.lock();
        let index = Self::index(&items, digest);
        let existed = items[index] == digest;
        if !existed {
            // Replace likely old element with a new one
            items[index] = digest;
        }
        (digest, existed)
    }

    pub fn clear(&self, digest: u128) {
        let mut items = self.items.lock();
        let index = Self::index(&items, digest);
        if items[index] == digest {
            items[index] = 0;
        }
    }

    pub fn clear_many(&self, digests: &[u128]) {
        let mut items = self.items.lock();
        for digest in digests {
            let index = Self::index(&items, *digest);
            if items[index] == *digest {
                items[index] = 0;
            }
        }
    }

    pub fn clear_bytes(&self, bytes: &[u8]) {
        self.clear(self.hash(bytes));
    }

    pub fn clear_all(&self) {
        let mut items = self.items.lock();
        let size = items.len();
        items.clear();
        items.resize(size, 0);
    }

    pub fn hash(&self, bytes: &[u8]) -> u128 {
        let mut hasher = SipHasher24::new_with_keys(self.key0, self.key1);
        hasher.write(bytes);
        hasher.finish128().as_u128()
    }

    fn index(items: &[u128], digest: u128) -> usize {
        debug_assert!(!items.is_empty());
        (digest % items.len() as u128) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_apply_admits_then_duplicates() {
        let filter = NetworkFilter::new(1);
        let payload = b"open block payload";
        let (digest, existed) = filter.apply(payload);
        assert!(!existed);
        for _ in 0..10 {
            let (repeat_digest, existed) = filter.apply(payload);
            assert_eq!(repeat_digest, digest);
            assert!(existed);
        }
    }

    #[test]
    fn clear_readmits() {
        let filter = NetworkFilter::new(16);
        let payload = b"payload";
        filter.apply(payload);
        assert!(filter.apply(payload).1);
        filter.clear_bytes(payload);
        assert!(!filter.apply(payload).1);
    }

    #[test]
    fn clear_all_empties_every_slot() {
        let filter = NetworkFilter::new(16);
        filter.apply(b"one");
        filter.apply(b"two");
        filter.clear_all();
        assert!(!filter.apply(b"one").1);
        assert!(!filter.apply(b"two").1);
    }

    #[test]
    fn clear_of_absent_digest_is_harmless() {
        let filter = NetworkFilter::new(4);
        let (digest, _) = filter.apply(b"kept");
        filter.clear(digest.wrapping_add(1));
        assert!(filter.apply(b"kept").1);
    }

    #[test]
    fn keyed_hash_differs_between_instances() {
        let a = NetworkFilter::new(4);
        let b = NetworkFilter::new(4);
        // Overwhelmingly likely with random 128 bit keys
        assert_ne!(a.hash(b"payload"), b.hash(b"payload"));
    }
}
