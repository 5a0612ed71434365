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

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use lkey::{verify, Message, Public, Signature};
use parking_lot::{Condvar, Mutex};

/// Batches of 256 amortize the dispatch overhead without starving other
/// queued sets
pub const BATCH_SIZE: usize = 256;

pub const VERIFICATION_UNKNOWN: i8 = -1;
pub const VERIFICATION_INVALID: i8 = 0;
pub const VERIFICATION_VALID: i8 = 1;

/// Parallel arrays of one verification request
pub struct SignatureCheckSet {
    pub messages: Vec<Message>,
    pub pub_keys: Vec<Public>,
    pub signatures: Vec<Signature>,
    pub verifications: Vec<i8>,
}

impl SignatureCheckSet {
    pub fn new(messages: Vec<Message>, pub_keys: Vec<Public>, signatures: Vec<Signature>) -> SignatureCheckSet {
        let size = messages.len();
        debug_assert_eq!(size, pub_keys.len());
        debug_assert_eq!(size, signatures.len());
        SignatureCheckSet {
            messages,
            pub_keys,
            signatures,
            verifications: vec![VERIFICATION_UNKNOWN; size],
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

struct Task {
    start: usize,
    messages: Vec<Message>,
    pub_keys: Vec<Public>,
    signatures: Vec<Signature>,
    results: Sender<(usize, Vec<i8>)>,
}

struct Pending {
    count: Mutex<usize>,
    condition: Condvar,
}

/// Bounded pool verifying signature batches. The calling thread always
/// verifies one share itself so a single-set workload never pays a context
/// switch, and zero workers degrade to a fully inline path.
pub struct SignatureChecker {
    sender: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    single_threaded: bool,
    pending: Arc<Pending>,
    stopped: AtomicBool,
}

impl SignatureChecker {
    pub fn new(num_threads: usize) -> SignatureChecker {
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            condition: Condvar::new(),
        });
        let (sender, receiver) = unbounded::<Task>();
        let threads = (0..num_threads)
            .map(|index| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("sig check {}", index))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            let verifications = Self::verify_batch(&task.messages, &task.pub_keys, &task.signatures);
                            // The caller may have given up waiting after stop
                            let _ = task.results.send((task.start, verifications));
                            let mut count = pending.count.lock();
                            *count -= 1;
                            pending.condition.notify_all();
                        }
                    })
                    .unwrap()
            })
            .collect();
        SignatureChecker {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            single_threaded: num_threads == 0,
            pending,
            stopped: AtomicBool::new(false),
        }
    }

    fn verify_batch(messages: &[Message], pub_keys: &[Public], signatures: &[Signature]) -> Vec<i8> {
        messages
            .iter()
            .zip(pub_keys.iter())
            .zip(signatures.iter())
            .map(|((message, public), signature)| {
                if verify(public, signature, message) {
                    VERIFICATION_VALID
                } else {
                    VERIFICATION_INVALID
                }
            })
            .collect()
    }

    /// Verifies the whole set before returning
    pub fn verify(&self, set: &mut SignatureCheckSet) {
        if self.stopped.load(AtomicOrdering::Relaxed) || set.is_empty() {
            return
        }
        let size = set.len();
        if self.single_threaded || size <= BATCH_SIZE {
            set.verifications = Self::verify_batch(&set.messages, &set.pub_keys, &set.signatures);
            return
        }

        let sender = match self.sender.lock().clone() {
            Some(sender) => sender,
            None => return,
        };
        let (results_sender, results_receiver) = unbounded();
        let mut posted = 0;
        let mut start = 0;
        // Keep the last batch for this thread
        while size - start > BATCH_SIZE {
            let end = start + BATCH_SIZE;
            let task = Task {
                start,
                messages: set.messages[start..end].to_vec(),
                pub_keys: set.pub_keys[start..end].to_vec(),
                signatures: set.signatures[start..end].to_vec(),
                results: results_sender.clone(),
            };
            {
                let mut count = self.pending.count.lock();
                *count += 1;
            }
            sender.send(task).expect("Workers outlive the checker");
            posted += 1;
            start = end;
        }
        let own = Self::verify_batch(&set.messages[start..], &set.pub_keys[start..], &set.signatures[start..]);
        set.verifications[start..].copy_from_slice(&own);
        for _ in 0..posted {
            let (batch_start, verifications) = results_receiver.recv().expect("Workers outlive the checker");
            set.verifications[batch_start..batch_start + verifications.len()].copy_from_slice(&verifications);
        }
    }

    /// Waits until all outstanding tasks finish
    pub fn flush(&self) {
        let mut count = self.pending.count.lock();
        while !self.stopped.load(AtomicOrdering::Relaxed) && *count != 0 {
            self.pending.condition.wait(&mut count);
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, AtomicOrdering::Relaxed) {
            *self.sender.lock() = None;
            self.pending.condition.notify_all();
            for thread in self.threads.lock().drain(..) {
                thread.join().unwrap();
            }
        }
    }
}

impl Drop for SignatureChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use lkey::{Generator, KeyPair, Random, Secret};
    use ltypes::blake2b_hash;

    use super::*;

    fn signed_set(count: usize, tamper_every: usize) -> SignatureCheckSet {
        let keypair: KeyPair = Random.generate();
        let mut messages = Vec::new();
        let mut pub_keys = Vec::new();
        let mut signatures = Vec::new();
        for i in 0..count {
            let message = blake2b_hash(&i.to_le_bytes());
            let signature = lkey::sign(keypair.secret(), &message);
            messages.push(message);
            pub_keys.push(*keypair.public());
            if tamper_every != 0 && i % tamper_every == 0 {
                signatures.push(lkey::sign(&Secret::from_low_u64_be(99), &message));
            } else {
                signatures.push(signature);
            }
        }
        SignatureCheckSet::new(messages, pub_keys, signatures)
    }

    #[test]
    fn verifies_inline_without_workers() {
        let checker = SignatureChecker::new(0);
        let mut set = signed_set(16, 4);
        checker.verify(&mut set);
        for (i, verification) in set.verifications.iter().enumerate() {
            let expected = if i % 4 == 0 {
                VERIFICATION_INVALID
            } else {
                VERIFICATION_VALID
            };
            assert_eq!(*verification, expected, "index {}", i);
        }
    }

    #[test]
    fn verifies_across_worker_batches() {
        let checker = SignatureChecker::new(2);
        // Three full batches plus a remainder
        let mut set = signed_set(BATCH_SIZE * 3 + 17, 7);
        checker.verify(&mut set);
        for (i, verification) in set.verifications.iter().enumerate() {
            let expected = if i % 7 == 0 {
                VERIFICATION_INVALID
            } else {
                VERIFICATION_VALID
            };
            assert_eq!(*verification, expected, "index {}", i);
        }
        checker.flush();
        checker.stop();
    }

    #[test]
    fn empty_set_is_a_noop() {
        let checker = SignatureChecker::new(0);
        let mut set = SignatureCheckSet::new(Vec::new(), Vec::new(), Vec::new());
        checker.verify(&mut set);
        assert!(set.verifications.is_empty());
    }
}
