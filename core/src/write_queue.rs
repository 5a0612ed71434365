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

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Distinct areas write locking is done, order is irrelevant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    ConfirmationHeight,
    ProcessBatch,
    /// Emulates a write lock in tests
    Testing,
}

struct Shared {
    queue: Mutex<VecDeque<Writer>>,
    condition: Condvar,
}

impl Shared {
    fn pop_and_notify(&self) {
        {
            let mut queue = self.queue.lock();
            queue.pop_front();
        }
        self.condition.notify_all();
    }
}

/// Scoped grant of the head slot; releases it and wakes all waiters when
/// dropped or explicitly released
pub struct WriteGuard {
    shared: Arc<Shared>,
    owns: bool,
}

impl WriteGuard {
    pub fn is_owned(&self) -> bool {
        self.owns
    }

    pub fn release(&mut self) {
        debug_assert!(self.owns);
        if self.owns {
            self.shared.pop_and_notify();
        }
        self.owns = false;
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.owns {
            self.shared.pop_and_notify();
        }
    }
}

/// FIFO of writer identities serializing every ledger mutation. At most one
/// writer holds the head at any moment; a writer already queued is never
/// queued twice.
pub struct WriteDatabaseQueue {
    shared: Arc<Shared>,
}

impl WriteDatabaseQueue {
    pub fn new() -> WriteDatabaseQueue {
        WriteDatabaseQueue {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condition: Condvar::new(),
            }),
        }
    }

    /// Blocks until `writer` is at the head of the queue
    pub fn wait(&self, writer: Writer) -> WriteGuard {
        let mut queue = self.shared.queue.lock();
        // Add writer to the end of the queue if it's not already waiting
        if !queue.contains(&writer) {
            queue.push_back(writer);
        }
        while queue.front() != Some(&writer) {
            self.shared.condition.wait(&mut queue);
        }
        drop(queue);
        WriteGuard {
            shared: Arc::clone(&self.shared),
            owns: true,
        }
    }

    /// Returns true if this writer is now at the front of the queue
    pub fn process(&self, writer: Writer) -> bool {
        let at_front = {
            let mut queue = self.shared.queue.lock();
            if !queue.contains(&writer) {
                queue.push_back(writer);
            }
            queue.front() == Some(&writer)
        };
        if !at_front {
            self.shared.condition.notify_all();
        }
        at_front
    }

    /// Returns true if this writer is anywhere in the queue
    pub fn contains(&self, writer: Writer) -> bool {
        self.shared.queue.lock().contains(&writer)
    }

    /// Claims the head slot after a successful `process` call
    pub fn pop(&self) -> WriteGuard {
        WriteGuard {
            shared: Arc::clone(&self.shared),
            owns: true,
        }
    }
}

impl Default for WriteDatabaseQueue {
    fn default() -> WriteDatabaseQueue {
        WriteDatabaseQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn returns_immediately_when_queue_is_empty() {
        let queue = WriteDatabaseQueue::new();
        let guard = queue.wait(Writer::Testing);
        assert!(guard.is_owned());
        assert!(queue.contains(Writer::Testing));
        drop(guard);
        assert!(!queue.contains(Writer::Testing));
    }

    #[test]
    fn explicit_release_empties_slot() {
        let queue = WriteDatabaseQueue::new();
        let mut guard = queue.wait(Writer::Testing);
        guard.release();
        assert!(!guard.is_owned());
        assert!(!queue.contains(Writer::Testing));
    }

    #[test]
    fn waiters_acquire_in_fifo_order() {
        let queue = Arc::new(WriteDatabaseQueue::new());
        let first = queue.wait(Writer::Testing);
        let (sender, receiver) = channel();
        let handles: Vec<_> = [Writer::ConfirmationHeight, Writer::ProcessBatch]
            .iter()
            .map(|writer| {
                let queue = Arc::clone(&queue);
                let sender = sender.clone();
                let writer = *writer;
                // Enqueue before spawning so insertion order is deterministic
                queue.process(writer);
                thread::spawn(move || {
                    let guard = queue.wait(writer);
                    sender.send(writer).unwrap();
                    drop(guard);
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        drop(first);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), Writer::ConfirmationHeight);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), Writer::ProcessBatch);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn duplicate_writer_is_coalesced() {
        let queue = WriteDatabaseQueue::new();
        assert!(queue.process(Writer::ProcessBatch));
        // Re-inserting the same identity is a no-op
        assert!(queue.process(Writer::ProcessBatch));
        let guard = queue.pop();
        drop(guard);
        assert!(!queue.contains(Writer::ProcessBatch));
    }

    #[test]
    fn process_reports_head_position() {
        let queue = WriteDatabaseQueue::new();
        assert!(queue.process(Writer::ProcessBatch));
        assert!(!queue.process(Writer::ConfirmationHeight));
        assert!(queue.contains(Writer::ConfirmationHeight));
        let guard = queue.pop();
        drop(guard);
        // The earlier non-head writer moved up
        assert!(queue.process(Writer::ConfirmationHeight));
    }
}
