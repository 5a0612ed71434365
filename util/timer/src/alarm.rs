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

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::worker::{Task, Worker};

struct Operation {
    wakeup: Instant,
    // None is the shutdown sentinel
    function: Option<Task>,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Operation) -> bool {
        self.wakeup == other.wakeup
    }
}

impl Eq for Operation {}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Operation) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Operation {
    fn cmp(&self, other: &Operation) -> Ordering {
        self.wakeup.cmp(&other.wakeup)
    }
}

struct AlarmShared {
    operations: Mutex<BinaryHeap<Reverse<Operation>>>,
    condition: Condvar,
}

/// Sleep-sorted delayed task scheduler. Due tasks are handed to an internal
/// worker thread so a slow task never delays the schedule.
pub struct Alarm {
    shared: Arc<AlarmShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Alarm {
        let shared = Arc::new(AlarmShared {
            operations: Mutex::new(BinaryHeap::new()),
            condition: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("alarm".to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        Alarm {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &AlarmShared) {
        let worker = Worker::new("alarm.worker");
        let mut operations = shared.operations.lock();
        loop {
            match operations.peek() {
                Some(Reverse(operation)) if operation.function.is_none() => break,
                Some(Reverse(operation)) => {
                    let wakeup = operation.wakeup;
                    if wakeup <= Instant::now() {
                        let task = operations.pop().unwrap().0.function.expect("Sentinel is handled above");
                        worker.push_task(task);
                    } else {
                        shared.condition.wait_until(&mut operations, wakeup);
                    }
                }
                None => {
                    shared.condition.wait(&mut operations);
                }
            }
        }
    }

    pub fn add(&self, wakeup: Instant, function: Task) {
        self.push(Operation {
            wakeup,
            function: Some(function),
        });
    }

    fn push(&self, operation: Operation) {
        {
            let mut operations = self.shared.operations.lock();
            operations.push(Reverse(operation));
        }
        self.shared.condition.notify_all();
    }

    pub fn len(&self) -> usize {
        self.shared.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Alarm {
    fn default() -> Alarm {
        Alarm::new()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.push(Operation {
            wakeup: Instant::now(),
            function: None,
        });
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_in_wakeup_order() {
        let alarm = Alarm::new();
        let (sender, receiver) = channel();
        let now = Instant::now();
        for (i, delay) in [50u64, 10, 30].iter().enumerate() {
            let sender = sender.clone();
            alarm.add(now + Duration::from_millis(*delay), Box::new(move || {
                sender.send(i).unwrap();
            }));
        }
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    }

    #[test]
    fn immediate_task_fires() {
        let alarm = Alarm::new();
        let (sender, receiver) = channel();
        alarm.add(Instant::now(), Box::new(move || {
            sender.send(()).unwrap();
        }));
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
