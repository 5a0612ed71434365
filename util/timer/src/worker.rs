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
use std::thread;

use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send>;

struct WorkerState {
    queue: VecDeque<Task>,
    stopped: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    condition: Condvar,
}

/// Serial task queue drained by one dedicated thread
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn new(name: &str) -> Worker {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name(name.to_string()).spawn(move || Self::run(&shared)).unwrap()
        };
        Worker {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &WorkerShared) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                task();
                // Reduce contention with producers, which are mostly on
                // latency-sensitive threads
                thread::yield_now();
                state = shared.state.lock();
            } else {
                shared.condition.wait(&mut state);
            }
        }
    }

    pub fn push_task(&self, task: Task) {
        {
            let mut state = self.shared.state.lock();
            if !state.stopped {
                state.queue.push_back(task);
            }
        }
        self.shared.condition.notify_one();
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.queue.clear();
        }
        self.shared.condition.notify_one();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_pushed_tasks_in_fifo_order() {
        let worker = Worker::new("test.worker");
        let (sender, receiver) = channel();
        for i in 0..4 {
            let sender = sender.clone();
            worker.push_task(Box::new(move || {
                sender.send(i).unwrap();
            }));
        }
        for i in 0..4 {
            assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }
    }

    #[test]
    fn stop_discards_queued_tasks() {
        let executed = Arc::new(AtomicUsize::new(0));
        let mut worker = Worker::new("test.worker");
        let (sender, receiver) = channel();
        {
            let sender = sender.clone();
            worker.push_task(Box::new(move || {
                sender.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            }));
        }
        for _ in 0..8 {
            let executed = Arc::clone(&executed);
            worker.push_task(Box::new(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.stop();
        worker.push_task(Box::new(|| unreachable!()));
        assert!(executed.load(Ordering::SeqCst) < 8);
    }
}
