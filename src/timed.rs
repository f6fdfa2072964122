// Cantrip
// Copyright (C) 2026  The Cantrip Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! A timed dispatch queue for wall-clock deadlines.
//!
//! A [`TimedQueue`] executes actions at wall-clock deadlines from a
//! background worker. Actions are either OSC sends (a message or a prepared
//! [`Bundler`]) or arbitrary callbacks. The queue exists to decouple event
//! submission from the audio engine's own OSC input buffer: an application
//! can schedule a long stream of bundles, each carrying its own engine-side
//! timetag, and the worker transmits every bundle shortly before its
//! embedded time instead of flooding the engine up front.
//!
//! Tasks with equal deadlines execute in submission order. A task whose
//! deadline is already past when enqueued runs on the next worker wake.
//! Callbacks run inline on the worker and are expected to return promptly; a
//! slow callback delays every task behind it. Callbacks that need isolation
//! should be enqueued with [`Action::spawned_callback`], which starts a
//! fresh thread per invocation.

use crate::error::{Error, Result};
use crate::osc::{unix_now, Bundler, Message};
use crate::transport::OscTransport;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Upper bound on one condvar wait, so the worker periodically rechecks
/// whether its queue handle is still alive.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(250);

/// What a [`TimedQueue`] does when a task comes due.
pub enum Action {
    /// Flatten the bundler at dispatch time and send the datagram. The
    /// bundler's own timetag controls the engine-side timing; the task
    /// deadline only controls when the datagram leaves the socket.
    Bundle {
        bundler: Bundler,
        peer: Option<String>,
    },
    /// Send one message.
    Message {
        message: Message,
        peer: Option<String>,
    },
    /// Invoke a callback, inline on the worker or on a fresh thread.
    Callback {
        function: Box<dyn FnOnce() + Send>,
        spawn: bool,
    },
}

impl Action {
    /// A callback invoked inline on the worker thread.
    pub fn callback<F>(function: F) -> Action
    where
        F: FnOnce() + Send + 'static,
    {
        Action::Callback {
            function: Box::new(function),
            spawn: false,
        }
    }

    /// A callback invoked on its own thread, isolating the worker from slow
    /// or blocking work.
    pub fn spawned_callback<F>(function: F) -> Action
    where
        F: FnOnce() + Send + 'static,
    {
        Action::Callback {
            function: Box::new(function),
            spawn: true,
        }
    }
}

struct TimedTask {
    deadline: SystemTime,
    seq: u64,
    action: Action,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &TimedTask) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &TimedTask) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &TimedTask) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct TaskState {
    tasks: BinaryHeap<Reverse<TimedTask>>,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<TaskState>,
    wake: Condvar,
    transport: OscTransport,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A priority queue that dispatches actions at wall-clock deadlines.
///
/// `TimedQueue` is cheap to clone; every clone feeds the same worker.
#[derive(Clone)]
pub struct TimedQueue {
    shared: Arc<Shared>,
}

impl TimedQueue {
    /// Creates a queue sending through the given transport and starts its
    /// worker thread.
    pub fn new(transport: OscTransport) -> TimedQueue {
        let shared = Arc::new(Shared {
            state: Mutex::new(TaskState {
                tasks: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            wake: Condvar::new(),
            transport,
            worker: Mutex::new(None),
        });
        let handle = thread::spawn({
            let weak = Arc::downgrade(&shared);
            move || worker_loop(weak)
        });
        *shared.worker.lock().unwrap() = Some(handle);
        TimedQueue { shared }
    }

    /// Enqueues an action for execution at `deadline`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Shutdown`] once [`close`](TimedQueue::close) has
    /// been called.
    pub fn put(&self, deadline: SystemTime, action: Action) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Shutdown);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.push(Reverse(TimedTask {
                deadline,
                seq,
                action,
            }));
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Enqueues one message for transmission at `deadline`.
    pub fn put_msg(
        &self,
        deadline: SystemTime,
        message: impl Into<Message>,
        peer: Option<&str>,
    ) -> Result<()> {
        self.put(
            deadline,
            Action::Message {
                message: message.into(),
                peer: peer.map(str::to_owned),
            },
        )
    }

    /// Enqueues a bundler for transmission at `deadline`.
    ///
    /// The bundler is flattened when the deadline arrives, using its own
    /// timetag for the engine-side schedule, so the datagram leaves ahead of
    /// the embedded play time by whatever margin the caller chose.
    pub fn put_bundler(&self, deadline: SystemTime, bundler: Bundler) -> Result<()> {
        let peer = bundler.receiver_name().map(str::to_owned);
        self.put(deadline, Action::Bundle { bundler, peer })
    }

    /// The number of tasks waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }

    /// Stops the worker after it finishes the tasks that are already due.
    ///
    /// Tasks with future deadlines are cancelled; in-flight callbacks
    /// complete normally. Subsequent `put` calls fail with
    /// [`Error::Shutdown`].
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.wake.notify_all();
        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

enum Step {
    Run(Action),
    Idle,
    Exit,
}

fn worker_loop(weak: Weak<Shared>) {
    loop {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let step = next_step(&shared);
        match step {
            Step::Run(action) => execute(&shared, action),
            Step::Idle => {}
            Step::Exit => return,
        }
    }
}

fn next_step(shared: &Shared) -> Step {
    let mut state = shared.state.lock().unwrap();
    let now = SystemTime::now();
    let earliest = state.tasks.peek().map(|Reverse(task)| task.deadline);
    match earliest {
        Some(deadline) if deadline <= now => {
            let Reverse(task) = state.tasks.pop().unwrap();
            Step::Run(task.action)
        }
        _ if state.closed => Step::Exit,
        Some(deadline) => {
            let wait = deadline
                .duration_since(now)
                .unwrap_or(Duration::ZERO)
                .min(MAX_IDLE_WAIT);
            let _unused = shared.wake.wait_timeout(state, wait).unwrap();
            Step::Idle
        }
        None => {
            let _unused = shared.wake.wait_timeout(state, MAX_IDLE_WAIT).unwrap();
            Step::Idle
        }
    }
}

fn execute(shared: &Shared, action: Action) {
    match action {
        Action::Message { message, peer } => {
            if let Err(err) = shared.transport.send_message(&message, peer.as_deref()) {
                log::error!("timed send of {} failed: {}", message.address(), err);
            }
        }
        Action::Bundle { bundler, peer } => {
            let result = bundler
                .to_raw_osc(unix_now())
                .and_then(|datagram| shared.transport.send_raw(&datagram, peer.as_deref()));
            if let Err(err) = result {
                log::error!("timed bundle send failed: {}", err);
            }
        }
        Action::Callback { function, spawn } => {
            if spawn {
                thread::spawn(move || run_callback(function));
            } else {
                run_callback(function);
            }
        }
    }
}

fn run_callback(function: Box<dyn FnOnce() + Send>) {
    if panic::catch_unwind(AssertUnwindSafe(function)).is_err() {
        log::error!("timed queue callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OscTransport;
    use pretty_assertions::assert_eq;

    fn test_queue() -> TimedQueue {
        let transport = OscTransport::bind(0, 8192, Duration::from_millis(500)).unwrap();
        TimedQueue::new(transport)
    }

    #[test]
    fn test_dispatch_order_and_punctuality() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let start = SystemTime::now() + Duration::from_millis(50);

        for i in 0..50_u64 {
            let deadline = start + Duration::from_millis(i * 40);
            let observed = Arc::clone(&observed);
            queue
                .put(
                    deadline,
                    Action::callback(move || {
                        observed.lock().unwrap().push((i, deadline, SystemTime::now()));
                    }),
                )
                .unwrap();
        }

        while queue.pending() > 0 {
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(50));

        let observed = observed.lock().unwrap();
        let order: Vec<u64> = observed.iter().map(|entry| entry.0).collect();
        assert_eq!(order, (0..50).collect::<Vec<u64>>());
        for (_, deadline, dispatched) in observed.iter() {
            // Never early; lateness is bounded loosely to tolerate CI jitter.
            let lateness = dispatched
                .duration_since(*deadline)
                .expect("task dispatched before its deadline");
            assert!(lateness < Duration::from_millis(250), "late by {:?}", lateness);
        }
    }

    #[test]
    fn test_equal_deadlines_run_in_submission_order() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let deadline = SystemTime::now() + Duration::from_millis(50);
        for i in 0..10 {
            let observed = Arc::clone(&observed);
            queue
                .put(
                    deadline,
                    Action::callback(move || observed.lock().unwrap().push(i)),
                )
                .unwrap();
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*observed.lock().unwrap(), (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn test_past_deadline_runs_immediately() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = Arc::clone(&observed);
            queue
                .put(
                    SystemTime::now() - Duration::from_secs(5),
                    Action::callback(move || observed.lock().unwrap().push(())),
                )
                .unwrap();
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(observed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_worker() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        queue
            .put(
                SystemTime::now(),
                Action::callback(|| panic!("deliberate")),
            )
            .unwrap();
        {
            let observed = Arc::clone(&observed);
            queue
                .put(
                    SystemTime::now() + Duration::from_millis(20),
                    Action::callback(move || observed.lock().unwrap().push(())),
                )
                .unwrap();
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(observed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_close_cancels_future_tasks() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = Arc::clone(&observed);
            queue
                .put(
                    SystemTime::now() + Duration::from_secs(60),
                    Action::callback(move || observed.lock().unwrap().push(())),
                )
                .unwrap();
        }
        queue.close();
        assert!(observed.lock().unwrap().is_empty());
        let result = queue.put(SystemTime::now(), Action::callback(|| {}));
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[test]
    fn test_put_bundler_transmits_bundle() {
        let receiver = OscTransport::bind(0, 8192, Duration::from_millis(500)).unwrap();
        let incoming = receiver.add_reply_pair("/sync", "/synced");
        let sender = OscTransport::bind(0, 8192, Duration::from_millis(500)).unwrap();
        sender.add_peer("engine", receiver.local_addr());
        sender.set_default_peer("engine");
        let queue = TimedQueue::new(sender);

        let mut bundler = Bundler::new(0.0);
        bundler.add(0.25, Message::new("/synced").arg(5)).unwrap();
        queue
            .put_bundler(SystemTime::now() + Duration::from_millis(30), bundler)
            .unwrap();

        let payload = incoming.get(Duration::from_secs(2), true).unwrap();
        assert_eq!(payload, vec![rosc::OscType::Int(5)]);
    }

    #[test]
    fn test_put_msg_transmits_message() {
        let receiver = OscTransport::bind(0, 8192, Duration::from_millis(500)).unwrap();
        let incoming = receiver.add_reply_pair("/sync", "/synced");
        let sender = OscTransport::bind(0, 8192, Duration::from_millis(500)).unwrap();
        sender.add_peer("engine", receiver.local_addr());
        sender.set_default_peer("engine");
        let queue = TimedQueue::new(sender);

        queue
            .put_msg(SystemTime::now(), Message::new("/synced").arg(6), None)
            .unwrap();

        let payload = incoming.get(Duration::from_secs(2), true).unwrap();
        assert_eq!(payload, vec![rosc::OscType::Int(6)]);
    }

    #[test]
    fn test_spawned_callback_runs() {
        let queue = test_queue();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = Arc::clone(&observed);
            queue
                .put(
                    SystemTime::now(),
                    Action::spawned_callback(move || observed.lock().unwrap().push(())),
                )
                .unwrap();
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(observed.lock().unwrap().len(), 1);
    }
}
