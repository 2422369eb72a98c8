//! Cancellable one-shot timers
//!
//! A single background thread owns a deadline heap. Callbacks run on that
//! thread, one at a time, and must not block for long.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule { id: u64, deadline: Instant, callback: Callback },
    Cancel(u64),
    Shutdown,
}

/// Timer thread handle
///
/// Dropping the service stops the thread; pending timers never fire.
pub struct TimerService {
    tx: Sender<Command>,
    next_id: Arc<AtomicU64>,
}

impl TimerService {
    /// Start the timer thread
    pub fn start() -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        thread::Builder::new()
            .name("rxp-timer".into())
            .spawn(move || run(rx))?;

        Ok(TimerService {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Run `callback` once after `delay`
    ///
    /// The timer is cancelled when the returned handle is cancelled or
    /// dropped.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let _ = self.tx.send(Command::Schedule {
            id,
            deadline,
            callback: Box::new(callback),
        });

        TimerHandle {
            id,
            tx: self.tx.clone(),
            deadline,
            active: true,
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Owned handle to a scheduled timer
pub struct TimerHandle {
    id: u64,
    tx: Sender<Command>,
    deadline: Instant,
    active: bool,
}

impl TimerHandle {
    /// Cancel the timer; a no-op if it already fired
    pub fn cancel(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.tx.send(Command::Cancel(self.id));
        }
    }

    /// When the timer is due
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run(rx: Receiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut callbacks: HashMap<u64, Callback> = HashMap::new();

    loop {
        // Fire everything that is due
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(callback) = callbacks.remove(&id) {
                callback();
            }
        }

        let command = match deadlines.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule { id, deadline, callback } => {
                deadlines.push(Reverse((deadline, id)));
                callbacks.insert(id, callback);
            }
            Command::Cancel(id) => {
                callbacks.remove(&id);
            }
            Command::Shutdown => break,
        }
    }

    tracing::debug!("Timer thread stopped with {} pending timers", callbacks.len());
}
