use crate::prelude::graphql::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Fired by the scheduler whenever a polling query is due.
pub(crate) type PollCallback = Arc<dyn Fn(QueryId) + Send + Sync>;

struct PollEntry {
    interval: Duration,
    next_due: Instant,
}

#[derive(Default)]
struct PollState {
    entries: HashMap<QueryId, PollEntry>,
    running: bool,
}

/// Coalesced polling: one timer task tracks the minimum remaining interval
/// across all polling queries, instead of one timer per query. The task
/// reschedules itself on every tick and on every start/stop call, and exits
/// once no query is polling.
pub(crate) struct PollScheduler {
    state: Arc<Mutex<PollState>>,
    notify: Arc<Notify>,
    callback: PollCallback,
}

impl PollScheduler {
    pub(crate) fn new(callback: PollCallback) -> PollScheduler {
        PollScheduler {
            state: Arc::new(Mutex::new(PollState::default())),
            notify: Arc::new(Notify::new()),
            callback,
        }
    }

    /// Register or update a polling query. Spawns the shared timer task if
    /// it is not already running.
    pub(crate) fn start(&self, id: QueryId, interval: Duration) {
        let spawn_timer = {
            let mut state = self.state.lock();
            state.entries.insert(
                id,
                PollEntry {
                    interval,
                    next_due: Instant::now() + interval,
                },
            );
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if spawn_timer {
            let state = Arc::clone(&self.state);
            let notify = Arc::clone(&self.notify);
            let callback = Arc::clone(&self.callback);
            tokio::spawn(async move {
                run_timer(state, notify, callback).await;
            });
        }
        self.notify.notify_one();
    }

    pub(crate) fn stop(&self, id: QueryId) {
        self.state.lock().entries.remove(&id);
        self.notify.notify_one();
    }

    pub(crate) fn stop_all(&self) {
        self.state.lock().entries.clear();
        self.notify.notify_one();
    }

    pub(crate) fn is_polling(&self, id: QueryId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// The number of live timer tasks: 1 while anything polls, 0 otherwise.
    pub fn active_timers(&self) -> usize {
        usize::from(self.state.lock().running)
    }
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PollScheduler")
            .field("entries", &state.entries.len())
            .field("running", &state.running)
            .finish()
    }
}

async fn run_timer(state: Arc<Mutex<PollState>>, notify: Arc<Notify>, callback: PollCallback) {
    loop {
        let deadline = {
            let mut state = state.lock();
            match state.entries.values().map(|entry| entry.next_due).min() {
                Some(deadline) => deadline,
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                let due = {
                    let mut state = state.lock();
                    let mut due = Vec::new();
                    for (id, entry) in state.entries.iter_mut() {
                        if entry.next_due <= now {
                            entry.next_due = now + entry.interval;
                            due.push(*id);
                        }
                    }
                    due
                };
                // fire outside the lock: the callback re-enters the engine
                for id in due {
                    (callback)(id);
                }
            }
            _ = notify.notified() => {
                // an interval was added or removed: recompute the deadline
            }
        }
    }
}
