//! Live-connection gauge with a drain barrier for shutdown.

use std::time::Duration;
use tokio::sync::watch;

/// Counts live sessions and lets shutdown wait until the count has
/// stayed at zero for the configured drain window.
pub struct ConnectionCounter {
    count: watch::Sender<i64>,
    drain: Duration,
}

impl ConnectionCounter {
    pub fn new(drain: Duration) -> Self {
        let (count, _) = watch::channel(0);
        Self { count, drain }
    }

    /// Increment the gauge and return the new value.
    pub fn add(&self) -> i64 {
        let mut value = 0;
        self.count.send_modify(|c| {
            *c += 1;
            value = *c;
        });
        value
    }

    /// Decrement the gauge. Calling without a matching `add` is a
    /// programming bug and is not defended against.
    pub fn done(&self) {
        self.count.send_modify(|c| *c -= 1);
    }

    pub fn count(&self) -> i64 {
        *self.count.borrow()
    }

    /// Resolve once the count has been zero continuously for the drain
    /// duration. A zero duration fires as soon as the count hits zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        loop {
            if *rx.borrow_and_update() != 0 {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.drain) => return,
                changed = rx.wait_for(|count| *count != 0) => {
                    if changed.is_err() {
                        return;
                    }
                    // A session arrived during the drain window; start over.
                }
            }
        }
    }
}
