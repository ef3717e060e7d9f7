//! Time-bucketed retry scheduler.
//!
//! Retries caused by the same cluster event tend to arrive in storms. The
//! delay queue coalesces them: the first retry of a kind arms a one-shot
//! timer, later ones pile into the same bucket, and the whole bucket fires
//! at once when the timer elapses. A bucket can carry one side effect that
//! runs once per flush no matter how many retries accumulated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Bucket {
    waiters: Vec<oneshot::Sender<()>>,
    callback: Option<Callback>,
}

/// Coalescing retry scheduler with named buckets.
pub struct DelayQueue {
    buckets: Mutex<HashMap<&'static str, Bucket>>,
}

impl DelayQueue {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueues a retry into `bucket` and returns a receiver that
    /// resolves when the bucket flushes.
    ///
    /// The first push into an empty bucket arms a timer for `timeout`;
    /// later pushes join the same flush without extending it. The first
    /// `callback` supplied is invoked once after the waiters are released.
    pub fn push(
        self: &Arc<Self>,
        bucket: &'static str,
        timeout: Duration,
        callback: Option<Callback>,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        let mut buckets = self.buckets.lock().unwrap();
        let armed = buckets.contains_key(bucket);
        let entry = buckets.entry(bucket).or_default();
        entry.waiters.push(tx);
        if entry.callback.is_none() {
            entry.callback = callback;
        }
        drop(buckets);

        if !armed {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                queue.flush(bucket);
            });
        }

        rx
    }

    fn flush(&self, bucket: &'static str) {
        let Some(Bucket { waiters, callback }) = self.buckets.lock().unwrap().remove(bucket)
        else {
            return;
        };
        trace!("flushing {} retries from bucket {}", waiters.len(), bucket);
        for tx in waiters {
            let _ = tx.send(());
        }
        if let Some(callback) = callback {
            callback();
        }
    }
}
