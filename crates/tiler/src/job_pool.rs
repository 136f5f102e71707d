//! Bounded pool for the file and tile jobs of one phase.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

#[derive(Default)]
struct Shared {
    pending: Mutex<usize>,
    done: Condvar,
    errors: Mutex<Vec<Error>>,
}

/// Runs jobs on a dedicated rayon pool in FIFO order.
///
/// A failing or panicking job is recorded and its siblings keep running. `join` waits
/// for everything added so far; the pool can take more jobs afterwards.
pub struct JobPool {
    name: String,
    pool: ThreadPool,
    shared: Arc<Shared>,
}

impl JobPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("{name} pool: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            pool,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue `job`. `label` names it in the error raised if it panics.
    pub fn add<F>(&self, label: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        let shared = Arc::clone(&self.shared);
        *shared.pending.lock() += 1;

        self.pool.spawn_fifo(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result,
                Err(payload) => Err(Error::JobPanicked {
                    job: label,
                    message: panic_message(payload.as_ref()),
                }),
            };

            if let Err(err) = outcome {
                shared.errors.lock().push(err);
            }

            let mut pending = shared.pending.lock();
            *pending -= 1;
            if *pending == 0 {
                shared.done.notify_all();
            }
        });
    }

    /// Block until every job added so far has finished.
    pub fn join(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.done.wait(&mut pending);
        }
        log::debug!("{} pool joined", self.name);
    }

    /// Errors recorded since the last call, in completion order.
    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.shared.errors.lock())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
