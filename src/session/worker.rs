use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long dropping a [`Worker`] waits for its thread.
pub const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag handed to a worker thread.
#[derive(Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn is_stopping(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst)
    }
}

/// Background thread scoped to its owner.
///
/// Dropping the worker raises the stop flag and joins the thread. A thread that does not finish
/// within [`JOIN_GRACE`] (blocked in a read without timeout) is left detached.
pub struct Worker {
    name: String,
    token: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        name: &str,
        body: impl FnOnce(StopToken) + Send + 'static,
    ) -> io::Result<Self> {
        let token = StopToken::default();
        let handle = thread::Builder::new().name(name.to_string()).spawn({
            let token = token.clone();
            move || body(token)
        })?;
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
        })
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.stop();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + JOIN_GRACE;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(target: "session", "worker {} did not stop in time, detaching", self.name);
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            log::error!(target: "session", "worker {} panicked", self.name);
        }
    }
}
