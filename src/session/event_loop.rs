//! Single-threaded serialization point of a session.
//!
//! Producer threads (channel readers, the engine listener, terminal agents) never touch session
//! state directly: they [`Dispatcher::dispatch`] a closure which the loop later runs with
//! exclusive access to the state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

/// Default queue capacity, producers block when the queue is full.
pub const QUEUE_CAPACITY: usize = 10;

pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Task<S>),
    Wakeup,
}

/// Producer side of an [`EventLoop`].
pub struct Dispatcher<S> {
    sender: SyncSender<Message<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> Dispatcher<S> {
    /// Enqueue a task, blocking while the queue is full.
    ///
    /// Return `false` if the loop is gone, the task is dropped in that case.
    pub fn dispatch(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.sender.send(Message::Run(Box::new(task))).is_ok()
    }
}

/// Stop flag of an [`EventLoop`], may be triggered from the loop itself or from any thread.
pub struct LoopStopper<S> {
    flag: Arc<AtomicBool>,
    sender: SyncSender<Message<S>>,
}

impl<S> Clone for LoopStopper<S> {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<S> LoopStopper<S> {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // never block here: the caller may be the loop itself
        if let Err(TrySendError::Disconnected(_)) = self.sender.try_send(Message::Wakeup) {
            log::debug!(target: "session", "stop requested after the loop finished");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct EventLoop<S> {
    receiver: Receiver<Message<S>>,
    sender: SyncSender<Message<S>>,
    stopped: Arc<AtomicBool>,
}

impl<S> EventLoop<S> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        Self {
            receiver,
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher {
            sender: self.sender.clone(),
        }
    }

    pub fn stopper(&self) -> LoopStopper<S> {
        LoopStopper {
            flag: self.stopped.clone(),
            sender: self.sender.clone(),
        }
    }

    /// Run tasks in arrival order until stopped.
    ///
    /// Tasks still queued when the loop stops are dropped without running.
    pub fn run(self, state: &mut S) {
        let EventLoop {
            receiver,
            sender,
            stopped,
        } = self;
        // the loop keeps no sender of its own, so it also ends when every producer is gone
        drop(sender);

        while !stopped.load(Ordering::SeqCst) {
            match receiver.recv() {
                Ok(Message::Run(task)) => task(state),
                Ok(Message::Wakeup) => {}
                Err(_) => break,
            }
        }
        log::debug!(target: "session", "event loop finished");
    }
}
