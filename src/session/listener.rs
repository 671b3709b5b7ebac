//! Engine event pump.

use crate::engine::{DebugEvent, EventQueue};
use crate::session::event_loop::Dispatcher;
use crate::session::worker::Worker;
use std::io;
use std::time::Duration;

/// How long the listener blocks on the queue before looking at its stop flag.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Start a worker moving engine events from `queue` into the session loop.
///
/// The worker ends when it is dropped or when the loop is gone.
pub fn spawn<S: 'static>(
    queue: Box<dyn EventQueue>,
    dispatcher: Dispatcher<S>,
    on_event: fn(&mut S, DebugEvent),
) -> io::Result<Worker> {
    Worker::spawn("engine-listener", move |token| {
        while !token.is_stopping() {
            let Some(event) = queue.wait_for_event(POLL_TIMEOUT) else {
                continue;
            };
            log::trace!(target: "session", "engine event {event:?}");
            if !dispatcher.dispatch(move |session| on_event(session, event)) {
                log::debug!(target: "session", "event loop gone, listener exits");
                break;
            }
        }
    })
}
