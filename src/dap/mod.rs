//! Debug Adapter Protocol plumbing: message envelopes, request arguments, framing and tracing.

pub mod args;
pub mod protocol;
pub mod tracer;
pub mod transport;
