pub mod client;
pub mod event_stream;

pub use client::{backoff_delay, UpstreamClient};
pub use event_stream::{EventStreamDecoder, KiroEvent};
