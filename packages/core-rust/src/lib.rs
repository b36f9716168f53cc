//! Ember Core — events, worker arguments, broker frames, and broker URIs.

pub mod args;
pub mod event;
pub mod frame;
pub mod uri;

pub use args::WorkerArgs;
pub use event::{field_str, Event, EventFilter, Payload};
pub use frame::{decode_frame, encode_frame, BrokerFrame, FrameError};
pub use uri::{BrokerUri, UriError};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
