//! Streaming session management for Parley.

mod streaming;

pub use streaming::{
    StreamPhase, StreamUpdate, StreamingManager, StreamingState, TERMINAL_UPDATE_TIMEOUT,
};
