//! WebSocket gateway bridging live client audio to recognition,
//! generation and synthesis backends.
//!
//! Each accepted connection runs one session: audio in, a streaming
//! recognition connection, a sequencer that runs at most one
//! generation+synthesis cycle at a time, and synthesized replies out.

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;

pub use sequencer::{SequencerExit, StageTimeouts, UtteranceSequencer};
pub use server::{router, start_gateway};
pub use session::{SessionEnd, handle_ws_connection, run_session};
pub use state::GatewayState;
