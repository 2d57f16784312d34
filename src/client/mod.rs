//! Chat panel client: submits messages to the relay and assembles the
//! streamed reply into the visible conversation.

pub mod framing;
pub mod session;
pub mod transport;

pub use session::{ChatSession, StreamPhase, SubmitOutcome};
pub use transport::HttpTransport;
