pub mod case;
pub mod message;

pub use case::{Case, CaseStatus, CaseSummary};
pub use message::{Message, Role};
