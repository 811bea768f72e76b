//! State machine module.

pub mod flow;
pub mod machine;

pub use flow::{Disposition, FlowController};
pub use machine::{FailureKind, SessionState, Stage, TransferAction, TransferMachine};
