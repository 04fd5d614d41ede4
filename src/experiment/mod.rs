//! Protocol model and execution.

pub mod interpreter;
pub mod protocol;
pub mod run_engine;
pub mod state;

pub use protocol::{Command, Instruction, Protocol};
pub use run_engine::{ProtocolRunner, RunProgress, RunnerEvent};
pub use state::{RunSummary, RunnerState};
