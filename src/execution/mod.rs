// Order execution module
pub mod gate;

pub use gate::{ExecutionGate, ExecutionMode, ExecutionRecord, GateOutcome, GatePhase};
