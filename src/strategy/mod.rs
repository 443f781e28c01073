// Trading strategy module
pub mod crossover;

pub use crossover::{MovingAverageState, SignalEngine, Trend};
