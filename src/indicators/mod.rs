// Technical indicators module
// Rolling moving averages backing the crossover signal

pub mod moving_average;

pub use moving_average::RollingSma;
