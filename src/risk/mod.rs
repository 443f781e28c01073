// Risk management module
pub mod sizer;

pub use sizer::{NoActionReason, RiskLimits, RiskSizer, SizingDecision};
