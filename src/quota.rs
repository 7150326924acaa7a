//! Per-caller admission control: request rate and daily output-token budget

mod budget;
mod rate_limiter;

pub use budget::{BudgetDecision, TokenBudgetTracker};
pub use rate_limiter::{Admission, RateLimiter};
