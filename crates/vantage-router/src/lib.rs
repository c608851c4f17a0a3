// Vantage Model Router
// Candidate selection, circuit breaking, budget accounting, response caching.

mod breaker;
mod budget;
mod cache;
mod catalog;
mod error;
mod router;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
pub use budget::BudgetLedger;
pub use cache::{CachedResponse, ResponseCache};
pub use catalog::ModelCatalog;
pub use error::{RouterError, RouterResult};
pub use router::{ModelRouter, RouteOutcome, RouterConfig};
