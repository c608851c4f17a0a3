// Vantage Context Store
// Versioned, audited storage shared across agents.

mod store;
mod types;

pub use store::ContextStore;
pub use types::{ContextError, ContextResult};
