mod context;
mod event;
mod mission;
mod policy;
mod routing;

pub use context::*;
pub use event::*;
pub use mission::*;
pub use policy::*;
pub use routing::*;
