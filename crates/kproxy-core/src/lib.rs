pub mod bootstrap;
pub mod compactor;
pub mod engine;
pub mod hub;
pub mod mcp;
pub mod routing;
pub mod sanitize;
pub mod state;
pub mod upstream;

pub use bootstrap::{Bootstrap, bootstrap};
pub use engine::{ChatOutcome, ProxyEngine};
pub use hub::{Notice, ObserverHub};
pub use routing::{RouteDecision, Router};
pub use state::{SessionHandle, SessionRegistry};
