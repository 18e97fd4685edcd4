//! waypoint-router: typed request matching, a rule DSL, and dynamic
//! upstream selection for a fronting reverse proxy.

pub mod config;
pub mod dynamic;
pub mod error;
pub mod expr;
pub mod metrics;
pub mod parser;
pub mod request;
pub mod router;
pub mod rule;
pub mod types;
pub mod upstream;

pub use error::{Error, Result};
pub use expr::Expr;
pub use request::{Env, Request, Schema};
pub use router::Router;
pub use rule::{Rule, Rules};
pub use upstream::{Protocol, Selection, Server, Upstream};
