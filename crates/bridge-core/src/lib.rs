//! OpenAPI->MCP bridge core.
//!
//! Turns a remote API's OpenAPI description into MCP tools and proxies tool calls to that API,
//! authorizing every request with a bearer credential that is acquired, cached, and renewed on
//! demand.
//!
//! Startup order is fixed: authenticate, load the description, synthesize the catalog. See
//! [`runtime::Bridge::start`].

pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod loader;
pub mod resolver;
pub mod runtime;
pub mod synthesizer;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runtime::{Bridge, ToolProvider};
