//! HTTP surface: configuration, middleware, handlers, server lifecycle and
//! shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::{routes, AppState};
pub use middleware::{with_http_layers, CORRELATION_HEADER, REQUEST_ID_HEADER};
pub use module::NetworkModule;
pub use shutdown::*;
