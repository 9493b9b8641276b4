//! Node handlers that need I/O beyond the engine.

pub mod http_node;

pub use http_node::HttpHandler;
