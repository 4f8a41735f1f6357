// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use buffer::CircularBuffer;
pub use config::ServerConfig;
pub use error::{LecternError, LecternResult};
pub use http::{Method, Request, Response, Version};
pub use logging::{init_logging, init_logging_json, init_logging_with_level};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use parser::ParseError;
pub use pool::Pool;
pub use router::{Params, Router, Routes};
pub use server::{Server, ShutdownHandle};
