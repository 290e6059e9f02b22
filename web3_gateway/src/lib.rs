pub mod app;
pub mod config;
pub mod digest;
pub mod errors;
pub mod frontend;
pub mod jsonrpc;
pub mod jsonrpc_schema;
pub mod quota;
pub mod reqctx;
pub mod response_cache;
pub mod rpcs;
pub mod stats;
