//! Core Server Framework Module
//!
//! - config.rs: transport selection and environment configuration
//! - server.rs: MCP dispatcher, HTTP application and STDIO loop
//! - sse.rs: HTTP+SSE session transport

pub mod config;
pub mod server;
pub mod sse;
