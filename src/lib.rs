//! Pipeline execution engine with agent/MCP-server coupling.
//!
//! Users compose a directed acyclic graph of typed nodes (input, output,
//! text transforms, agent calls, MCP tool calls) and execute it against a
//! single input. A coupling registry pairs agents with MCP servers once a
//! compatibility score between their capability tags clears a threshold;
//! tool-call nodes only run through an active coupling.

pub mod compat;
pub mod config;
pub mod coupling;
pub mod engine;
pub mod execution;
pub mod executor;
pub mod gateway;
pub mod logger;
pub mod mcp;
pub mod message;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod validator;
