//! Agent-to-agent transport: JSON-RPC 2.0 envelopes, the in-process server
//! that dispatches them to registered agents, and the client that resolves
//! routing across the node mesh (spec.md §4.5, §6).

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{A2aClient, Resolver};
pub use rpc::{Artifact, Message, Part, RpcError, RpcRequest, RpcResponse, Task, TaskState};
pub use server::A2aServer;
