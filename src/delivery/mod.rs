//! Delivery strategies: how confirmed Changes reach the code-editing
//! agent.
//!
//! Exactly one strategy is active per deployment, chosen by
//! [`crate::config::DeliveryMode`]: [`subprocess::SubprocessExecutor`]
//! spawns one agent process per Change as it arrives, while
//! [`toolcall::ToolCallSurface`] exposes the queue as tools a long-running
//! agent session pulls from ([`rpc`] frames it over stdio and HTTP).
//! Prompt rendering and commit extraction are shared between both.

pub mod commit;
pub mod prompt;
pub mod rpc;
pub mod subprocess;
pub mod toolcall;
