//! nudge routes visual tweaks flagged on a live web page to a code-editing
//! agent.
//!
//! A browser-side picker submits Changes over an authenticated WebSocket;
//! the [`store`] keeps them durable across restarts; a [`delivery`]
//! strategy hands them to the agent, either by spawning one agent process
//! per Change or by exposing the queue as tool calls; [`memory`] gives the
//! agent the element's edit history so repeated tweaks to the same element
//! converge instead of thrashing.

pub mod config;
pub mod delivery;
pub mod errors;
pub mod gateway;
pub mod hook;
pub mod memory;
pub mod registry;
pub mod store;
