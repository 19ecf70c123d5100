//! AutoGLM cockpit - routes user input to a chat backend or a device
//! automation agent and streams the agent's progress to every observer.
//!
//! The automation agent is supervised as an external process; at most one
//! run exists at a time and its output reaches observers through the
//! OutputRelay in capture order.

pub mod api;
pub mod app_state;
pub mod chat_backend;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod history;
pub mod mode;
pub mod relay;
pub mod supervisor;
