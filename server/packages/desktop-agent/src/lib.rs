//! Desktop agent core: drives a decision service against a sandboxed
//! virtual desktop.

pub mod actions;
pub mod agent_loop;
pub mod cli;
pub mod decision;
pub mod executor;
pub mod ports;
pub mod relay;
pub mod router;
pub mod sandbox;
pub mod sandbox_api;
pub mod session;
pub mod telemetry;
