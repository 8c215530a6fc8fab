//! Remote agent integration: REST client, payload types, tunnel URL codec

mod client;
mod types;
pub mod url;

pub use client::{AgentApi, EndpointRef};
pub use types::{AgentInfo, ControlAction, Instance, TcpingResult};
