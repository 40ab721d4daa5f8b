//! Application layer: remote store contract, resources and the client that wires them.

pub mod catalog;
pub mod context;
pub mod error;
pub mod hooks;
pub mod pagination;
pub mod remote;
pub mod resource;
