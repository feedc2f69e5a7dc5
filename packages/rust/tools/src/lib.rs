//! Extraction tools: adapters, capability table, and tool assignment.
//!
//! Tools are registered from configuration at startup. The engine only ever
//! talks to them through the [`ToolAdapter`] trait.

pub mod adapters;
pub mod assignment;
pub mod capability;

pub use adapters::{
    ProcessAdapter, ScriptedAdapter, ScriptedResponse, ToolAdapter, ToolRegistry,
};
pub use assignment::{Assignment, ToolAssignmentEngine};
pub use capability::{CapabilityRegistry, ToolCapability};
