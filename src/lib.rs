//! channeld - Channel control service for distributed workflow execution
//!
//! Coordinates data exchange between the slots of a running workflow
//! graph: producers register the data they can serve, consumers are told
//! where to pull from, and an unrecoverable data path kills the whole
//! execution.
//!
//! # Modules
//!
//! - [`model`] - Channels, peers, priorities, pending transfers
//! - [`error`] - Error taxonomy with stable API codes
//! - [`storage`] - Persistence seam (PostgreSQL + in-memory)
//! - [`binding`] - Public operations: get_or_create, bind, unbind, reports
//! - [`coordinator`] - Queued delivery of transfer instructions
//! - [`abort`] - Channel drop + workflow abort escalation
//! - [`workflow`] - Workflow control-plane client (access checks, aborts)
//! - [`slots`] - Slot endpoint client (start_transfer)
//! - [`gateway`] - HTTP surface

pub mod abort;
pub mod binding;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod slots;
pub mod storage;
pub mod workflow;

// Convenient re-exports at crate root
pub use binding::{BindingService, GetOrCreateRequest};
pub use error::ChannelError;
pub use model::{Channel, ChannelStatus, Peer, PeerDescription, PendingTransfer, Priority, Role};
pub use storage::ChannelStorage;
