//! Shared domain types for the gavel pipeline.
//!
//! Everything in this crate is pure: no file or process I/O. The `gavel`
//! crate owns persistence, locking and orchestration on top of these types.

pub mod machine;
pub mod record;
pub mod state;

pub use machine::{InvalidTransition, StateMachine};
pub use record::{ItemRecord, Metadata, ReservedKey, StatePatch, Transition};
pub use state::{ItemState, Stage, UnknownState};
