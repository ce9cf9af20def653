//! Conversation memory
//!
//! Holds the per-session transcript type persisted by the checkpoint store.

pub mod store;

pub use store::Transcript;
