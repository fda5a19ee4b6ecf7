//! Client chat core: the in-memory store, merge strategies, the patch
//! pipeline and the actor that drives them.

pub mod engine;
pub mod merge;
pub mod patch;
pub mod store;

pub use engine::{spawn_core, CoreError, CoreHandle};
pub use patch::ChatPatch;
