pub mod common;
pub mod conflicts;
pub mod list;
pub mod queue;
pub mod status;
pub mod sync;
