//! Process-group plumbing: the communicator façade and collective helpers.

pub mod agreement;
pub mod communicator;

pub use agreement::{agree, all_gather_u64, broadcast_flag};
