//! Storage module
//!
//! Content-addressed block logging and hash-verified piece assembly.

pub mod block;
pub mod store;

pub use block::{Block, BlockPointer};
pub use store::PieceStore;
