//! Storage module
//!
//! Byte storage backends, piece availability tracking and the strategies
//! that build a piece storage for a task.

pub mod backend;
pub mod factory;
pub mod file;
pub mod piece;

pub use backend::{ByteStorage, MemoryByteStorage};
pub use factory::{
    select_factory, CompletePieceStorageFactory, EmptyPieceStorageFactory, PieceStorageFactory,
    VerifyingPieceStorageFactory,
};
pub use file::FileByteStorage;
pub use piece::PieceStorage;
