pub mod checkpoint;

pub use checkpoint::{CheckpointStore, CursorKind, Cursors};
