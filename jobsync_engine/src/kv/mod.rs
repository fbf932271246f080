mod memory;

pub use memory::{MemoryKv, MemoryKvHub};
