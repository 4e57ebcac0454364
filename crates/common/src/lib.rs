mod hash;
mod update;

pub use hash::{combine, Hasher};
pub use update::{AccountUpdate, Update};

// Re-export alloy primitives used throughout the project
pub use alloy_primitives::{Address, Bytes, B256, U128};
