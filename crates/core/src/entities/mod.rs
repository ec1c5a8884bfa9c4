//! Cached entities, the local store contract and the public data manager.

mod data_manager;
mod entities_model;
mod entities_traits;
mod payloads;

pub use data_manager::*;
pub use entities_model::*;
pub use entities_traits::*;
pub use payloads::*;
