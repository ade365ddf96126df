//! Store contract, key encoding, CRUD helpers, and unique-key allocation.

pub mod allocator;
pub mod contract;
pub mod crud;
pub mod keys;

pub use contract::{BackendCapabilities, StoreContract};
