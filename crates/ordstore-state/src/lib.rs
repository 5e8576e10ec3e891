//! OrdStore state facade
//!
//! A store handle and snapshot sessions over one `ordstore_core::Engine`,
//! shaped for higher-level state code.
//!
//! # Architecture
//!
//! - [`Store`] writes straight to the engine and reads the latest state
//! - [`StoreSnapshot`] reads a pinned view and buffers writes until commit
//! - [`ReadOnlyStore`] / [`WriteStore`] cover both, so callers can be
//!   written once against either
//!
//! Seeks and range reads are lazy: nothing is read until the returned
//! sequence is first advanced.

pub mod session;
pub mod store;
pub mod traits;

pub use session::StoreSnapshot;
pub use store::Store;
pub use traits::{ReadOnlyStore, WriteStore};

pub use ordstore_core::{
    BytewiseComparator, FnComparator, KeyComparator, Options, SeekDirection, StoreError,
    StoreResult, SyncMode,
};
