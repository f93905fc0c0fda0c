// # Datastore Implementations
//
// In-process implementation of the Datastore trait. Network-backed
// implementations live in their own crates (see `coe-datastore-restconf`).

pub mod memory;

pub use memory::{CommitRecord, InjectedFailure, MemoryDatastore, MemoryDatastoreFactory};
