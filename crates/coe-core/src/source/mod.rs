// # Event Source Implementations
//
// In-process implementation of the EventSource trait. The Kubernetes
// polling source lives in `coe-source-kube`.

pub mod memory;

pub use memory::{MemoryEventSource, MemoryEventSourceFactory};
