//! The networking modules handle all communication between clients and the node:
//! the pooled byte-buffer layer, the binary wire codec, the ref-counted file-handle
//! registry, and the mio-based connection reactor that ties them together.

pub mod chunk;
pub mod chunkpool;
pub mod buffer;
pub mod wire;
pub mod handle;
pub mod reactor;
