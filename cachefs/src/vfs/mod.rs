//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Expose the path-oriented client API and dispatch each call by the
//!   path's mode (PRIMARY / PROXY / DUAL).
//! - Own the cluster session, its handle table and lazy reconnection; every
//!   handle opened under a lost session fails from then on.
//! - Provide buffered, block-aligned write handles with a per-file exclusive
//!   lock, and seekable read handles.
//!
//! Submodules:
//! - `fs`: the `FileSystem` facade
//! - `handle`: `FileWriter` / `FileReader`
//! - `session`: session state and handle table
//! - `reconnect`: session (re)establishment
//! - `mode`: per-path mode resolution
//! - `demo`: end-to-end walkthrough used by the binary

pub mod demo;
pub mod fs;
pub mod handle;
pub mod mode;
pub mod reconnect;
pub mod session;

pub use fs::{CreateOptions, FileSystem};
pub use handle::{FileReader, FileWriter};
pub use mode::FsMode;
pub use reconnect::LinkState;
pub use session::{HandleEntry, HandleKind};
