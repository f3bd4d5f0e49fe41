// Library crate for cachefs: a filesystem whose metadata and file blocks live in a
// distributed key-value cache. Modules are public for the binary and integration tests.

pub mod block;
pub mod cadapter;
pub mod config;
pub mod error;
pub mod meta;
pub mod secondary;
pub mod vfs;

pub use config::{FsConfig, PathModeRule};
pub use error::{FsError, FsResult};
pub use meta::{FileKind, FileStatus, FsPath, Permission};
pub use vfs::{CreateOptions, FileReader, FileSystem, FileWriter, FsMode, LinkState};
