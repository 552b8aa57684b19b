//! Lock-guarded shared-file storage.
//!
//! Two OS processes share the queue, token, and config files. Every access
//! goes through an advisory lock on a sibling `<path>.lock` file; writes
//! additionally go through temp-file + atomic-rename so a crash leaves
//! either the old or the new snapshot, never a partial one.

pub mod archive;
pub mod error;
pub mod files;
pub mod lock;
pub mod notifier;
pub mod queue;
pub mod token;

pub use archive::ErrorArchive;
pub use error::StoreError;
pub use files::{read_json_with_lock, read_yaml_with_lock, write_json_with_lock};
pub use lock::FileLock;
pub use notifier::QueueNotifier;
pub use queue::{StatusPatch, TaskQueueStore};
pub use token::{TokenFile, TokenRecord};
