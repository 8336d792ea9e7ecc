pub mod code_ref;
pub mod config;
pub mod entry;
pub mod error;
pub mod paths;
pub mod report;
pub mod resource;

pub use code_ref::{
  CodeRef, EXECUTABLE_EXTENSIONS, has_executable_extension, resolve_module, trim_executable_extension,
};
pub use config::{QueueConfig, RealmConfig};
pub use entry::{CssEntry, ErrorEntry, IndexEntry, IndexResults, InstanceEntry, ModuleEntry, Stats};
pub use error::{Error, ErrorDetail, Result, serializable_error};
pub use paths::{LocalPath, RealmPaths};
pub use report::{ErrorReporter, LogReporter};
pub use resource::{CardResource, Meta, parse_card_document};
