pub mod lifecycle;
pub mod loader;
pub mod reader;
pub mod render;
pub mod worker;

pub use db::default_data_dir;
pub use lifecycle::{Daemon, DaemonConfig, LifecycleError};
pub use loader::ScanLoader;
pub use reader::LocalReader;
pub use render::HtmlRenderer;
pub use worker::{FROM_SCRATCH_CATEGORY, FromScratchArgs, INCREMENTAL_CATEGORY, IncrementalArgs, Worker};
