pub mod ignore_rules;
pub mod interfaces;
pub mod run;
pub mod types;

pub use ignore_rules::{IGNORE_FILE, IgnoreIndex};
pub use interfaces::{
  CardDefinition, CardRenderer, DirEntry, EntryKind, Format, LoaderError, ModuleLoader, ModuleNamespace, Reader,
  RenderError, RenderRequest, TextFile, TranspiledModule, Visitor,
};
pub use run::{CurrentRun, Operation, RunError, RunOptions};
pub use types::{CardType, TypeWalker, TypesResult};
