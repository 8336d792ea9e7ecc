pub mod adapter;
pub mod index_writer;
pub mod query;
pub mod queue;
pub mod schema;
pub mod work_loop;

pub use adapter::{DbAdapter, DbError, DbTransaction, Result, Row, SqliteAdapter, default_data_dir};
pub use index_writer::{Batch, IndexWriter};
pub use query::IndexQueryEngine;
pub use queue::{HandlerResult, Job, JobError, JobHandler, JobQueue, JobStatus, PublishOptions};
pub use schema::ensure_schema;
pub use work_loop::WorkLoop;
