// Library entrypoint for integration tests and internal reuse.
mod api;
mod core;
mod ops;
pub mod orchestrator;
mod services;
pub mod storage;
pub mod warehouse;

pub use api::build_router;
pub use core::{auth, config, schemas, shutdown, state};
pub use ops::monitor;
pub use services::{
    comment_cache, executor, export, llm, memory, progress, schema_context, templates, validator,
};
