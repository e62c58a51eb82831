pub mod comment_cache;
pub mod executor;
pub mod export;
pub mod llm;
pub mod memory;
pub mod progress;
pub mod schema_context;
pub mod templates;
pub mod validator;
