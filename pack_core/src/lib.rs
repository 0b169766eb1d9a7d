#![forbid(unsafe_code)]

pub mod closure;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod project;
pub mod shader_table;
pub mod source;
pub mod writer;

pub use config::PackOptions;
pub use error::{ErrorCategory, PackError};
pub use jobs::CancelToken;
pub use pipeline::{run, PackReport};
