pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::StagerConfig;
pub use crate::error::{Result, StagerError};
pub use crate::models::{FallbackStrategy, FileRecord, FileStatus, StagingSummary};
pub use crate::services::file_stager::FileStagerService;
pub use crate::services::stager::Stager;
