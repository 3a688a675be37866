//! 论坛帖子聚合（帖子、评论、投票）的存储与业务核心

pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
pub mod state;
pub mod utils;

pub use config::{Config, StorageBackend};
pub use error::{AppError, Result};
pub use repository::PostRepository;
pub use services::PostService;
pub use state::AppState;
