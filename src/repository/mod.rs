//! 帖子聚合的存储层
//!
//! 三个后端实现同一个 [`PostRepository`] 契约，对外行为一致：
//! - [`MemoryPostRepository`]：进程内存储，帖子是带锁的共享对象
//! - [`DocumentPostRepository`]：SurrealDB 文档库，帖子与评论分表，经连接池访问
//! - [`RelationalPostRepository`]：PostgreSQL，评论与投票各自成表

pub mod document;
pub mod memory;
pub mod pool;
pub mod relational;

pub use document::DocumentPostRepository;
pub use memory::MemoryPostRepository;
pub use pool::{ConnectionPool, ManageConnection, PooledConnection};
pub use relational::RelationalPostRepository;

use crate::{
    config::{Config, StorageBackend},
    error::Result,
    models::{Author, NewPost, Post, Vote},
    utils::validation::is_uuid,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// 帖子聚合的存储契约
///
/// 列表查询不排序，排序由 `RankingService` 负责。写操作之后调用方
/// 必须重新读取帖子才能看到最新状态。
#[async_trait]
pub trait PostRepository: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// ID 格式是否合法，用于区分“格式错误”和“不存在”
    fn is_valid_id(&self, id: &str) -> bool {
        is_uuid(id)
    }

    /// 后端连通性检查
    async fn verify_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Post>>;

    /// 不存在或 ID 格式错误时返回 `NotFound`
    async fn get_by_id(&self, id: &str) -> Result<Post>;

    async fn get_by_category(&self, category: &str) -> Result<Vec<Post>>;

    async fn get_by_user(&self, username: &str) -> Result<Vec<Post>>;

    /// 分配 ID 并持久化一个空帖子，返回新 ID
    async fn add(&self, post: NewPost) -> Result<String>;

    /// 连同评论一起删除
    async fn delete(&self, id: &str) -> Result<()>;

    async fn add_view(&self, post: &Post) -> Result<()>;

    /// 返回新评论的 ID
    async fn add_comment(&self, post: &Post, body: &str, author: &Author) -> Result<String>;

    async fn delete_comment(&self, post: &Post, comment_id: &str) -> Result<()>;

    /// 同一用户重复投票时覆盖原方向
    async fn vote(&self, post: &Post, vote: Vote) -> Result<()>;

    /// 用户没投过票时什么都不做
    async fn unvote(&self, post: &Post, author_id: &str) -> Result<()>;

    /// 按当前投票集合重算 score 和好评率
    async fn update_score(&self, post: &Post) -> Result<()>;
}

/// 按配置创建存储后端
pub async fn connect(config: &Config) -> Result<Arc<dyn PostRepository>> {
    info!("Initializing {} post storage", config.storage_backend);

    let repository: Arc<dyn PostRepository> = match config.storage_backend {
        StorageBackend::Memory => Arc::new(MemoryPostRepository::new()),
        StorageBackend::Document => Arc::new(DocumentPostRepository::connect(config).await?),
        StorageBackend::Relational => Arc::new(RelationalPostRepository::connect(config).await?),
    };

    repository.verify_connection().await?;
    Ok(repository)
}
