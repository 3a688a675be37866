use crate::{
    config::{Config, StorageBackend},
    error::{AppError, Result},
    models::{Author, Comment, NewPost, Post, PostKind, Vote, VoteLedger},
    services::database::{Database, DatabaseManager, DatabaseSettings},
    utils::validation::is_simple_uuid,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use surrealdb::sql::Thing;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionPool, PostRepository};

/// 读取管道的过滤阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFilter {
    All,
    Id(String),
    Category(String),
    Author(String),
}

/// 帖子读取管道：过滤 → 排序（下推到存储）→ 展开评论引用
#[derive(Debug, Clone)]
pub struct PostPipeline {
    filter: PostFilter,
    sorted: bool,
}

impl PostPipeline {
    pub fn new(filter: PostFilter) -> Self {
        Self {
            filter,
            sorted: false,
        }
    }

    /// 按 score、views 降序
    pub fn ranked(mut self) -> Self {
        self.sorted = true;
        self
    }

    pub fn to_surql(&self, timeout: Duration) -> String {
        let mut sql = String::from("SELECT * FROM post");

        match self.filter {
            PostFilter::All => {}
            PostFilter::Id(_) => sql.push_str(" WHERE id = type::thing('post', $id)"),
            PostFilter::Category(_) => sql.push_str(" WHERE category = $category"),
            PostFilter::Author(_) => sql.push_str(" WHERE author.username = $username"),
        }

        if self.sorted {
            sql.push_str(" ORDER BY score DESC, views DESC");
        }

        sql.push_str(" FETCH comments");
        sql.push_str(&format!(" TIMEOUT {}ms", timeout.as_millis().max(1)));
        sql
    }

    pub fn params(&self) -> Value {
        match &self.filter {
            PostFilter::All => json!({}),
            PostFilter::Id(id) => json!({ "id": id }),
            PostFilter::Category(category) => json!({ "category": category }),
            PostFilter::Author(username) => json!({ "username": username }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentDocument {
    id: Thing,
    body: String,
    created: DateTime<Utc>,
    author: Author,
}

impl From<CommentDocument> for Comment {
    fn from(doc: CommentDocument) -> Self {
        Self {
            id: doc.id.id.to_raw(),
            body: doc.body,
            created: doc.created,
            author: doc.author,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostDocument {
    id: Thing,
    #[serde(rename = "type")]
    kind: PostKind,
    category: String,
    title: String,
    text: String,
    url: Option<String>,
    author: Author,
    created: DateTime<Utc>,
    views: i64,
    score: i64,
    upvote_percentage: u8,
    #[serde(default)]
    comments: Vec<CommentDocument>,
    #[serde(default)]
    votes: Vec<Vote>,
}

impl From<PostDocument> for Post {
    fn from(doc: PostDocument) -> Self {
        Self {
            id: doc.id.id.to_raw(),
            kind: doc.kind,
            category: doc.category,
            title: doc.title,
            text: doc.text,
            url: doc.url,
            author: doc.author,
            created: doc.created,
            views: doc.views,
            score: doc.score,
            upvote_percentage: doc.upvote_percentage,
            comments: doc.comments.into_iter().map(Comment::from).collect(),
            votes: doc.votes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordRef {
    #[allow(dead_code)]
    id: Thing,
}

#[derive(Debug, Deserialize)]
struct CommentRefs {
    #[serde(default)]
    comments: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    votes: Vec<Vote>,
    version: i64,
}

/// 投票写回的结果
enum LedgerWrite {
    Written,
    Unchanged,
}

const SELECT_LEDGER: &str =
    "SELECT votes, version FROM post WHERE id = type::thing('post', $id)";

const WRITE_LEDGER: &str = r#"
    UPDATE post SET votes = $votes, version += 1
    WHERE id = type::thing('post', $id) AND version = $version
    RETURN id
"#;

const WRITE_SCORE: &str = r#"
    UPDATE post SET score = $score, upvote_percentage = $percentage
    WHERE id = type::thing('post', $id) AND version = $version
    RETURN id
"#;

/// 帖子和它的评论在同一个事务里删除，没有评论时跳过第二步。
/// 最后一条语句返回被删除的帖子。
const DELETE_CASCADE: &str = r#"
    BEGIN TRANSACTION;
    LET $gone = (DELETE post WHERE id = type::thing('post', $id) RETURN BEFORE);
    IF $gone[0].comments {
        DELETE comment WHERE id INSIDE $gone[0].comments;
    };
    RETURN $gone;
    COMMIT TRANSACTION;
"#;

/// SurrealDB 文档库后端
///
/// 帖子和评论分别存放在 `post` 和 `comment` 表中，帖子的 `comments` 字段只保存
/// 评论的记录链接，读取时由 `FETCH` 展开。每个操作从连接池借出一个连接，并受
/// 操作超时约束。
///
/// 投票的新集合在 Rust 侧计算，无法放进单条查询的事务，采用乐观并发：读取投票集合和 `version`，在内存中
/// 用 [`VoteLedger`] 计算新集合，写回时要求 `version` 未变，否则重读重试。
pub struct DocumentPostRepository {
    pool: ConnectionPool<DatabaseManager>,
    op_timeout: Duration,
    vote_retry_limit: usize,
}

impl DocumentPostRepository {
    pub fn new(pool: ConnectionPool<DatabaseManager>, op_timeout: Duration, vote_retry_limit: usize) -> Self {
        Self {
            pool,
            op_timeout,
            vote_retry_limit,
        }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        let manager = DatabaseManager::new(DatabaseSettings::from_config(config)).await?;
        let pool = ConnectionPool::new(manager, config.database_pool_size, config.acquire_timeout()).await?;

        info!(
            "Document store ready at {} ({}/{})",
            config.database_url, config.database_namespace, config.database_name
        );

        Ok(Self::new(pool, config.operation_timeout(), config.vote_retry_limit))
    }

    pub fn pool(&self) -> &ConnectionPool<DatabaseManager> {
        &self.pool
    }

    /// 借出连接执行一次操作
    ///
    /// 连接总会回到池中。存储层故障后先检查连接是否可用，不可用的连接会被替换。
    async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.pool.acquire_timeout().await?;

        let outcome = match tokio::time::timeout(self.op_timeout, f((*conn).clone())).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Document store operation '{}' timed out after {:?}", operation, self.op_timeout);
                Err(AppError::Timeout(self.op_timeout))
            }
        };

        match &outcome {
            Err(e) if e.is_backend_failure() => {
                debug!("Operation '{}' failed, checking connection: {}", operation, e);
                self.pool.release(conn).await;
            }
            _ => drop(conn),
        }

        outcome
    }

    async fn fetch(&self, pipeline: PostPipeline) -> Result<Vec<Post>> {
        let sql = pipeline.to_surql(self.op_timeout);
        let params = pipeline.params();

        self.run("fetch posts", |db| async move {
            let mut response = db.query_with_params(&sql, params).await?;
            let docs: Vec<PostDocument> = response.take(0)?;
            Ok(docs.into_iter().map(Post::from).collect())
        })
        .await
    }

    /// 乐观并发地改写投票集合
    async fn rewrite_ledger<F>(&self, post_id: &str, apply: F) -> Result<()>
    where
        F: Fn(&mut VoteLedger) -> bool + Send,
    {
        if !is_simple_uuid(post_id) {
            return Err(AppError::not_found("post"));
        }

        let limit = self.vote_retry_limit;
        let id = post_id.to_string();

        self.run("rewrite votes", |db| async move {
            for attempt in 0..=limit {
                let mut response = db.query_with_params(SELECT_LEDGER, json!({ "id": id })).await?;
                let current: Vec<LedgerDocument> = response.take(0)?;
                let current = current
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::not_found("post"))?;

                let mut ledger = VoteLedger::from(current.votes);
                if !apply(&mut ledger) {
                    return Ok(LedgerWrite::Unchanged);
                }

                let mut response = db
                    .query_with_params(
                        WRITE_LEDGER,
                        json!({
                            "id": id,
                            "votes": ledger.as_slice(),
                            "version": current.version,
                        }),
                    )
                    .await?;
                let written: Vec<RecordRef> = response.take(0)?;
                if !written.is_empty() {
                    return Ok(LedgerWrite::Written);
                }

                warn!("Vote write conflict on post {} (attempt {})", id, attempt + 1);
            }

            Err(AppError::Conflict(format!(
                "votes on post {} changed concurrently {} times",
                id,
                limit + 1
            )))
        })
        .await
        .map(|write| {
            if let LedgerWrite::Unchanged = write {
                debug!("Vote ledger of post {} unchanged", post_id);
            }
        })
    }

    async fn post_exists(&self, post_id: &str) -> Result<bool> {
        let id = post_id.to_string();
        self.run("check post", |db| async move {
            let mut response = db
                .query_with_params(
                    "SELECT id FROM post WHERE id = type::thing('post', $id)",
                    json!({ "id": id }),
                )
                .await?;
            let found: Vec<RecordRef> = response.take(0)?;
            Ok(!found.is_empty())
        })
        .await
    }
}

#[async_trait]
impl PostRepository for DocumentPostRepository {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Document
    }

    fn is_valid_id(&self, id: &str) -> bool {
        is_simple_uuid(id)
    }

    async fn verify_connection(&self) -> Result<()> {
        self.run("verify connection", |db| async move { db.verify_connection().await })
            .await
    }

    async fn get_all(&self) -> Result<Vec<Post>> {
        self.fetch(PostPipeline::new(PostFilter::All).ranked()).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Post> {
        debug!("Getting post by ID: {}", id);
        if !is_simple_uuid(id) {
            return Err(AppError::not_found("post"));
        }

        self.fetch(PostPipeline::new(PostFilter::Id(id.to_string())))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found("post"))
    }

    async fn get_by_category(&self, category: &str) -> Result<Vec<Post>> {
        debug!("Getting posts in category: {}", category);
        self.fetch(PostPipeline::new(PostFilter::Category(category.to_string())).ranked())
            .await
    }

    async fn get_by_user(&self, username: &str) -> Result<Vec<Post>> {
        debug!("Getting posts by user: {}", username);
        self.fetch(PostPipeline::new(PostFilter::Author(username.to_string())).ranked())
            .await
    }

    async fn add(&self, post: NewPost) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        let params = json!({
            "id": id,
            "content": {
                "type": post.kind,
                "category": post.category,
                "title": post.title,
                "text": post.text,
                "url": post.url,
                "author": post.author,
                "created": post.created,
                "views": 0,
                "score": 0,
                "upvote_percentage": 0,
                "comments": [],
                "votes": [],
                "version": 0,
            },
        });

        self.run("create post", |db| async move {
            db.query_with_params("CREATE type::thing('post', $id) CONTENT $content RETURN NONE", params)
                .await?;
            Ok(())
        })
        .await?;

        info!("Created post: {}", id);
        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if !is_simple_uuid(id) {
            return Err(AppError::not_found("post"));
        }

        let post_id = id.to_string();
        let removed_comments = self
            .run("delete post", |db| async move {
                let mut response = db.query_with_params(DELETE_CASCADE, json!({ "id": post_id })).await?;
                let last = response.num_statements().saturating_sub(1);
                let deleted: Vec<CommentRefs> = response.take(last)?;
                let deleted = deleted
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::not_found("post"))?;

                Ok(deleted.comments.len())
            })
            .await?;

        info!("Deleted post {} with {} comments", id, removed_comments);
        Ok(())
    }

    async fn add_view(&self, post: &Post) -> Result<()> {
        let id = post.id.clone();
        self.run("add view", |db| async move {
            let mut response = db
                .query_with_params(
                    "UPDATE post SET views += 1 WHERE id = type::thing('post', $id) RETURN id",
                    json!({ "id": id }),
                )
                .await?;
            let updated: Vec<RecordRef> = response.take(0)?;
            if updated.is_empty() {
                return Err(AppError::not_found("post"));
            }
            Ok(())
        })
        .await
    }

    async fn add_comment(&self, post: &Post, body: &str, author: &Author) -> Result<String> {
        let comment = Comment::new(Uuid::new_v4().simple().to_string(), body, author.clone());
        let comment_id = comment.id.clone();

        let params = json!({
            "id": post.id,
            "cid": comment.id,
            "content": {
                "body": comment.body,
                "created": comment.created,
                "author": comment.author,
            },
        });

        self.run("add comment", |db| async move {
            let mut response = db
                .query_with_params(
                    r#"
                    CREATE type::thing('comment', $cid) CONTENT $content RETURN NONE;
                    UPDATE post SET comments += type::thing('comment', $cid)
                        WHERE id = type::thing('post', $id)
                        RETURN id;
                    "#,
                    params.clone(),
                )
                .await?;
            let linked: Vec<RecordRef> = response.take(1)?;

            if linked.is_empty() {
                // 帖子已被删除，清理刚建好的评论
                db.query_with_params("DELETE type::thing('comment', $cid)", params).await?;
                return Err(AppError::not_found("post"));
            }
            Ok(())
        })
        .await?;

        debug!("Added comment {} to post {}", comment_id, post.id);
        Ok(comment_id)
    }

    async fn delete_comment(&self, post: &Post, comment_id: &str) -> Result<()> {
        if !is_simple_uuid(comment_id) {
            return Err(AppError::comment_not_found(comment_id));
        }

        let params = json!({ "id": post.id, "cid": comment_id });
        let unlinked = self
            .run("delete comment", |db| async move {
                let mut response = db
                    .query_with_params(
                        r#"
                        UPDATE post SET comments -= type::thing('comment', $cid)
                            WHERE id = type::thing('post', $id)
                            AND comments CONTAINS type::thing('comment', $cid)
                            RETURN id
                        "#,
                        params.clone(),
                    )
                    .await?;
                let unlinked: Vec<RecordRef> = response.take(0)?;

                if !unlinked.is_empty() {
                    db.query_with_params("DELETE type::thing('comment', $cid)", params).await?;
                }
                Ok(!unlinked.is_empty())
            })
            .await?;

        if !unlinked {
            if self.post_exists(&post.id).await? {
                return Err(AppError::comment_not_found(comment_id));
            }
            return Err(AppError::not_found("post"));
        }

        debug!("Deleted comment {} from post {}", comment_id, post.id);
        Ok(())
    }

    async fn vote(&self, post: &Post, vote: Vote) -> Result<()> {
        debug!("User {} voting {:?} on post {}", vote.author_id, vote.direction, post.id);
        self.rewrite_ledger(&post.id, move |ledger| ledger.cast(vote.clone()))
            .await
    }

    async fn unvote(&self, post: &Post, author_id: &str) -> Result<()> {
        self.rewrite_ledger(&post.id, |ledger| ledger.retract(author_id).is_some())
            .await
    }

    async fn update_score(&self, post: &Post) -> Result<()> {
        if !is_simple_uuid(&post.id) {
            return Err(AppError::not_found("post"));
        }

        let limit = self.vote_retry_limit;
        let id = post.id.clone();

        let score = self
            .run("update score", |db| async move {
                for attempt in 0..=limit {
                    let mut response = db.query_with_params(SELECT_LEDGER, json!({ "id": id })).await?;
                    let current: Vec<LedgerDocument> = response.take(0)?;
                    let current = current
                        .into_iter()
                        .next()
                        .ok_or_else(|| AppError::not_found("post"))?;

                    let tally = VoteLedger::from(current.votes).tally();
                    let mut response = db
                        .query_with_params(
                            WRITE_SCORE,
                            json!({
                                "id": id,
                                "score": tally.score,
                                "percentage": tally.upvote_percentage,
                                "version": current.version,
                            }),
                        )
                        .await?;
                    let written: Vec<RecordRef> = response.take(0)?;
                    if !written.is_empty() {
                        return Ok(tally.score);
                    }

                    warn!("Score write conflict on post {} (attempt {})", id, attempt + 1);
                }

                Err(AppError::Conflict(format!("votes on post {} kept changing", id)))
            })
            .await?;

        debug!("Post {} score is now {}", post.id, score);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repository() -> DocumentPostRepository {
        DocumentPostRepository::connect(&Config::default()).await.unwrap()
    }

    fn new_post(category: &str, username: &str) -> NewPost {
        NewPost::new(
            PostKind::Text,
            category,
            "title",
            "text",
            None,
            Author::new(format!("id-{}", username), username),
        )
    }

    #[test]
    fn test_pipeline_by_category_is_ranked_and_hydrated() {
        let pipeline = PostPipeline::new(PostFilter::Category("music".into())).ranked();
        assert_eq!(
            pipeline.to_surql(Duration::from_secs(2)),
            "SELECT * FROM post WHERE category = $category ORDER BY score DESC, views DESC FETCH comments TIMEOUT 2000ms"
        );
        assert_eq!(pipeline.params(), json!({ "category": "music" }));
    }

    #[test]
    fn test_pipeline_by_id_without_sort() {
        let pipeline = PostPipeline::new(PostFilter::Id("abc".into()));
        assert_eq!(
            pipeline.to_surql(Duration::from_millis(250)),
            "SELECT * FROM post WHERE id = type::thing('post', $id) FETCH comments TIMEOUT 250ms"
        );
    }

    #[test]
    fn test_pipeline_all_ranked() {
        let pipeline = PostPipeline::new(PostFilter::All).ranked();
        assert_eq!(
            pipeline.to_surql(Duration::from_secs(1)),
            "SELECT * FROM post ORDER BY score DESC, views DESC FETCH comments TIMEOUT 1000ms"
        );
        assert_eq!(pipeline.params(), json!({}));
    }

    #[tokio::test]
    async fn test_comments_stored_by_reference() {
        let repo = repository().await;
        let id = repo.add(new_post("music", "alice")).await.unwrap();
        let post = repo.get_by_id(&id).await.unwrap();

        let author = Author::new("id-bob", "bob");
        let first = repo.add_comment(&post, "first", &author).await.unwrap();
        let second = repo.add_comment(&post, "second", &author).await.unwrap();

        // 帖子文档里只有链接
        let refs = repo
            .run("read refs", |db| async move {
                let mut response = db
                    .query_with_params(
                        "SELECT comments FROM post WHERE id = type::thing('post', $id)",
                        json!({ "id": id }),
                    )
                    .await?;
                let refs: Vec<CommentRefs> = response.take(0)?;
                Ok(refs)
            })
            .await
            .unwrap();
        let keys: Vec<String> = refs[0].comments.iter().map(|t| t.id.to_raw()).collect();
        assert_eq!(keys, vec![first.clone(), second.clone()]);

        let hydrated = repo.get_by_id(&post.id).await.unwrap();
        let bodies: Vec<&str> = hydrated.comments.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(hydrated.comments[0].id, first);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_comments() {
        let repo = repository().await;
        let id = repo.add(new_post("music", "alice")).await.unwrap();
        let post = repo.get_by_id(&id).await.unwrap();
        repo.add_comment(&post, "bye", &Author::new("id-bob", "bob")).await.unwrap();

        repo.delete(&id).await.unwrap();

        let remaining = repo
            .run("count comments", |db| async move {
                let mut response = db.query_with_params("SELECT id FROM comment", json!({})).await?;
                let rows: Vec<RecordRef> = response.take(0)?;
                Ok(rows.len())
            })
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(matches!(repo.get_by_id(&id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_cascade_keeps_post_and_comments() {
        let repo = repository().await;
        let id = repo.add(new_post("music", "alice")).await.unwrap();
        let post = repo.get_by_id(&id).await.unwrap();
        repo.add_comment(&post, "stays", &Author::new("id-bob", "bob")).await.unwrap();

        // 让删除评论这一步失败
        repo.run("block comment deletes", |db| async move {
            db.query(r#"DEFINE EVENT block_delete ON TABLE comment WHEN $event = "DELETE" THEN { THROW "comment delete blocked" }"#)
                .await
        })
        .await
        .unwrap();

        let err = repo.delete(&id).await.unwrap_err();
        assert!(err.is_backend_failure());

        // 事务整体回滚
        let post = repo.get_by_id(&id).await.unwrap();
        assert_eq!(post.comments.len(), 1);
        assert_eq!(post.comments[0].body, "stays");
        assert_eq!(repo.pool().idle(), repo.pool().size());
    }

    #[tokio::test]
    async fn test_delete_without_comments() {
        let repo = repository().await;
        let id = repo.add(new_post("music", "alice")).await.unwrap();
        repo.delete(&id).await.unwrap();

        assert!(matches!(repo.delete(&id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_id_is_not_found() {
        let repo = repository().await;
        assert!(!repo.is_valid_id("not-an-id"));
        assert!(matches!(repo.get_by_id("not-an-id").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_handles_returned_after_errors() {
        let repo = repository().await;
        let size = repo.pool().size();

        for _ in 0..size * 2 {
            let missing = Uuid::new_v4().simple().to_string();
            assert!(repo.get_by_id(&missing).await.is_err());
        }
        assert_eq!(repo.pool().idle(), size);
    }

    #[tokio::test]
    async fn test_version_bumps_only_on_ledger_change() {
        let repo = repository().await;
        let id = repo.add(new_post("music", "alice")).await.unwrap();
        let post = repo.get_by_id(&id).await.unwrap();

        repo.vote(&post, Vote::up("u1")).await.unwrap();
        repo.vote(&post, Vote::up("u1")).await.unwrap();
        repo.unvote(&post, "u2").await.unwrap();

        let version = repo
            .run("read version", |db| async move {
                let mut response = db.query_with_params(SELECT_LEDGER, json!({ "id": id })).await?;
                let ledger: Vec<LedgerDocument> = response.take(0)?;
                Ok(ledger[0].version)
            })
            .await
            .unwrap();
        assert_eq!(version, 1);
    }
}
