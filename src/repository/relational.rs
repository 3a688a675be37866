use crate::{
    config::{Config, StorageBackend},
    error::{AppError, Result},
    models::{Author, Comment, NewPost, Post, PostKind, Vote, VoteDirection},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use std::collections::HashMap;
use std::convert::TryFrom;
use tracing::{debug, info};
use uuid::Uuid;

use super::PostRepository;

const FOREIGN_KEY_VIOLATION: &str = "23503";

const POST_COLUMNS: &str = "id, kind, category, title, body, url, author_id, author_username, \
                            created_at, views, score, upvote_percentage";

#[derive(Debug, FromRow)]
struct PostRow {
    id: Uuid,
    kind: String,
    category: String,
    title: String,
    body: String,
    url: Option<String>,
    author_id: String,
    author_username: String,
    created_at: DateTime<Utc>,
    views: i64,
    score: i64,
    upvote_percentage: i32,
}

#[derive(Debug, FromRow)]
struct CommentRow {
    id: Uuid,
    post_id: Uuid,
    body: String,
    author_id: String,
    author_username: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct VoteRow {
    post_id: Uuid,
    author_id: String,
    direction: i16,
}

impl PostRow {
    fn into_post(self, comments: Vec<Comment>, votes: Vec<Vote>) -> Result<Post> {
        let kind = self.kind.parse::<PostKind>().map_err(AppError::Internal)?;

        Ok(Post {
            id: self.id.to_string(),
            kind,
            category: self.category,
            title: self.title,
            text: self.body,
            url: self.url,
            author: Author::new(self.author_id, self.author_username),
            created: self.created_at,
            views: self.views,
            score: self.score,
            upvote_percentage: self.upvote_percentage.clamp(0, 100) as u8,
            comments,
            votes,
        })
    }
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id.to_string(),
            body: row.body,
            created: row.created_at,
            author: Author::new(row.author_id, row.author_username),
        }
    }
}

impl TryFrom<VoteRow> for Vote {
    type Error = AppError;

    fn try_from(row: VoteRow) -> Result<Self> {
        let direction = VoteDirection::try_from(i64::from(row.direction)).map_err(AppError::Internal)?;
        Ok(Vote::new(row.author_id, direction))
    }
}

fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION),
        _ => false,
    }
}

/// PostgreSQL 后端
///
/// 评论和投票各自成表，外键级联到帖子。投票使用 `ON CONFLICT` 原子 upsert，
/// 每个 (post_id, author_id) 只有一行。
#[derive(Clone)]
pub struct RelationalPostRepository {
    pool: PgPool,
}

impl RelationalPostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.postgres_max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.postgres_url)
            .await?;

        let repo = Self::new(pool);
        repo.ensure_schema().await?;

        info!("Relational store ready");
        Ok(repo)
    }

    /// 建表（幂等）
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                url TEXT,
                author_id TEXT NOT NULL,
                author_username TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                views BIGINT NOT NULL DEFAULT 0,
                score BIGINT NOT NULL DEFAULT 0,
                upvote_percentage INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comments (
                id UUID PRIMARY KEY,
                post_id UUID NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                seq BIGSERIAL,
                body TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_username TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS comments_post_id_idx ON comments (post_id, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                post_id UUID NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                author_id TEXT NOT NULL,
                direction SMALLINT NOT NULL CHECK (direction IN (-1, 1)),
                PRIMARY KEY (post_id, author_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 批量补全评论和投票
    async fn hydrate(&self, rows: Vec<PostRow>) -> Result<Vec<Post>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();

        let comment_rows: Vec<CommentRow> = sqlx::query_as(
            "SELECT id, post_id, body, author_id, author_username, created_at \
             FROM comments WHERE post_id = ANY($1) ORDER BY seq",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let vote_rows: Vec<VoteRow> = sqlx::query_as(
            "SELECT post_id, author_id, direction FROM votes WHERE post_id = ANY($1) ORDER BY author_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut comments: HashMap<Uuid, Vec<Comment>> = HashMap::new();
        for row in comment_rows {
            comments.entry(row.post_id).or_default().push(Comment::from(row));
        }

        let mut votes: HashMap<Uuid, Vec<Vote>> = HashMap::new();
        for row in vote_rows {
            let post_id = row.post_id;
            votes.entry(post_id).or_default().push(Vote::try_from(row)?);
        }

        rows.into_iter()
            .map(|row| {
                let id = row.id;
                row.into_post(
                    comments.remove(&id).unwrap_or_default(),
                    votes.remove(&id).unwrap_or_default(),
                )
            })
            .collect()
    }

    async fn select_where(&self, clause: &str, value: &str) -> Result<Vec<Post>> {
        let sql = format!("SELECT {} FROM posts WHERE {} = $1", POST_COLUMNS, clause);
        let rows: Vec<PostRow> = sqlx::query_as(&sql).bind(value).fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn post_exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM posts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl PostRepository for RelationalPostRepository {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Relational
    }

    async fn verify_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Post>> {
        let sql = format!("SELECT {} FROM posts", POST_COLUMNS);
        let rows: Vec<PostRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Post> {
        debug!("Getting post by ID: {}", id);
        let id = parse_id(id).ok_or_else(|| AppError::not_found("post"))?;

        let sql = format!("SELECT {} FROM posts WHERE id = $1", POST_COLUMNS);
        let row: Option<PostRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        let row = row.ok_or_else(|| AppError::not_found("post"))?;

        self.hydrate(vec![row])
            .await?
            .pop()
            .ok_or_else(|| AppError::not_found("post"))
    }

    async fn get_by_category(&self, category: &str) -> Result<Vec<Post>> {
        debug!("Getting posts in category: {}", category);
        self.select_where("category", category).await
    }

    async fn get_by_user(&self, username: &str) -> Result<Vec<Post>> {
        debug!("Getting posts by user: {}", username);
        self.select_where("author_username", username).await
    }

    async fn add(&self, post: NewPost) -> Result<String> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO posts (id, kind, category, title, body, url, author_id, author_username, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(post.kind.as_str())
        .bind(&post.category)
        .bind(&post.title)
        .bind(&post.text)
        .bind(&post.url)
        .bind(&post.author.id)
        .bind(&post.author.username)
        .bind(post.created)
        .execute(&self.pool)
        .await?;

        info!("Created post: {}", id);
        Ok(id.to_string())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let post_id = parse_id(id).ok_or_else(|| AppError::not_found("post"))?;

        let mut tx = self.pool.begin().await?;

        let comments = sqlx::query("DELETE FROM comments WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::not_found("post"));
        }

        tx.commit().await?;

        info!("Deleted post {} with {} comments", id, comments.rows_affected());
        Ok(())
    }

    async fn add_view(&self, post: &Post) -> Result<()> {
        let id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;

        let result = sqlx::query("UPDATE posts SET views = views + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("post"));
        }
        Ok(())
    }

    async fn add_comment(&self, post: &Post, body: &str, author: &Author) -> Result<String> {
        let post_id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;
        let comment_id = Uuid::new_v4();
        let comment = Comment::new(comment_id.to_string(), body, author.clone());

        let inserted = sqlx::query(
            r#"
            INSERT INTO comments (id, post_id, body, author_id, author_username, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(comment_id)
        .bind(post_id)
        .bind(&comment.body)
        .bind(&comment.author.id)
        .bind(&comment.author.username)
        .bind(comment.created)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!("Added comment {} to post {}", comment.id, post.id);
                Ok(comment.id)
            }
            Err(e) if is_foreign_key_violation(&e) => Err(AppError::not_found("post")),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_comment(&self, post: &Post, comment_id: &str) -> Result<()> {
        let post_id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;
        let comment_uuid = parse_id(comment_id).ok_or_else(|| AppError::comment_not_found(comment_id))?;

        let result = sqlx::query("DELETE FROM comments WHERE id = $1 AND post_id = $2")
            .bind(comment_uuid)
            .bind(post_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            if self.post_exists(post_id).await? {
                return Err(AppError::comment_not_found(comment_id));
            }
            return Err(AppError::not_found("post"));
        }

        debug!("Deleted comment {} from post {}", comment_id, post.id);
        Ok(())
    }

    async fn vote(&self, post: &Post, vote: Vote) -> Result<()> {
        let post_id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;
        debug!("User {} voting {:?} on post {}", vote.author_id, vote.direction, post.id);

        let direction = vote.direction.value() as i16;
        let upserted = sqlx::query(
            r#"
            INSERT INTO votes (post_id, author_id, direction)
            VALUES ($1, $2, $3)
            ON CONFLICT (post_id, author_id) DO UPDATE SET direction = EXCLUDED.direction
            "#,
        )
        .bind(post_id)
        .bind(&vote.author_id)
        .bind(direction)
        .execute(&self.pool)
        .await;

        match upserted {
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => Err(AppError::not_found("post")),
            Err(e) => Err(e.into()),
        }
    }

    async fn unvote(&self, post: &Post, author_id: &str) -> Result<()> {
        let post_id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;

        let result = sqlx::query("DELETE FROM votes WHERE post_id = $1 AND author_id = $2")
            .bind(post_id)
            .bind(author_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 && !self.post_exists(post_id).await? {
            return Err(AppError::not_found("post"));
        }
        Ok(())
    }

    async fn update_score(&self, post: &Post) -> Result<()> {
        let post_id = parse_id(&post.id).ok_or_else(|| AppError::not_found("post"))?;

        // 与 VoteLedger::tally 相同的取整规则
        let result = sqlx::query(
            r#"
            UPDATE posts p
            SET score = t.up - t.down,
                upvote_percentage = CASE
                    WHEN t.up + t.down = 0 THEN 0
                    ELSE ((200 * t.up + t.up + t.down) / (2 * (t.up + t.down)))::INT
                END
            FROM (
                SELECT COUNT(*) FILTER (WHERE direction = 1) AS up,
                       COUNT(*) FILTER (WHERE direction = -1) AS down
                FROM votes WHERE post_id = $1
            ) t
            WHERE p.id = $1
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("post"));
        }

        debug!("Recomputed score of post {}", post.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_row(kind: &str) -> PostRow {
        PostRow {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            category: "music".to_string(),
            title: "title".to_string(),
            body: "body".to_string(),
            url: None,
            author_id: "u1".to_string(),
            author_username: "alice".to_string(),
            created_at: Utc::now(),
            views: 3,
            score: -1,
            upvote_percentage: 33,
        }
    }

    #[test]
    fn test_row_into_post() {
        let row = post_row("link");
        let id = row.id;
        let post = row.into_post(Vec::new(), vec![Vote::down("u2")]).unwrap();

        assert_eq!(post.id, id.to_string());
        assert_eq!(post.kind, PostKind::Link);
        assert_eq!(post.author.username, "alice");
        assert_eq!(post.upvote_percentage, 33);
        assert_eq!(post.vote_of("u2"), Some(VoteDirection::Down));
    }

    #[test]
    fn test_unknown_kind_is_internal_error() {
        let err = post_row("video").into_post(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn test_vote_row_direction() {
        let row = VoteRow {
            post_id: Uuid::new_v4(),
            author_id: "u1".to_string(),
            direction: 1,
        };
        assert_eq!(Vote::try_from(row).unwrap(), Vote::up("u1"));

        let bad = VoteRow {
            post_id: Uuid::new_v4(),
            author_id: "u1".to_string(),
            direction: 0,
        };
        assert!(Vote::try_from(bad).is_err());
    }

    #[test]
    fn test_malformed_ids() {
        assert!(parse_id("not-a-uuid").is_none());
        assert!(parse_id(&Uuid::new_v4().to_string()).is_some());
    }
}
