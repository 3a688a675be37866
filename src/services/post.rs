use crate::{
    config::Config,
    error::{AppError, Result},
    models::{Author, CreatePostRequest, NewPost, Post, PostKind, Vote, VoteAction},
    repository::PostRepository,
    services::{link_checker::LinkChecker, ranking::RankingService},
    utils::validation::{normalize_link, validate_comment_body},
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use validator::Validate;

/// 帖子相关的业务操作
///
/// 在存储层之上负责：ID 格式校验、作者权限、评论长度、外链检查和列表排序。
/// 每次写操作之后都会重新读取帖子，返回存储里的最新状态。
#[derive(Clone)]
pub struct PostService {
    repo: Arc<dyn PostRepository>,
    link_checker: Arc<dyn LinkChecker>,
    ranking: RankingService,
    max_comment_length: usize,
}

impl PostService {
    pub fn new(repo: Arc<dyn PostRepository>, link_checker: Arc<dyn LinkChecker>, config: &Config) -> Self {
        Self {
            repo,
            link_checker,
            ranking: RankingService::new(),
            max_comment_length: config.max_comment_length,
        }
    }

    pub fn repository(&self) -> &Arc<dyn PostRepository> {
        &self.repo
    }

    pub async fn list_all(&self) -> Result<Vec<Post>> {
        let posts = self.repo.get_all().await?;
        Ok(self.ranking.rank(posts))
    }

    pub async fn list_by_category(&self, category: &str) -> Result<Vec<Post>> {
        let posts = self.repo.get_by_category(category).await?;
        Ok(self.ranking.rank(posts))
    }

    pub async fn list_by_user(&self, username: &str) -> Result<Vec<Post>> {
        let posts = self.repo.get_by_user(username).await?;
        Ok(self.ranking.rank(posts))
    }

    /// 打开帖子会计一次浏览
    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        let post = self.load(post_id).await?;
        self.repo.add_view(&post).await?;
        self.repo.get_by_id(&post.id).await
    }

    pub async fn create_post(&self, author: &Author, request: CreatePostRequest) -> Result<Post> {
        request.validate()?;

        let url = match request.url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(self.check_link(raw).await?),
            _ => None,
        };

        if request.kind == PostKind::Link && url.is_none() {
            return Err(AppError::validation("url is required for link posts"));
        }

        let new_post = NewPost::new(
            request.kind,
            request.category,
            request.title,
            request.text.unwrap_or_default(),
            url,
            author.clone(),
        );

        let id = self.repo.add(new_post).await?;
        info!("User {} created post {}", author.username, id);

        self.repo.get_by_id(&id).await
    }

    /// 只有帖子作者可以删除帖子
    pub async fn delete_post(&self, author: &Author, post_id: &str) -> Result<()> {
        let post = self.load(post_id).await?;
        if !post.is_authored_by(author) {
            warn!("User {} tried to delete post {} of {}", author.id, post.id, post.author.id);
            return Err(AppError::unauthorized("only the author can delete a post"));
        }

        self.repo.delete(&post.id).await
    }

    pub async fn add_comment(&self, author: &Author, post_id: &str, body: &str) -> Result<Post> {
        self.ensure_valid_id(post_id)?;
        validate_comment_body(body, self.max_comment_length)?;

        let post = self.repo.get_by_id(post_id).await?;
        let comment_id = self.repo.add_comment(&post, body, author).await?;
        debug!("User {} commented {} on post {}", author.id, comment_id, post.id);

        self.repo.get_by_id(&post.id).await
    }

    /// 只有评论作者可以删除评论
    pub async fn delete_comment(&self, author: &Author, post_id: &str, comment_id: &str) -> Result<Post> {
        let post = self.load(post_id).await?;

        let comment = post
            .find_comment(comment_id)
            .ok_or_else(|| AppError::comment_not_found(comment_id))?;
        if comment.author.id != author.id {
            return Err(AppError::unauthorized("only the author can delete a comment"));
        }

        self.repo.delete_comment(&post, comment_id).await?;
        self.repo.get_by_id(&post.id).await
    }

    /// `action` 为 upvote / downvote / unvote
    pub async fn vote(&self, author: &Author, post_id: &str, action: &str) -> Result<Post> {
        let post = self.load(post_id).await?;

        match action.parse::<VoteAction>()?.direction() {
            Some(direction) => self.repo.vote(&post, Vote::new(author.id.clone(), direction)).await?,
            None => self.repo.unvote(&post, &author.id).await?,
        }

        let voted = self.repo.get_by_id(&post.id).await?;
        self.repo.update_score(&voted).await?;
        self.repo.get_by_id(&post.id).await
    }

    fn ensure_valid_id(&self, post_id: &str) -> Result<()> {
        if self.repo.is_valid_id(post_id) {
            Ok(())
        } else {
            Err(AppError::invalid_identifier(post_id))
        }
    }

    async fn load(&self, post_id: &str) -> Result<Post> {
        self.ensure_valid_id(post_id)?;
        self.repo.get_by_id(post_id).await
    }

    async fn check_link(&self, raw: &str) -> Result<String> {
        let url = normalize_link(raw)?;
        if !self.link_checker.is_reachable(&url).await {
            return Err(AppError::InvalidUrl(format!("{} is not reachable", url)));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteDirection;
    use crate::repository::MemoryPostRepository;
    use crate::services::link_checker::MockLinkChecker;
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn alice() -> Author {
        Author::new("u-alice", "alice")
    }

    fn bob() -> Author {
        Author::new("u-bob", "bob")
    }

    fn service_with(checker: MockLinkChecker) -> PostService {
        PostService::new(
            Arc::new(MemoryPostRepository::new()),
            Arc::new(checker),
            &Config::default(),
        )
    }

    fn service() -> PostService {
        let mut checker = MockLinkChecker::new();
        checker.expect_is_reachable().never();
        service_with(checker)
    }

    fn text_post(category: &str) -> CreatePostRequest {
        CreatePostRequest {
            kind: PostKind::Text,
            category: category.to_string(),
            title: "hello".to_string(),
            text: Some("world".to_string()),
            url: None,
        }
    }

    #[tokio::test]
    async fn test_create_text_post_skips_link_check() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();

        assert_eq!(post.author, alice());
        assert_eq!(post.text, "world");
        assert!(post.comments.is_empty());
        assert_eq!(post.score, 0);
    }

    #[tokio::test]
    async fn test_create_link_post_trims_and_probes() {
        let mut checker = MockLinkChecker::new();
        checker
            .expect_is_reachable()
            .with(eq("https://example.com/story"))
            .times(1)
            .returning(|_| true);
        let service = service_with(checker);

        let request = CreatePostRequest {
            kind: PostKind::Link,
            url: Some("  https://example.com/story ".to_string()),
            text: None,
            ..text_post("news")
        };
        let post = service.create_post(&alice(), request).await.unwrap();
        assert_eq!(post.url.as_deref(), Some("https://example.com/story"));
    }

    #[tokio::test]
    async fn test_unreachable_link_rejected() {
        let mut checker = MockLinkChecker::new();
        checker.expect_is_reachable().returning(|_| false);
        let service = service_with(checker);

        let request = CreatePostRequest {
            kind: PostKind::Link,
            url: Some("https://example.com/dead".to_string()),
            ..text_post("news")
        };
        let err = service.create_post(&alice(), request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidUrl(_)));
        assert!(service.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_post_requires_url() {
        let request = CreatePostRequest {
            kind: PostKind::Link,
            ..text_post("news")
        };
        let err = service().create_post(&alice(), request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_title_validation() {
        let request = CreatePostRequest {
            title: String::new(),
            ..text_post("news")
        };
        let err = service().create_post(&alice(), request).await.unwrap_err();
        assert!(matches!(err, AppError::ValidatorError(_)));
    }

    #[tokio::test]
    async fn test_get_post_counts_view() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();

        service.get_post(&post.id).await.unwrap();
        let viewed = service.get_post(&post.id).await.unwrap();
        assert_eq!(viewed.views, 2);
    }

    #[tokio::test]
    async fn test_malformed_and_missing_ids() {
        let service = service();

        let err = service.get_post("nope").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(_)));

        let err = service.get_post(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_only_author_deletes_post() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();

        let err = service.delete_post(&bob(), &post.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        service.delete_post(&alice(), &post.id).await.unwrap();
        assert!(matches!(service.get_post(&post.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_comment_rules() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();

        let err = service.add_comment(&bob(), &post.id, "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let long = "я".repeat(2001);
        let err = service.add_comment(&bob(), &post.id, &long).await.unwrap_err();
        assert!(matches!(err, AppError::CommentTooLong { length: 2001, max: 2000 }));

        let exact = "я".repeat(2000);
        let post = service.add_comment(&bob(), &post.id, &exact).await.unwrap();
        assert_eq!(post.comments.len(), 1);
    }

    #[tokio::test]
    async fn test_only_comment_author_deletes_comment() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();
        let post = service.add_comment(&bob(), &post.id, "hi").await.unwrap();
        let comment_id = post.comments[0].id.clone();

        // 帖子作者也不能删除别人的评论
        let err = service.delete_comment(&alice(), &post.id, &comment_id).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = service.delete_comment(&bob(), &post.id, "missing").await.unwrap_err();
        assert!(matches!(err, AppError::CommentNotFound(_)));

        let post = service.delete_comment(&bob(), &post.id, &comment_id).await.unwrap();
        assert!(post.comments.is_empty());
    }

    #[tokio::test]
    async fn test_vote_actions_update_score() {
        let service = service();
        let post = service.create_post(&alice(), text_post("music")).await.unwrap();

        let post = service.vote(&alice(), &post.id, "upvote").await.unwrap();
        assert_eq!((post.score, post.upvote_percentage), (1, 100));

        let post = service.vote(&bob(), &post.id, "downvote").await.unwrap();
        assert_eq!((post.score, post.upvote_percentage), (0, 50));

        let post = service.vote(&alice(), &post.id, "downvote").await.unwrap();
        assert_eq!(post.votes.len(), 2);
        assert_eq!(post.vote_of(&alice().id), Some(VoteDirection::Down));
        assert_eq!((post.score, post.upvote_percentage), (-2, 0));

        let post = service.vote(&bob(), &post.id, "unvote").await.unwrap();
        assert_eq!(post.votes.len(), 1);
        assert_eq!(post.score, -1);

        let err = service.vote(&bob(), &post.id, "sidevote").await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedVoteAction(_)));
    }

    #[tokio::test]
    async fn test_listings_are_ranked() {
        let service = service();
        let low = service.create_post(&alice(), text_post("music")).await.unwrap();
        let high = service.create_post(&bob(), text_post("music")).await.unwrap();
        service.create_post(&bob(), text_post("funny")).await.unwrap();

        service.vote(&alice(), &high.id, "upvote").await.unwrap();
        service.vote(&bob(), &low.id, "downvote").await.unwrap();

        let ranked: Vec<String> = service
            .list_by_category("music")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ranked, vec![high.id.clone(), low.id.clone()]);

        assert_eq!(service.list_by_user("bob").await.unwrap()[0].id, high.id);
        assert_eq!(service.list_all().await.unwrap().len(), 3);
    }
}
