use async_trait::async_trait;
use rainbow_forum::{
    config::{Config, StorageBackend},
    error::AppError,
    models::{Author, CreatePostRequest, PostKind},
    repository,
    services::{LinkChecker, PostService},
};
use std::sync::Arc;

/// 固定返回结果的链接检查
struct FixedLinkChecker(bool);

#[async_trait]
impl LinkChecker for FixedLinkChecker {
    async fn is_reachable(&self, _url: &str) -> bool {
        self.0
    }
}

async fn service(backend: StorageBackend, links_work: bool) -> PostService {
    let config = Config {
        storage_backend: backend,
        ..Config::default()
    };
    let repo = repository::connect(&config).await.unwrap();
    PostService::new(repo, Arc::new(FixedLinkChecker(links_work)), &config)
}

fn alice() -> Author {
    Author::new("u-alice", "alice")
}

fn bob() -> Author {
    Author::new("u-bob", "bob")
}

fn link_post(url: &str) -> CreatePostRequest {
    CreatePostRequest {
        kind: PostKind::Link,
        category: "programming".to_string(),
        title: "Rust 1.0".to_string(),
        text: None,
        url: Some(url.to_string()),
    }
}

async fn comment_lifecycle(backend: StorageBackend) {
    let service = service(backend, true).await;

    let post = service
        .create_post(&alice(), link_post("https://blog.rust-lang.org/"))
        .await
        .unwrap();
    assert_eq!(post.kind, PostKind::Link);

    let post = service.add_comment(&bob(), &post.id, "hi").await.unwrap();
    assert_eq!(post.comments.len(), 1);
    let comment_id = post.comments[0].id.clone();

    service.delete_comment(&bob(), &post.id, &comment_id).await.unwrap();

    let post = service.get_post(&post.id).await.unwrap();
    assert!(post.comments.is_empty());
    assert_eq!(post.views, 1);
}

async fn voting_and_ranking(backend: StorageBackend) {
    let service = service(backend, true).await;

    let first = service.create_post(&alice(), link_post("https://a.example/")).await.unwrap();
    let second = service.create_post(&bob(), link_post("https://b.example/")).await.unwrap();

    service.vote(&alice(), &second.id, "upvote").await.unwrap();
    let second = service.vote(&bob(), &second.id, "upvote").await.unwrap();
    assert_eq!((second.score, second.upvote_percentage), (2, 100));

    let first = service.vote(&bob(), &first.id, "downvote").await.unwrap();
    assert_eq!(first.score, -1);

    let ranked: Vec<String> = service.list_all().await.unwrap().into_iter().map(|p| p.id).collect();
    assert_eq!(ranked, vec![second.id.clone(), first.id.clone()]);

    let err = service.vote(&bob(), &first.id, "maybe").await.unwrap_err();
    assert!(matches!(err, AppError::UnsupportedVoteAction(_)));
}

async fn authorship_and_deletion(backend: StorageBackend) {
    let service = service(backend, true).await;
    let post = service.create_post(&alice(), link_post("https://a.example/")).await.unwrap();

    assert!(matches!(
        service.delete_post(&bob(), &post.id).await,
        Err(AppError::Unauthorized(_))
    ));

    service.add_comment(&bob(), &post.id, "first").await.unwrap();
    service.delete_post(&alice(), &post.id).await.unwrap();

    assert!(matches!(service.get_post(&post.id).await, Err(AppError::NotFound(_))));
    assert!(service.list_by_user("alice").await.unwrap().is_empty());
    assert!(matches!(
        service.get_post("zzz").await,
        Err(AppError::InvalidIdentifier(_))
    ));
}

async fn unreachable_link(backend: StorageBackend) {
    let service = service(backend, false).await;

    let err = service
        .create_post(&alice(), link_post("https://down.example/"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidUrl(_)));

    let err = service
        .create_post(&alice(), link_post("mailto:someone@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidUrl(_)));

    assert!(service.list_by_category("programming").await.unwrap().is_empty());
}

mod memory {
    use super::*;

    #[tokio::test]
    async fn test_comment_lifecycle() {
        comment_lifecycle(StorageBackend::Memory).await;
    }

    #[tokio::test]
    async fn test_voting_and_ranking() {
        voting_and_ranking(StorageBackend::Memory).await;
    }

    #[tokio::test]
    async fn test_authorship_and_deletion() {
        authorship_and_deletion(StorageBackend::Memory).await;
    }

    #[tokio::test]
    async fn test_unreachable_link() {
        unreachable_link(StorageBackend::Memory).await;
    }
}

mod document {
    use super::*;

    #[tokio::test]
    async fn test_comment_lifecycle() {
        comment_lifecycle(StorageBackend::Document).await;
    }

    #[tokio::test]
    async fn test_voting_and_ranking() {
        voting_and_ranking(StorageBackend::Document).await;
    }

    #[tokio::test]
    async fn test_authorship_and_deletion() {
        authorship_and_deletion(StorageBackend::Document).await;
    }

    #[tokio::test]
    async fn test_unreachable_link() {
        unreachable_link(StorageBackend::Document).await;
    }
}
