use crate::{
    config::StorageBackend,
    error::{AppError, Result},
    models::{Author, Comment, CommentLog, NewPost, Post, Tally, Vote, VoteLedger},
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::PostRepository;

/// 投票账本和由它推导出的统计，放在同一把锁下
#[derive(Debug, Default)]
struct VoteState {
    ledger: VoteLedger,
    tally: Tally,
}

/// 进程内的帖子对象
///
/// 评论和投票各有一把锁：不同帖子之间互不竞争，同一帖子上的评论和投票也互不阻塞。
#[derive(Debug)]
struct PostEntry {
    head: Post,
    views: AtomicI64,
    comments: Mutex<CommentLog>,
    votes: Mutex<VoteState>,
}

impl PostEntry {
    fn new(head: Post) -> Self {
        Self {
            head,
            views: AtomicI64::new(0),
            comments: Mutex::new(CommentLog::new()),
            votes: Mutex::new(VoteState::default()),
        }
    }

    fn snapshot(&self) -> Post {
        let mut post = self.head.clone();
        post.views = self.views.load(Ordering::Relaxed);
        post.comments = self.comments.lock().to_vec();

        let votes = self.votes.lock();
        post.votes = votes.ledger.to_vec();
        post.score = votes.tally.score;
        post.upvote_percentage = votes.tally.upvote_percentage;
        post
    }
}

/// 进程内存储
///
/// 帖子集合由一把读写锁保护：列表和查找共享读，增删帖子独占写。
#[derive(Debug, Default)]
pub struct MemoryPostRepository {
    posts: RwLock<Vec<Arc<PostEntry>>>,
}

impl MemoryPostRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在集合读锁下操作一个帖子
    ///
    /// 读锁一直持有到 `f` 返回，`delete` 需要写锁，所以不会在查找和修改之间把帖子删掉。
    fn with_entry<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&PostEntry) -> T,
    {
        let posts = self.posts.read();
        let entry = posts
            .iter()
            .find(|entry| entry.head.id == id)
            .ok_or_else(|| AppError::not_found("post"))?;
        Ok(f(entry.as_ref()))
    }

    fn filter<F>(&self, predicate: F) -> Vec<Post>
    where
        F: Fn(&Post) -> bool,
    {
        self.posts
            .read()
            .iter()
            .filter(|entry| predicate(&entry.head))
            .map(|entry| entry.snapshot())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.posts.read().len()
    }

    #[cfg(test)]
    fn entry(&self, id: &str) -> Option<Arc<PostEntry>> {
        self.posts.read().iter().find(|entry| entry.head.id == id).cloned()
    }
}

#[async_trait]
impl PostRepository for MemoryPostRepository {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }

    async fn get_all(&self) -> Result<Vec<Post>> {
        Ok(self.filter(|_| true))
    }

    async fn get_by_id(&self, id: &str) -> Result<Post> {
        debug!("Getting post by ID: {}", id);
        self.with_entry(id, PostEntry::snapshot)
    }

    async fn get_by_category(&self, category: &str) -> Result<Vec<Post>> {
        debug!("Getting posts in category: {}", category);
        Ok(self.filter(|post| post.category == category))
    }

    async fn get_by_user(&self, username: &str) -> Result<Vec<Post>> {
        debug!("Getting posts by user: {}", username);
        Ok(self.filter(|post| post.author.username == username))
    }

    async fn add(&self, post: NewPost) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(PostEntry::new(Post::from_new(id.clone(), post)));

        self.posts.write().push(entry);

        info!("Created post: {}", id);
        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut posts = self.posts.write();
        let idx = posts
            .iter()
            .position(|entry| entry.head.id == id)
            .ok_or_else(|| AppError::not_found("post"))?;

        // 集合本身没有顺序约定，O(1) 删除
        posts.swap_remove(idx);

        info!("Deleted post: {}", id);
        Ok(())
    }

    async fn add_view(&self, post: &Post) -> Result<()> {
        self.with_entry(&post.id, |entry| {
            entry.views.fetch_add(1, Ordering::Relaxed);
        })
    }

    async fn add_comment(&self, post: &Post, body: &str, author: &Author) -> Result<String> {
        let comment = Comment::new(Uuid::new_v4().to_string(), body, author.clone());
        let id = self.with_entry(&post.id, |entry| entry.comments.lock().append(comment).id.clone())?;

        debug!("Added comment {} to post {}", id, post.id);
        Ok(id)
    }

    async fn delete_comment(&self, post: &Post, comment_id: &str) -> Result<()> {
        self.with_entry(&post.id, |entry| entry.comments.lock().remove(comment_id))??;

        debug!("Deleted comment {} from post {}", comment_id, post.id);
        Ok(())
    }

    async fn vote(&self, post: &Post, vote: Vote) -> Result<()> {
        debug!("User {} voting {:?} on post {}", vote.author_id, vote.direction, post.id);
        self.with_entry(&post.id, |entry| {
            entry.votes.lock().ledger.cast(vote);
        })
    }

    async fn unvote(&self, post: &Post, author_id: &str) -> Result<()> {
        self.with_entry(&post.id, |entry| {
            entry.votes.lock().ledger.retract(author_id);
        })
    }

    async fn update_score(&self, post: &Post) -> Result<()> {
        let score = self.with_entry(&post.id, |entry| {
            let mut votes = entry.votes.lock();
            votes.tally = votes.ledger.tally();
            votes.tally.score
        })?;

        debug!("Post {} score is now {}", post.id, score);
        Ok(())
    }
}
