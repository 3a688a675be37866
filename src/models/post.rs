use serde::{Deserialize, Serialize};
use chrono::{DateTime, SubsecRound, Utc};
use validator::Validate;
use std::str::FromStr;

use super::{Author, Comment, Vote, VoteDirection};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Text,
    Link,
}

impl Default for PostKind {
    fn default() -> Self {
        Self::Text
    }
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Link => "link",
        }
    }
}

impl FromStr for PostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "link" => Ok(Self::Link),
            other => Err(format!("unknown post kind: {}", other)),
        }
    }
}

/// 帖子聚合：帖子本身 + 评论 + 投票
///
/// `score` 和 `upvote_percentage` 由投票集合推导，只能通过
/// `UpdateScore` 重新计算，不允许手工修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PostKind,
    pub category: String,
    pub title: String,
    pub text: String,
    pub url: Option<String>,
    pub author: Author,
    pub created: DateTime<Utc>,
    pub views: i64,
    pub score: i64,
    pub upvote_percentage: u8,
    pub comments: Vec<Comment>,
    pub votes: Vec<Vote>,
}

impl Post {
    /// 用后端分配的 ID 实例化一个空帖子（无评论、无投票、零分）
    pub fn from_new(id: String, new_post: NewPost) -> Self {
        Self {
            id,
            kind: new_post.kind,
            category: new_post.category,
            title: new_post.title,
            text: new_post.text,
            url: new_post.url,
            author: new_post.author,
            created: new_post.created,
            views: 0,
            score: 0,
            upvote_percentage: 0,
            comments: Vec::new(),
            votes: Vec::new(),
        }
    }

    pub fn find_comment(&self, comment_id: &str) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == comment_id)
    }

    pub fn vote_of(&self, author_id: &str) -> Option<VoteDirection> {
        self.votes
            .iter()
            .find(|v| v.author_id == author_id)
            .map(|v| v.direction)
    }

    pub fn is_authored_by(&self, author: &Author) -> bool {
        self.author.id == author.id
    }
}

/// 尚未持久化的帖子，ID 由存储后端在 `add` 时分配
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPost {
    pub kind: PostKind,
    pub category: String,
    pub title: String,
    pub text: String,
    pub url: Option<String>,
    pub author: Author,
    pub created: DateTime<Utc>,
}

impl NewPost {
    pub fn new(
        kind: PostKind,
        category: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        url: Option<String>,
        author: Author,
    ) -> Self {
        Self {
            kind,
            category: category.into(),
            title: title.into(),
            text: text.into(),
            url,
            author,
            created: Utc::now().trunc_subsecs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePostRequest {
    #[serde(rename = "type", default)]
    pub kind: PostKind,

    #[validate(length(min = 1, max = 64))]
    pub category: String,

    #[validate(length(min = 1, max = 300))]
    pub title: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub url: Option<String>,
}
