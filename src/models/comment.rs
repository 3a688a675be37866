use serde::{Deserialize, Serialize};
use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{AppError, Result};
use super::Author;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub created: DateTime<Utc>,
    pub author: Author,
}

impl Comment {
    pub fn new(id: impl Into<String>, body: impl Into<String>, author: Author) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            created: Utc::now().trunc_subsecs(3),
            author,
        }
    }
}

/// 单个帖子的评论序列
///
/// 追加到末尾；删除时保持其余评论的相对顺序。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentLog {
    comments: Vec<Comment>,
}

impl CommentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, comment: Comment) -> &Comment {
        self.comments.push(comment);
        // just pushed, never empty
        &self.comments[self.comments.len() - 1]
    }

    pub fn position(&self, comment_id: &str) -> Option<usize> {
        self.comments.iter().position(|c| c.id == comment_id)
    }

    pub fn remove(&mut self, comment_id: &str) -> Result<Comment> {
        let idx = self
            .position(comment_id)
            .ok_or_else(|| AppError::comment_not_found(comment_id))?;
        Ok(self.comments.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn as_slice(&self) -> &[Comment] {
        &self.comments
    }

    pub fn to_vec(&self) -> Vec<Comment> {
        self.comments.clone()
    }
}

impl From<Vec<Comment>> for CommentLog {
    fn from(comments: Vec<Comment>) -> Self {
        Self { comments }
    }
}
