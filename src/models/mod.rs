pub mod author;
pub mod comment;
pub mod post;
pub mod vote;

pub use author::Author;
pub use comment::{Comment, CommentLog};
pub use post::{CreatePostRequest, NewPost, Post, PostKind};
pub use vote::{Tally, Vote, VoteAction, VoteDirection, VoteLedger};
