use serde::{Deserialize, Serialize};

/// 帖子、评论和投票上附带的作者信息
///
/// 由认证模块提供，存储层只按值保存，不做校验。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: String,
}

impl Author {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}
