use crate::models::Post;

/// 帖子排序：score 降序，score 相同时 views 降序
///
/// 两者都相同的帖子保持输入顺序。
#[derive(Debug, Clone, Copy, Default)]
pub struct RankingService;

impl RankingService {
    pub fn new() -> Self {
        Self
    }

    pub fn rank(&self, mut posts: Vec<Post>) -> Vec<Post> {
        posts.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| b.views.cmp(&a.views)));
        posts
    }
}
