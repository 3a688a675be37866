use crate::{config::Config, services::PostService};

/// 应用程序的共享状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Config,

    /// 帖子服务
    pub post_service: PostService,
}

impl AppState {
    /// 检查是否为生产环境
    pub fn is_production(&self) -> bool {
        self.config.is_production()
    }

    /// 检查是否为开发环境
    pub fn is_development(&self) -> bool {
        self.config.is_development()
    }
}
