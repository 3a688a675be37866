pub mod database;
pub mod link_checker;
pub mod post;
pub mod ranking;

// 重新导出常用类型
pub use database::Database;
pub use link_checker::{HttpLinkChecker, LinkChecker};
pub use post::PostService;
pub use ranking::RankingService;
