use crate::error::{AppError, Result};
use url::Url;
use uuid::Uuid;

/// 评论内容校验：不能为空，长度按 Unicode 码点计算
pub fn validate_comment_body(body: &str, max_length: usize) -> Result<()> {
    if body.trim().is_empty() {
        return Err(AppError::Validation("comment is required".to_string()));
    }

    let length = body.chars().count();
    if length > max_length {
        return Err(AppError::CommentTooLong {
            length,
            max: max_length,
        });
    }

    Ok(())
}

/// 规范化帖子链接：去掉首尾空白，只接受 http/https 绝对地址
pub fn normalize_link(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidUrl("url is required for link posts".to_string()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| AppError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(trimmed.to_string()),
        _ => Err(AppError::InvalidUrl(format!("{}: only http(s) links are allowed", trimmed))),
    }
}

/// 任意形式的 UUID（带或不带连字符）
pub fn is_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// 32 位小写十六进制的 UUID，文档库的记录键使用这种格式
pub fn is_simple_uuid(id: &str) -> bool {
    id.len() == 32
        && id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
