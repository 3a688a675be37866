use crate::config::Config;
use crate::error::Result;
use crate::repository::ManageConnection;
use async_trait::async_trait;
use serde::Serialize;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::{Response, Surreal};
use tracing::{debug, error, info};

/// 单个 SurrealDB 连接
#[derive(Clone)]
pub struct Database {
    client: Surreal<Any>,
}

impl Database {
    /// 创建新的数据库连接
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        debug!("Opening database connection to {}", settings.url);

        let client = any::connect(settings.url.as_str()).await?;

        // 内嵌内存库没有用户体系，不需要登录
        if !settings.is_embedded() {
            client
                .signin(Root {
                    username: &settings.username,
                    password: &settings.password,
                })
                .await?;
        }

        client
            .use_ns(settings.namespace.as_str())
            .use_db(settings.database.as_str())
            .await?;

        Ok(Self { client })
    }

    /// 验证数据库连接
    pub async fn verify_connection(&self) -> Result<()> {
        match self.query("INFO FOR DB").await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to verify database connection: {}", e);
                Err(e)
            }
        }
    }

    /// 执行原始查询
    pub async fn query(&self, sql: &str) -> Result<Response> {
        let response = self.client.query(sql).await?;
        Ok(response.check()?)
    }

    /// 执行带参数的查询，任何一条语句失败都会返回错误
    pub async fn query_with_params<P>(&self, sql: &str, params: P) -> Result<Response>
    where
        P: Serialize,
    {
        debug!("Executing query: {}", sql.trim());
        let response = self.client.query(sql).bind(params).await?;
        Ok(response.check()?)
    }
}

/// 文档库连接参数
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DatabaseSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.database_url.clone(),
            namespace: config.database_namespace.clone(),
            database: config.database_name.clone(),
            username: config.database_username.clone(),
            password: config.database_password.clone(),
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.url.starts_with("mem://")
    }
}

/// 为连接池建立和检查 SurrealDB 连接
///
/// `mem://` 每次 connect 都会得到一个全新的空库，所以内嵌模式下所有句柄
/// 共享同一个底层客户端。
pub struct DatabaseManager {
    settings: DatabaseSettings,
    shared: Option<Database>,
}

impl DatabaseManager {
    pub async fn new(settings: DatabaseSettings) -> Result<Self> {
        let shared = if settings.is_embedded() {
            info!("Using embedded in-memory document store");
            Some(Database::connect(&settings).await?)
        } else {
            None
        };

        Ok(Self { settings, shared })
    }
}

#[async_trait]
impl ManageConnection for DatabaseManager {
    type Connection = Database;

    async fn connect(&self) -> Result<Database> {
        match &self.shared {
            Some(db) => Ok(db.clone()),
            None => Database::connect(&self.settings).await,
        }
    }

    async fn is_valid(&self, conn: &Database) -> bool {
        conn.verify_connection().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_settings() -> DatabaseSettings {
        DatabaseSettings::from_config(&Config::default())
    }

    #[tokio::test]
    async fn test_database_connection() {
        let db = Database::connect(&memory_settings()).await.unwrap();
        assert!(db.verify_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_embedded_handles_share_one_store() {
        let manager = DatabaseManager::new(memory_settings()).await.unwrap();
        let a = manager.connect().await.unwrap();
        let b = manager.connect().await.unwrap();

        a.query("CREATE marker:one SET seen = true").await.unwrap();
        let mut response = b.query("SELECT VALUE seen FROM marker").await.unwrap();
        let rows: Vec<bool> = response.take(0).unwrap();
        assert_eq!(rows, vec![true]);
        assert!(manager.is_valid(&b).await);
    }
}
