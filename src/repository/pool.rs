//! 固定容量的连接池
//!
//! 启动时预先建立 N 个连接。`acquire` 在没有空闲连接时挂起等待，这是限制并发访问
//! 存储的背压手段。借出的连接由 [`PooledConnection`] 守卫持有，无论操作成功、
//! 失败还是超时，守卫析构时都会把连接还回池中。被标记为损坏的连接不会回到池里，
//! 而是在后台重新建立一个新连接补位，池的容量始终保持为 N。

use crate::error::{AppError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 建立和检查连接的方式
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// 连接是否仍然可用
    async fn is_valid(&self, conn: &Self::Connection) -> bool;
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    idle: Mutex<VecDeque<M::Connection>>,
    // 许可数始终等于 idle 中的连接数
    available: Semaphore,
    size: usize,
    acquire_timeout: Duration,
}

impl<M: ManageConnection> PoolInner<M> {
    fn put_back(&self, conn: M::Connection) {
        self.idle.lock().push_back(conn);
        self.available.add_permits(1);
    }
}

pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// 预先建立 `size` 个连接，任何一个失败都会导致创建失败
    pub async fn new(manager: M, size: usize, acquire_timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(AppError::internal("connection pool size must be at least 1"));
        }

        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            idle.push_back(manager.connect().await?);
        }

        info!("Connection pool ready with {} connections", size);

        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(idle),
                available: Semaphore::new(size),
                size,
                acquire_timeout,
            }),
        })
    }

    /// 借出一个连接，没有空闲连接时一直等待
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .map_err(|_| AppError::internal("connection pool closed"))?;
        permit.forget();

        let conn = self
            .inner
            .idle
            .lock()
            .pop_front()
            .ok_or_else(|| AppError::internal("connection pool permit without an idle connection"))?;

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            broken: false,
        })
    }

    /// 带超时的借出，超时返回 `PoolTimedOut`
    pub async fn acquire_timeout(&self) -> Result<PooledConnection<M>> {
        let limit = self.inner.acquire_timeout;
        match tokio::time::timeout(limit, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Timed out after {:?} waiting for a pooled connection", limit);
                Err(AppError::PoolTimedOut(limit))
            }
        }
    }

    /// 归还连接前先检查它是否还活着，不可用的连接会被替换
    pub async fn release(&self, mut conn: PooledConnection<M>) {
        let alive = match conn.conn.as_ref() {
            Some(c) => self.inner.manager.is_valid(c).await,
            None => false,
        };
        if !alive {
            conn.mark_broken();
        }
        drop(conn);
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle(&self) -> usize {
        self.inner.available.available_permits()
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

/// 借出的连接
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    broken: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// 标记为损坏，析构时丢弃并补建新连接
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("held", &self.conn.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // conn 只在 drop 中被取走
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if !self.broken {
            self.pool.put_back(conn);
            return;
        }

        drop(conn);
        warn!("Discarding broken pooled connection, opening a replacement");

        // 只持有弱引用，池被丢弃后补建任务随之结束
        let pool = Arc::downgrade(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(replace_connection(pool));
            }
            Err(_) => {
                error!("No async runtime available, pool capacity reduced by one");
            }
        }
    }
}

async fn replace_connection<M: ManageConnection>(pool: Weak<PoolInner<M>>) {
    let mut backoff = Duration::from_millis(50);
    loop {
        let Some(inner) = pool.upgrade() else {
            debug!("Connection pool dropped, giving up on replacement");
            return;
        };

        match inner.manager.connect().await {
            Ok(fresh) => {
                debug!("Replacement connection established");
                inner.put_back(fresh);
                return;
            }
            Err(e) => {
                error!("Failed to open replacement connection: {}", e);
            }
        }

        drop(inner);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }
}
