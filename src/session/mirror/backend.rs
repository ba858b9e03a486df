//! 镜像库后端：对会话管理器而言是黑盒，只暴露 is_healthy / execute / query
//!
//! SQLite 实现使用 rusqlite（同步），所有调用放进 spawn_blocking，避免阻塞 async 上下文。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde_json::{Map, Value};
use thiserror::Error;

/// 镜像错误：只在镜像边界内流动，最终被记录日志或转成 HTTP 的 error 字段
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Mirror unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Mirror task failed: {0}")]
    Task(String),

    #[error("Malformed mirror row: {0}")]
    Row(String),
}

/// 绑定参数
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// 一条带参数的写语句
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// 查询结果行：列名 -> JSON 值
pub type Row = Map<String, Value>;

/// 镜像后端接口
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    /// 当前是否可达
    async fn is_healthy(&self) -> bool;

    /// 执行写语句，返回受影响行数
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, MirrorError>;

    /// 执行查询
    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, MirrorError>;

    /// 依次执行一组写语句，返回受影响行数之和。
    /// 支持事务的后端应全部生效或全部不生效；默认实现逐条执行，遇错即停
    async fn execute_batch(&self, statements: Vec<SqlStatement>) -> Result<u64, MirrorError> {
        let mut total = 0;
        for stmt in statements {
            total += self.execute(&stmt.sql, stmt.params).await?;
        }
        Ok(total)
    }
}

/// SQLite 镜像
pub struct SqliteMirror {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteMirror {
    /// 打开（或创建）数据库文件；父目录不存在时创建
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, MirrorError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MirrorError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(2))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, MirrorError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MirrorError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, MirrorError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| MirrorError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| MirrorError::Task(e.to_string()))?
    }
}

#[async_trait]
impl MirrorBackend for SqliteMirror {
    async fn is_healthy(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(MirrorError::from)
        })
        .await
        .is_ok()
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, MirrorError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(n as u64)
        })
        .await
    }

    /// 单个事务内执行；任一语句失败时回滚
    async fn execute_batch(&self, statements: Vec<SqlStatement>) -> Result<u64, MirrorError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut total = 0u64;
            for stmt in &statements {
                total += tx.execute(&stmt.sql, rusqlite::params_from_iter(stmt.params.iter()))? as u64;
            }
            tx.commit()?;
            Ok(total)
        })
        .await
    }

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, MirrorError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut map = Map::new();
                for (idx, name) in columns.iter().enumerate() {
                    let value = match row.get_ref(idx)? {
                        ValueRef::Null => Value::Null,
                        ValueRef::Integer(i) => Value::from(i),
                        ValueRef::Real(f) => Value::from(f),
                        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                    };
                    map.insert(name.clone(), value);
                }
                out.push(map);
            }
            Ok(out)
        })
        .await
    }
}

/// 未配置镜像时使用：永远不可达
#[derive(Debug, Default)]
pub struct DisabledMirror;

#[async_trait]
impl MirrorBackend for DisabledMirror {
    async fn is_healthy(&self) -> bool {
        false
    }

    async fn execute(&self, _sql: &str, _params: Vec<SqlValue>) -> Result<u64, MirrorError> {
        Err(MirrorError::Unavailable("mirror is disabled".to_string()))
    }

    async fn query(&self, _sql: &str, _params: Vec<SqlValue>) -> Result<Vec<Row>, MirrorError> {
        Err(MirrorError::Unavailable("mirror is disabled".to_string()))
    }
}
