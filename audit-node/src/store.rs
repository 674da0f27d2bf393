//! 序列化 SQLite 存儲
//!
//! 底層的 SQLite 連接不允許跨線程併發寫入，因此本模塊將連接
//! 交由一條專屬工作線程持有，所有讀寫請求通過命令通道排隊，
//! 嚴格按到達順序逐條執行。調用方同步等待每條命令的回執。
//!
//! # 示例
//!
//! ```no_run
//! use audit_node::store::SerializedStore;
//!
//! let store = SerializedStore::open(":memory:").unwrap();
//! store
//!     .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
//!     .unwrap();
//! store.close().unwrap();
//! ```

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, warn};

/// 存儲層錯誤
#[derive(Error, Debug)]
pub enum StoreError {
    /// 一般數據庫錯誤
    #[error("Database error: {0}")]
    Database(String),

    /// 唯一性約束衝突
    ///
    /// 單獨分類，供事件池將重複插入降級為警告
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// 存儲已關閉，命令無法入隊
    #[error("Store is closed")]
    Closed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == ErrorCode::ConstraintViolation {
                return StoreError::Constraint(err.to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

/// 查詢結果的一行，列名到 JSON 值的映射
pub type Row = serde_json::Map<String, serde_json::Value>;

/// SQL 參數
///
/// 調用方以 JSON 值傳參，入隊前轉換為 SQLite 原生類型
#[derive(Debug, Clone)]
pub enum Param {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Param {
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Param::Null => SqlValue::Null,
            Param::Integer(i) => SqlValue::Integer(*i),
            Param::Real(f) => SqlValue::Real(*f),
            Param::Text(s) => SqlValue::Text(s.clone()),
        }
    }
}

impl From<u64> for Param {
    fn from(v: u64) -> Self {
        Param::Integer(v as i64)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Integer(v)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::Integer(v as i64)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<Option<String>> for Param {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => Param::Text(s),
            None => Param::Null,
        }
    }
}

/// 腳本內單條語句失敗時的處置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorPolicy {
    /// 中止腳本並把錯誤返回給調用方
    Propagate,
    /// 記警告後繼續執行剩餘語句
    WarnAndContinue,
}

type Reply = std::result::Result<Vec<Row>, StoreError>;

enum Command {
    Execute {
        sql: String,
        params: Vec<Param>,
        reply: mpsc::Sender<Reply>,
    },
    Script {
        script: String,
        on_error: ScriptErrorPolicy,
        reply: mpsc::Sender<Reply>,
    },
    Close,
}

/// 序列化 SQLite 存儲
///
/// 單一工作線程持有連接，公開方法線程安全，可被任意多個
/// 調用方共享（通常包在 `Arc` 裡）。
pub struct SerializedStore {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerializedStore {
    /// 打開或創建數據庫文件，啟動工作線程
    ///
    /// # 參數
    ///
    /// * `path` - 數據庫文件路徑，`:memory:` 表示純內存庫
    pub fn open(path: &str) -> std::result::Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        let (tx, rx) = mpsc::channel::<Command>();
        let worker = std::thread::Builder::new()
            .name("serialized-store".to_string())
            .spawn(move || worker_loop(conn, rx))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(path = %path, "serialized store opened");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// 執行單條 SQL 語句，返回查詢結果行
    ///
    /// 寫語句返回空結果集。命令排隊執行，本方法阻塞到回執返回。
    pub fn execute(&self, sql: &str, params: &[Param]) -> std::result::Result<Vec<Row>, StoreError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::Execute {
            sql: sql.to_string(),
            params: params.to_vec(),
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| StoreError::Closed)?
    }

    /// 以單個排隊單元執行多條語句的腳本
    ///
    /// 整個腳本作為一條命令入隊，期間不會有其他命令插入執行。
    /// 單條語句失敗時按 `on_error` 決定中止還是降級為警告繼續。
    pub fn execute_script(
        &self,
        script: &str,
        on_error: ScriptErrorPolicy,
    ) -> std::result::Result<(), StoreError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::Script {
            script: script.to_string(),
            on_error,
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| StoreError::Closed)?.map(|_| ())
    }

    /// 關閉存儲
    ///
    /// 已入隊的命令先排空，之後工作線程退出並釋放連接。
    /// 冪等：重複調用返回 Ok。
    pub fn close(&self) -> std::result::Result<(), StoreError> {
        let sender = {
            let mut guard = self
                .sender
                .lock()
                .map_err(|_| StoreError::Database("sender lock poisoned".to_string()))?;
            guard.take()
        };
        if let Some(tx) = sender {
            // Close 之後通道即被丟棄，後續 send 都會失敗
            let _ = tx.send(Command::Close);
        }
        let worker = {
            let mut guard = self
                .worker
                .lock()
                .map_err(|_| StoreError::Database("worker lock poisoned".to_string()))?;
            guard.take()
        };
        if let Some(handle) = worker {
            handle
                .join()
                .map_err(|_| StoreError::Database("store worker panicked".to_string()))?;
        }
        debug!("serialized store closed");
        Ok(())
    }

    fn send(&self, cmd: Command) -> std::result::Result<(), StoreError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| StoreError::Database("sender lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| StoreError::Closed),
            None => Err(StoreError::Closed),
        }
    }
}

impl Drop for SerializedStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn worker_loop(conn: Connection, rx: mpsc::Receiver<Command>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Execute { sql, params, reply } => {
                let result = run_statement(&conn, &sql, &params);
                if let Err(e) = &result {
                    debug!(sql = %sql, error = %e, "statement failed");
                }
                let _ = reply.send(result);
            }
            Command::Script {
                script,
                on_error,
                reply,
            } => {
                let result = run_script(&conn, &script, on_error);
                if let Err(e) = &result {
                    error!(error = %e, "script failed");
                }
                let _ = reply.send(result.map(|_| Vec::new()));
            }
            Command::Close => break,
        }
    }
}

fn run_script(
    conn: &Connection,
    script: &str,
    on_error: ScriptErrorPolicy,
) -> std::result::Result<(), StoreError> {
    // 語句之間以分號分隔，DDL 與種子數據足夠用
    for statement in script.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if let Err(e) = conn.execute_batch(statement) {
            let err = StoreError::from(e);
            match on_error {
                ScriptErrorPolicy::Propagate => return Err(err),
                ScriptErrorPolicy::WarnAndContinue => {
                    warn!(sql = %statement, error = %err, "script statement skipped");
                }
            }
        }
    }
    Ok(())
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[Param],
) -> std::result::Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let sql_params: Vec<SqlValue> = params.iter().map(|p| p.to_sql_value()).collect();
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        sql_params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

    if column_names.is_empty() {
        // 寫語句
        stmt.execute(param_refs.as_slice())?;
        return Ok(Vec::new());
    }

    let mut rows = stmt.query(param_refs.as_slice())?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                rusqlite::types::ValueRef::Integer(v) => serde_json::Value::from(v),
                rusqlite::types::ValueRef::Real(v) => serde_json::Value::from(v),
                rusqlite::types::ValueRef::Text(v) => {
                    serde_json::Value::from(String::from_utf8_lossy(v).into_owned())
                }
                rusqlite::types::ValueRef::Blob(v) => serde_json::Value::from(hex::encode(v)),
            };
            map.insert(name.clone(), value);
        }
        out.push(map);
    }
    Ok(out)
}
