//! 審計事件池
//!
//! 事件池是節點的本地持久化狀態機，記錄每個已認領請求的生命週期：
//!
//! ```text
//! AS (已分配) ──► TS (待提交) ──► DN (已完成)
//!     │               │
//!     └───────────────┴─────────► ER (出錯，終態)
//! ```
//!
//! 所有讀寫都經由序列化存儲排隊，池自身不持有任何額外的鎖。
//! 節點崩潰重啟後，池中未走完的事件會被對應的輪詢循環重新拾起。

use crate::error::{NodeError, Result};
use crate::store::{Param, Row, ScriptErrorPolicy, SerializedStore, StoreError};
use crate::types::{Assignment, AuditEvent, EventStatus, RequestKind};
use std::sync::Arc;
use tracing::{debug, warn};

/// 建表腳本
///
/// evt_status 是狀態碼的查找表，audit_evt 每行經外鍵引用它。
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS evt_status (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL
);

INSERT OR IGNORE INTO evt_status (id, description) VALUES
    ('AS', 'Assigned, waiting for local audit'),
    ('TS', 'Audited, report to be submitted'),
    ('DN', 'Done, report confirmed by the ledger'),
    ('ER', 'Error, terminal state');

CREATE TABLE IF NOT EXISTS audit_evt (
    request_id INTEGER PRIMARY KEY,
    requestor TEXT NOT NULL,
    kind TEXT NOT NULL,
    fk_status TEXT NOT NULL REFERENCES evt_status(id),
    contract_uri TEXT NOT NULL,
    event_name TEXT NOT NULL,
    assigned_block_number INTEGER NOT NULL,
    price INTEGER NOT NULL,
    audit_state INTEGER,
    full_report TEXT,
    compressed_report TEXT,
    report_hash TEXT,
    is_persisted INTEGER NOT NULL DEFAULT 0,
    audit_uri TEXT,
    tx_hash TEXT,
    submission_attempts INTEGER NOT NULL DEFAULT 0,
    status_info TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_evt_status ON audit_evt(fk_status);
";

/// 審計事件池
pub struct EventPool {
    store: Arc<SerializedStore>,
}

impl EventPool {
    /// 在給定存儲上初始化事件池，建表冪等
    pub fn new(store: Arc<SerializedStore>) -> Result<Self> {
        store.execute_script(SCHEMA, ScriptErrorPolicy::Propagate)?;
        Ok(Self { store })
    }

    /// 記錄一個新認領的請求，初始狀態 AS
    ///
    /// 主鍵衝突（同一請求被重複認領）不視為錯誤，降級為警告並
    /// 返回 Ok(false)；首次插入返回 Ok(true)。
    pub fn add_event(&self, assignment: &Assignment) -> Result<bool> {
        let result = self.store.execute(
            "INSERT INTO audit_evt \
             (request_id, requestor, kind, fk_status, contract_uri, event_name, \
              assigned_block_number, price) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            &[
                Param::from(assignment.request_id),
                Param::from(assignment.requestor.as_str()),
                Param::from(assignment.kind.as_code()),
                Param::from(EventStatus::Assigned.as_code()),
                Param::from(assignment.contract_uri.as_str()),
                Param::from(assignment.event_name.as_str()),
                Param::from(assignment.assigned_block_number),
                Param::from(assignment.price),
            ],
        );
        match result {
            Ok(_) => {
                debug!(request_id = assignment.request_id, "event added to pool");
                Ok(true)
            }
            Err(StoreError::Constraint(msg)) => {
                warn!(
                    request_id = assignment.request_id,
                    "duplicate event ignored: {}", msg
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 按請求 ID 查詢單個事件
    pub fn get(&self, request_id: u64) -> Result<Option<AuditEvent>> {
        let rows = self.store.execute(
            "SELECT * FROM audit_evt WHERE request_id = ?1",
            &[Param::from(request_id)],
        )?;
        rows.first().map(row_to_event).transpose()
    }

    /// 所有處於 AS 狀態、等待本地分析的事件
    pub fn events_to_be_processed(&self) -> Result<Vec<AuditEvent>> {
        self.events_with_status(EventStatus::Assigned)
    }

    /// 所有處於 TS 狀態、等待提交的事件
    pub fn events_to_be_submitted(&self) -> Result<Vec<AuditEvent>> {
        self.events_with_status(EventStatus::ToBeSubmitted)
    }

    fn events_with_status(&self, status: EventStatus) -> Result<Vec<AuditEvent>> {
        let rows = self.store.execute(
            "SELECT * FROM audit_evt WHERE fk_status = ?1 ORDER BY request_id",
            &[Param::from(status.as_code())],
        )?;
        rows.iter().map(row_to_event).collect()
    }

    /// AS → TS：本地分析完成，落庫判定、完整報告與壓縮報告
    pub fn set_to_be_submitted(
        &self,
        request_id: u64,
        audit_state: u8,
        full_report: &str,
        compressed_report: &str,
        report_hash: &str,
    ) -> Result<()> {
        self.store.execute(
            "UPDATE audit_evt SET fk_status = ?1, audit_state = ?2, full_report = ?3, \
             compressed_report = ?4, report_hash = ?5, is_persisted = 1 \
             WHERE request_id = ?6 AND fk_status = ?7",
            &[
                Param::from(EventStatus::ToBeSubmitted.as_code()),
                Param::from(audit_state as u32),
                Param::from(full_report),
                Param::from(compressed_report),
                Param::from(report_hash),
                Param::from(request_id),
                Param::from(EventStatus::Assigned.as_code()),
            ],
        )?;
        debug!(request_id, audit_state, "event moved to TS");
        Ok(())
    }

    /// TS → DN：賬本確認報告已提交，記錄交易哈希
    pub fn set_done(&self, request_id: u64, tx_hash: &str, status_info: &str) -> Result<()> {
        self.store.execute(
            "UPDATE audit_evt SET fk_status = ?1, tx_hash = ?2, status_info = ?3 \
             WHERE request_id = ?4 AND fk_status = ?5",
            &[
                Param::from(EventStatus::Done.as_code()),
                Param::from(tx_hash),
                Param::from(status_info),
                Param::from(request_id),
                Param::from(EventStatus::ToBeSubmitted.as_code()),
            ],
        )?;
        debug!(request_id, "event moved to DN");
        Ok(())
    }

    /// AS / TS → ER：標記為終態錯誤
    ///
    /// DN 與 ER 都是終態，已完成的事件不會被改寫。
    pub fn set_error(&self, request_id: u64, status_info: &str) -> Result<()> {
        self.store.execute(
            "UPDATE audit_evt SET fk_status = ?1, status_info = ?2 \
             WHERE request_id = ?3 AND fk_status IN (?4, ?5)",
            &[
                Param::from(EventStatus::Error.as_code()),
                Param::from(status_info),
                Param::from(request_id),
                Param::from(EventStatus::Assigned.as_code()),
                Param::from(EventStatus::ToBeSubmitted.as_code()),
            ],
        )?;
        debug!(request_id, status_info, "event moved to ER");
        Ok(())
    }

    /// 記錄上傳得到的完整報告 URI
    pub fn set_audit_uri(&self, request_id: u64, audit_uri: &str) -> Result<()> {
        self.store.execute(
            "UPDATE audit_evt SET audit_uri = ?1 WHERE request_id = ?2",
            &[Param::from(audit_uri), Param::from(request_id)],
        )?;
        Ok(())
    }

    /// 遞增提交嘗試計數，返回遞增後的值
    pub fn record_submission_attempt(&self, request_id: u64) -> Result<u32> {
        self.store.execute(
            "UPDATE audit_evt SET submission_attempts = submission_attempts + 1 \
             WHERE request_id = ?1",
            &[Param::from(request_id)],
        )?;
        let rows = self.store.execute(
            "SELECT submission_attempts FROM audit_evt WHERE request_id = ?1",
            &[Param::from(request_id)],
        )?;
        let attempts = rows
            .first()
            .and_then(|r| r.get("submission_attempts"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| NodeError::Store(StoreError::Database(
                format!("unknown request {}", request_id),
            )))?;
        Ok(attempts as u32)
    }

    /// 將過期的未完成事件標記為 ER
    ///
    /// 分配區塊高度不晚於
    /// `current_block - timeout_limit_blocks + discard_blocks`
    /// 的 AS / TS 事件一律作廢。賬本在 timeout_limit_blocks 之後
    /// 就會拒收報告，discard_blocks 是為打包延遲預留的提前量。
    /// 返回被作廢的請求 ID 列表。
    pub fn timeout_stale_events(
        &self,
        current_block: u64,
        timeout_limit_blocks: u64,
        discard_blocks: u64,
    ) -> Result<Vec<u64>> {
        let threshold = current_block
            .saturating_sub(timeout_limit_blocks)
            .saturating_add(discard_blocks);
        let rows = self.store.execute(
            "SELECT request_id FROM audit_evt \
             WHERE fk_status IN ('AS', 'TS') AND assigned_block_number <= ?1",
            &[Param::from(threshold)],
        )?;
        let mut expired = Vec::new();
        for row in &rows {
            if let Some(id) = row.get("request_id").and_then(|v| v.as_u64()) {
                self.set_error(
                    id,
                    &format!("Submission timeout at block {}", current_block),
                )?;
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), current_block, "stale events expired");
        }
        Ok(expired)
    }
}

fn row_to_event(row: &Row) -> Result<AuditEvent> {
    let get_str = |key: &str| -> Option<String> {
        row.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    };
    let bad = |field: &str| {
        NodeError::Store(StoreError::Database(format!(
            "malformed audit_evt row: {}",
            field
        )))
    };
    let status_code = get_str("fk_status").ok_or_else(|| bad("fk_status"))?;
    let kind_code = get_str("kind").ok_or_else(|| bad("kind"))?;
    Ok(AuditEvent {
        request_id: row
            .get("request_id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| bad("request_id"))?,
        requestor: get_str("requestor").ok_or_else(|| bad("requestor"))?,
        kind: RequestKind::from_code(&kind_code).ok_or_else(|| bad("kind"))?,
        status: EventStatus::from_code(&status_code).ok_or_else(|| bad("fk_status"))?,
        contract_uri: get_str("contract_uri").ok_or_else(|| bad("contract_uri"))?,
        event_name: get_str("event_name").ok_or_else(|| bad("event_name"))?,
        assigned_block_number: row
            .get("assigned_block_number")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| bad("assigned_block_number"))?,
        price: row
            .get("price")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| bad("price"))?,
        audit_state: row
            .get("audit_state")
            .and_then(|v| v.as_u64())
            .map(|v| v as u8),
        full_report: get_str("full_report"),
        compressed_report: get_str("compressed_report"),
        report_hash: get_str("report_hash"),
        is_persisted: row
            .get("is_persisted")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            != 0,
        audit_uri: get_str("audit_uri"),
        tx_hash: get_str("tx_hash"),
        submission_attempts: row
            .get("submission_attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        status_info: get_str("status_info"),
    })
}
