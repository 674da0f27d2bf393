//! 共享數據類型定義
//!
//! 本模塊定義審計節點中各個子系統共享的數據結構

use serde::{Deserialize, Serialize};
use std::fmt;

/// 審計請求狀態碼
///
/// 事件池狀態機的四個狀態，持久化為兩字母字符串
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// 已分配（assigned）：請求已被本節點認領，等待本地分析
    #[serde(rename = "AS")]
    Assigned,

    /// 待提交（to be submitted）：分析完成，報告等待上鏈
    #[serde(rename = "TS")]
    ToBeSubmitted,

    /// 已完成（done）：賬本已確認報告提交
    #[serde(rename = "DN")]
    Done,

    /// 出錯（error）：終態，不再重試
    #[serde(rename = "ER")]
    Error,
}

impl EventStatus {
    /// 返回持久化到數據庫的兩字母狀態碼
    pub fn as_code(&self) -> &'static str {
        match self {
            EventStatus::Assigned => "AS",
            EventStatus::ToBeSubmitted => "TS",
            EventStatus::Done => "DN",
            EventStatus::Error => "ER",
        }
    }

    /// 從狀態碼解析
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AS" => Some(EventStatus::Assigned),
            "TS" => Some(EventStatus::ToBeSubmitted),
            "DN" => Some(EventStatus::Done),
            "ER" => Some(EventStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// 請求類型
///
/// AU = 普通審計請求；PO = 警察複核（police check）請求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// 普通審計請求
    #[serde(rename = "AU")]
    Audit,

    /// 警察複核請求：重新審計他人已提交的報告並投票
    #[serde(rename = "PO")]
    Police,
}

impl RequestKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            RequestKind::Audit => "AU",
            RequestKind::Police => "PO",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AU" => Some(RequestKind::Audit),
            "PO" => Some(RequestKind::Police),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// 審計結論狀態
///
/// 寫入報告並提交賬本的最終判定值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuditVerdict {
    /// 所有分析器成功完成
    Success,
    /// 至少一個分析器失敗或超時
    Error,
}

/// 審計成功的鏈上編碼值
pub const AUDIT_STATE_SUCCESS: u8 = 4;

/// 審計失敗的鏈上編碼值
pub const AUDIT_STATE_ERROR: u8 = 5;

impl From<AuditVerdict> for u8 {
    fn from(v: AuditVerdict) -> u8 {
        match v {
            AuditVerdict::Success => AUDIT_STATE_SUCCESS,
            AuditVerdict::Error => AUDIT_STATE_ERROR,
        }
    }
}

impl TryFrom<u8> for AuditVerdict {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            AUDIT_STATE_SUCCESS => Ok(AuditVerdict::Success),
            AUDIT_STATE_ERROR => Ok(AuditVerdict::Error),
            other => Err(format!("unknown audit state: {}", other)),
        }
    }
}

/// 賬本側的請求可用性狀態
///
/// 由賬本的只讀視圖返回，決定節點是否出價認領
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAvailability {
    /// 有請求可認領
    Ready,
    /// 節點質押不足，無法認領
    Understaked,
    /// 無可用請求或其他狀態
    Unavailable(u8),
}

impl RequestAvailability {
    /// 從賬本返回的數值狀態解析
    pub fn from_ledger_state(state: u8) -> Self {
        match state {
            1 => RequestAvailability::Ready,
            5 => RequestAvailability::Understaked,
            other => RequestAvailability::Unavailable(other),
        }
    }
}

/// 賬本分配給本節點的一個審計請求
///
/// 由認領交易或警察輪詢返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// 請求 ID（賬本內唯一）
    pub request_id: u64,

    /// 發起審計請求的賬戶地址
    pub requestor: String,

    /// 待審計合約的 URI
    pub contract_uri: String,

    /// 產生本次分配的賬本事件名，用於排障
    pub event_name: String,

    /// 請求進入賬本時的區塊高度
    pub assigned_block_number: u64,

    /// 請求出價（基礎計價單位）
    pub price: u64,

    /// 請求類型
    pub kind: RequestKind,
}

/// 事件池中的一條審計事件記錄
///
/// 與 audit_evt 表的一行一一對應
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 請求 ID，表主鍵
    pub request_id: u64,

    /// 發起請求的賬戶地址
    pub requestor: String,

    /// 請求類型
    pub kind: RequestKind,

    /// 當前狀態
    pub status: EventStatus,

    /// 待審計合約的 URI
    pub contract_uri: String,

    /// 產生本次分配的賬本事件名
    pub event_name: String,

    /// 請求被分配時的區塊高度，用於過期判定
    pub assigned_block_number: u64,

    /// 請求出價（基礎計價單位）
    pub price: u64,

    /// 本地分析得出的判定（分析完成後填充）
    pub audit_state: Option<u8>,

    /// 完整報告的 JSON 文本（分析完成後填充）
    pub full_report: Option<String>,

    /// 壓縮後報告的十六進制編碼（分析完成後填充）
    pub compressed_report: Option<String>,

    /// 報告的 Keccak-256 內容哈希（十六進制）
    pub report_hash: Option<String>,

    /// 完整報告是否已落庫
    pub is_persisted: bool,

    /// 完整報告的外部 URI（上傳成功後填充）
    pub audit_uri: Option<String>,

    /// 提交成功時的交易哈希
    pub tx_hash: Option<String>,

    /// 已嘗試提交的次數
    pub submission_attempts: u32,

    /// 人類可讀的狀態說明，用於排障
    pub status_info: Option<String>,
}

/// 分析器的單次執行結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerReport {
    /// 分析器名稱
    pub analyzer: String,

    /// 執行結果："success" / "error" / "timeout"
    pub status: String,

    /// 分析器自身輸出的 JSON 報告（成功時）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<serde_json::Value>,

    /// 失敗原因（失敗或超時時）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,

    /// 執行開始時間（RFC 3339）
    pub start_time: String,

    /// 執行結束時間（RFC 3339）
    pub end_time: String,

    /// `metadata` 入口返回的工具自描述（版本、啟用的檢查項等），
    /// 展平進條目本身，失敗的條目同樣攜帶
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// 聚合後的完整審計報告
///
/// 序列化為規範 JSON 後壓縮提交
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullReport {
    /// 報告格式版本
    pub version: String,

    /// 請求 ID
    pub request_id: u64,

    /// 發起請求的賬戶地址
    pub requestor: String,

    /// 被審計合約的 URI
    pub contract_uri: String,

    /// 合約源碼的 Keccak-256 哈希（十六進制）
    pub contract_hash: String,

    /// 審計節點賬戶地址
    pub auditor: String,

    /// 報告生成時間（RFC 3339）
    pub timestamp: String,

    /// 分析開始時間（RFC 3339）
    pub start_time: String,

    /// 分析結束時間（RFC 3339）
    pub end_time: String,

    /// 整體結果："success" / "error"，與 audit_state 一致
    pub status: String,

    /// 最終判定（4=成功, 5=失敗）
    pub audit_state: u8,

    /// 各分析器的獨立報告
    pub analyzers_reports: Vec<serde_json::Value>,
}
