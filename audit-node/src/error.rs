//! 審計節點統一錯誤類型定義
//!
//! 本模塊定義了審計節點運行過程中可能遇到的所有錯誤類型，
//! 使用 thiserror crate 提供良好的錯誤鏈和上下文信息。

use crate::store::StoreError;
use crate::transact::TransactionError;
use thiserror::Error;

/// 審計節點錯誤類型
///
/// 涵蓋所有子系統的錯誤情況：
/// - 配置加載與驗證
/// - 本地事件池持久化
/// - 分析器沙箱執行
/// - 賬本交互與交易執行
#[derive(Error, Debug)]
pub enum NodeError {
    /// 配置錯誤
    ///
    /// 當配置文件格式錯誤、缺少必要參數，或分析器入口腳本
    /// 不存在/不可執行時返回此錯誤。配置錯誤在啟動階段是致命的。
    #[error("Configuration error: {0}")]
    Config(String),

    /// 節點重複啟動
    ///
    /// 在同一個節點實例上第二次調用 `run()` 時返回此錯誤。
    /// 這屬於調用方契約違反，而非暫時性故障。
    #[error("Audit node is already running")]
    AlreadyRunning,

    /// 本地數據庫錯誤
    ///
    /// 由序列化存儲的工作線程返回
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 分析器執行錯誤
    ///
    /// 當分析器子進程無法啟動或輸出無法解析時返回此錯誤
    #[error("Analyzer error: {0}")]
    Analyzer(String),

    /// 賬本讀取錯誤
    ///
    /// 當只讀的賬本視圖調用失敗時返回此錯誤
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// 交易執行錯誤
    ///
    /// 保留交易執行器的分類（超時 / 重複 / 被叔塊化 / 其他），
    /// 供調用方逐類匹配後決定重試或傳播
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// HTTP 請求錯誤
    ///
    /// 當向賬本網關發送 HTTP 請求失敗時返回此錯誤
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// 序列化/反序列化錯誤
    ///
    /// 當 JSON 編解碼或報告壓縮失敗時返回此錯誤
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O 錯誤
    ///
    /// 當文件操作或網絡 I/O 失敗時返回此錯誤
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 通用錯誤
    ///
    /// 用於包裝其他未分類的錯誤
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 類型別名
///
/// 使用統一的錯誤類型簡化函數簽名
pub type Result<T> = std::result::Result<T, NodeError>;

/// 從 JSON 錯誤轉換
impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}
