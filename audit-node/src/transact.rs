//! 交易執行器
//!
//! 所有改變賬本狀態的調用都經由 [`execute_transaction`] 統一執行。
//! 執行器把失敗歸入四個封閉類別，並按類別選擇日誌級別：
//! 預期內的失敗（超時 / 重複 / 被叔塊擠掉）記 debug，真正的
//! 異常記 error。分類結果原樣向上傳播，由調用方決定如何處置。

use std::future::Future;
use thiserror::Error;
use tracing::{debug, error};

/// 交易失敗的封閉分類
#[derive(Error, Debug)]
pub enum TransactionError {
    /// 交易在確認窗口內未被打包
    #[error("Transaction timed out: {0}")]
    Timeout(String),

    /// 相同交易已在鏈上（nonce 或內容重複）
    #[error("Duplicate transaction: {0}")]
    Duplicate(String),

    /// 交易曾被打包但所在區塊被叔塊化
    #[error("Transaction uncled: {0}")]
    Uncled(String),

    /// 其他所有失敗
    #[error("Transaction failed: {0}")]
    Other(String),
}

impl TransactionError {
    /// 該失敗是否屬於預期內、可按常規節奏重試的類別
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransactionError::Timeout(_)
                | TransactionError::Duplicate(_)
                | TransactionError::Uncled(_)
        )
    }
}

/// 執行一筆賬本交易
///
/// # 參數
///
/// * `description` - 交易的人類可讀描述，用於日誌
/// * `sender` - 發送方賬戶地址
/// * `call` - 實際發起交易的異步閉包
///
/// # 返回
///
/// 交易成功時返回閉包的結果；失敗時按類別記日誌後原樣傳播。
pub async fn execute_transaction<T, F, Fut>(
    description: &str,
    sender: &str,
    call: F,
) -> Result<T, TransactionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, TransactionError>>,
{
    debug!(tx = description, sender, "executing transaction");
    match call().await {
        Ok(value) => {
            debug!(tx = description, "transaction confirmed");
            Ok(value)
        }
        Err(e) => {
            match &e {
                TransactionError::Timeout(msg) => {
                    debug!(tx = description, sender, "transaction timed out: {}", msg);
                }
                TransactionError::Duplicate(msg) => {
                    debug!(tx = description, sender, "duplicate transaction: {}", msg);
                }
                TransactionError::Uncled(msg) => {
                    debug!(tx = description, sender, "transaction uncled: {}", msg);
                }
                TransactionError::Other(msg) => {
                    error!(tx = description, sender, "transaction failed: {}", msg);
                }
            }
            Err(e)
        }
    }
}
