//! 賬本客戶端
//!
//! 審計市場合約部署在外部賬本上，節點通過一個 HTTP 網關與其
//! 交互。本模塊定義 [`LedgerClient`] trait 作為節點與賬本之間的
//! 唯一接縫：只讀視圖返回 [`NodeError`]，改變賬本狀態的調用返回
//! 交易執行器的分類錯誤。集成測試以內存假實現替換整個 trait。
//!
//! # API 端點
//!
//! 基於審計市場網關的 HTTP API:
//! - `GET /v1/view/...` - 合約只讀視圖
//! - `POST /v1/tx/...` - 發起並等待確認交易

use crate::error::{NodeError, Result};
use crate::transact::TransactionError;
use crate::types::Assignment;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 默認超時（秒）
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 賬本客戶端接口
///
/// 節點的全部賬本交互都經由此 trait
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// 本節點的賬戶地址
    fn account(&self) -> &str;

    /// 當前區塊高度
    async fn block_number(&self) -> Result<u64>;

    /// 是否有請求可供認領，返回賬本的數值狀態碼
    async fn any_request_available(&self) -> Result<u8>;

    /// 本節點當前已認領且未了結的請求數
    async fn assigned_request_count(&self) -> Result<u64>;

    /// 合約允許的單節點最大在途請求數
    async fn get_max_assigned_requests(&self) -> Result<u64>;

    /// 全網當前最低審計報價
    async fn get_min_audit_price(&self) -> Result<u64>;

    /// 讀取某請求已提交的壓縮報告（十六進制）
    async fn get_report(&self, request_id: u64) -> Result<String>;

    /// 某請求是否已被最終了結
    async fn is_audit_finished(&self, request_id: u64) -> Result<bool>;

    /// 本節點是否具有警察身份
    async fn is_police_node(&self) -> Result<bool>;

    /// 下一個待複核的警察任務，無任務時為 None
    async fn get_next_police_assignment(&self) -> Result<Option<Assignment>>;

    /// 最近若干個區塊的 gas 價格樣本，新的在前
    async fn recent_gas_prices(&self, max_blocks: u64) -> Result<Vec<u64>>;

    /// 認領下一個可用請求
    async fn claim_next_request(
        &self,
        price: u64,
        gas_price: u64,
    ) -> std::result::Result<Assignment, TransactionError>;

    /// 更新本節點的公開報價，返回交易哈希
    async fn set_audit_node_price(
        &self,
        price: u64,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError>;

    /// 提交審計報告，返回交易哈希
    async fn submit_audit_report(
        &self,
        request_id: u64,
        audit_state: u8,
        compressed_report: &str,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError>;

    /// 提交警察複核結論，返回交易哈希
    async fn submit_police_report(
        &self,
        request_id: u64,
        compressed_report: &str,
        is_verified: bool,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError>;
}

/// 網關返回的交易錯誤體
#[derive(Deserialize, Debug)]
struct TxErrorBody {
    category: String,
    message: String,
}

/// 網關返回的交易回執
#[derive(Deserialize, Debug)]
struct TxReceipt {
    tx_hash: String,
}

/// HTTP 賬本網關客戶端
///
/// 封裝與審計市場網關的所有 HTTP 交互
pub struct HttpLedgerClient {
    http_client: Client,
    base_url: String,
    account: String,
}

impl HttpLedgerClient {
    /// 創建新的網關客戶端
    ///
    /// # 參數
    /// - `base_url`: 網關 API 基礎 URL
    /// - `account`: 本節點賬戶地址
    pub fn new(base_url: &str, account: &str, timeout_secs: Option<u64>) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Ledger(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account: account.to_string(),
        })
    }

    async fn view<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/v1/view/{}", self.base_url, path);
        debug!(url = %url, "ledger view call");
        let resp = self
            .http_client
            .get(&url)
            .query(&[("account", self.account.as_str())])
            .send()
            .await
            .map_err(|e| NodeError::Ledger(format!("view {} failed: {}", path, e)))?;
        if !resp.status().is_success() {
            return Err(NodeError::Ledger(format!(
                "view {} returned HTTP {}",
                path,
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| NodeError::Ledger(format!("view {} unparsable: {}", path, e)))
    }

    async fn transact<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> std::result::Result<T, TransactionError> {
        let url = format!("{}/v1/tx/{}", self.base_url, path);
        debug!(url = %url, "ledger transaction call");
        let resp = self
            .http_client
            .post(&url)
            .query(&[("account", self.account.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransactionError::Timeout(format!("tx {}: {}", path, e))
                } else {
                    TransactionError::Other(format!("tx {}: {}", path, e))
                }
            })?;
        if resp.status().is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| TransactionError::Other(format!("tx {} unparsable: {}", path, e)));
        }
        // 網關在錯誤體裡攜帶交易失敗分類
        let status = resp.status();
        match resp.json::<TxErrorBody>().await {
            Ok(body) => Err(classify_tx_error(&body)),
            Err(_) => Err(TransactionError::Other(format!(
                "tx {} returned HTTP {}",
                path, status
            ))),
        }
    }
}

fn classify_tx_error(body: &TxErrorBody) -> TransactionError {
    match body.category.as_str() {
        "timeout" => TransactionError::Timeout(body.message.clone()),
        "duplicate" => TransactionError::Duplicate(body.message.clone()),
        "uncled" => TransactionError::Uncled(body.message.clone()),
        _ => TransactionError::Other(body.message.clone()),
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn account(&self) -> &str {
        &self.account
    }

    async fn block_number(&self) -> Result<u64> {
        self.view("block-number").await
    }

    async fn any_request_available(&self) -> Result<u8> {
        self.view("any-request-available").await
    }

    async fn assigned_request_count(&self) -> Result<u64> {
        self.view("assigned-request-count").await
    }

    async fn get_max_assigned_requests(&self) -> Result<u64> {
        self.view("max-assigned-requests").await
    }

    async fn get_min_audit_price(&self) -> Result<u64> {
        self.view("min-audit-price").await
    }

    async fn get_report(&self, request_id: u64) -> Result<String> {
        self.view(&format!("report/{}", request_id)).await
    }

    async fn is_audit_finished(&self, request_id: u64) -> Result<bool> {
        self.view(&format!("audit-finished/{}", request_id)).await
    }

    async fn is_police_node(&self) -> Result<bool> {
        self.view("is-police-node").await
    }

    async fn get_next_police_assignment(&self) -> Result<Option<Assignment>> {
        self.view("next-police-assignment").await
    }

    async fn recent_gas_prices(&self, max_blocks: u64) -> Result<Vec<u64>> {
        self.view(&format!("gas-prices/{}", max_blocks)).await
    }

    async fn claim_next_request(
        &self,
        price: u64,
        gas_price: u64,
    ) -> std::result::Result<Assignment, TransactionError> {
        self.transact(
            "claim-next-request",
            &serde_json::json!({ "price": price, "gas_price": gas_price }),
        )
        .await
    }

    async fn set_audit_node_price(
        &self,
        price: u64,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError> {
        let receipt: TxReceipt = self
            .transact(
                "set-audit-node-price",
                &serde_json::json!({ "price": price, "gas_price": gas_price }),
            )
            .await?;
        Ok(receipt.tx_hash)
    }

    async fn submit_audit_report(
        &self,
        request_id: u64,
        audit_state: u8,
        compressed_report: &str,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError> {
        let receipt: TxReceipt = self
            .transact(
                "submit-audit-report",
                &serde_json::json!({
                    "request_id": request_id,
                    "audit_state": audit_state,
                    "compressed_report": compressed_report,
                    "gas_price": gas_price,
                }),
            )
            .await?;
        Ok(receipt.tx_hash)
    }

    async fn submit_police_report(
        &self,
        request_id: u64,
        compressed_report: &str,
        is_verified: bool,
        gas_price: u64,
    ) -> std::result::Result<String, TransactionError> {
        let receipt: TxReceipt = self
            .transact(
                "submit-police-report",
                &serde_json::json!({
                    "request_id": request_id,
                    "compressed_report": compressed_report,
                    "is_verified": is_verified,
                    "gas_price": gas_price,
                }),
            )
            .await?;
        Ok(receipt.tx_hash)
    }
}
