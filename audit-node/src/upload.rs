//! 完整報告上傳
//!
//! 鏈上只存壓縮摘要，完整報告另行上傳到外部存儲供人工查閱。
//! 上傳是盡力而為的旁路：provider 從不返回 Err，失敗只體現在
//! [`UploadOutcome`] 裡，絕不阻斷報告提交。

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// 上傳被禁用時寫入事件的佔位 URI
pub const UPLOAD_DISABLED_URI: &str = "Not available. Full report was not uploaded";

/// 一次上傳的結果
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// 上傳是否成功
    pub success: bool,
    /// 成功時報告的公開 URL
    pub url: Option<String>,
    /// 失敗時的原因描述
    pub provider_error: Option<String>,
}

impl UploadOutcome {
    fn ok(url: String) -> Self {
        Self {
            success: true,
            url: Some(url),
            provider_error: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            success: false,
            url: None,
            provider_error: Some(reason),
        }
    }
}

/// 報告上傳接口
#[async_trait]
pub trait UploadProvider: Send + Sync {
    /// 上傳一份完整報告
    ///
    /// # 參數
    ///
    /// * `report_hash` - 報告內容哈希，用作存儲鍵
    /// * `body` - 報告的 JSON 字節
    async fn upload_report(&self, report_hash: &str, body: &[u8]) -> UploadOutcome;

    /// 上傳被審計的合約源碼，與報告放在同一存儲下便於對照
    ///
    /// # 參數
    ///
    /// * `request_id` - 所屬審計請求
    /// * `file_name` - 合約原始文件名
    /// * `body` - 合約源碼字節
    async fn upload_contract(&self, request_id: u64, file_name: &str, body: &[u8])
        -> UploadOutcome;
}

/// HTTP PUT 上傳
///
/// 報告存放於 `{base}/{account}/{hash}.json`
pub struct HttpUploadProvider {
    http_client: reqwest::Client,
    base_url: String,
    account: String,
}

impl HttpUploadProvider {
    pub fn new(base_url: &str, account: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account: account.to_string(),
        })
    }

    async fn put(&self, url: &str, content_type: &str, body: &[u8]) -> UploadOutcome {
        match self
            .http_client
            .put(url)
            .header("content-type", content_type)
            .body(body.to_vec())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, "upload finished");
                UploadOutcome::ok(url.to_string())
            }
            Ok(resp) => {
                warn!(url = %url, status = %resp.status(), "upload rejected");
                UploadOutcome::failed(format!("HTTP {}", resp.status()))
            }
            Err(e) => {
                warn!(url = %url, "upload failed: {}", e);
                UploadOutcome::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl UploadProvider for HttpUploadProvider {
    async fn upload_report(&self, report_hash: &str, body: &[u8]) -> UploadOutcome {
        let url = format!("{}/{}/{}.json", self.base_url, self.account, report_hash);
        self.put(&url, "application/json", body).await
    }

    async fn upload_contract(
        &self,
        request_id: u64,
        file_name: &str,
        body: &[u8],
    ) -> UploadOutcome {
        let url = format!(
            "{}/{}/contracts/{}/{}",
            self.base_url, self.account, request_id, file_name
        );
        self.put(&url, "application/octet-stream", body).await
    }
}

/// 禁用上傳時的空實現
pub struct NullUploadProvider;

#[async_trait]
impl UploadProvider for NullUploadProvider {
    async fn upload_report(&self, _report_hash: &str, _body: &[u8]) -> UploadOutcome {
        UploadOutcome::failed("upload disabled".to_string())
    }

    async fn upload_contract(
        &self,
        _request_id: u64,
        _file_name: &str,
        _body: &[u8],
    ) -> UploadOutcome {
        UploadOutcome::failed("upload disabled".to_string())
    }
}
