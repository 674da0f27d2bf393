//! 報告聚合器
//!
//! 對單個審計請求執行完整的本地分析流程：
//!
//! 1. 按 URI 取回合約源碼，落盤到本節點的儲存目錄
//! 2. 併發調度全部已配置的分析器沙箱
//! 3. 將各分析器的成敗彙總為一份完整報告並給出最終判定
//!
//! 單個分析器的失敗或超時只體現為它自己的錯誤條目，絕不中斷
//! 其餘分析器，整體判定由全部條目共同決定。

use crate::error::{NodeError, Result};
use crate::types::{AnalyzerReport, AuditVerdict, FullReport};
use crate::wrapper::AnalyzerWrapper;
use sha3::{Digest, Keccak256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 報告格式版本
const REPORT_VERSION: &str = "2.0.0";

/// 報告聚合器
pub struct ReportAggregator {
    wrappers: Vec<AnalyzerWrapper>,
    storage_dir: PathBuf,
    http_client: reqwest::Client,
    auditor_account: String,
}

impl ReportAggregator {
    pub fn new(
        wrappers: Vec<AnalyzerWrapper>,
        storage_dir: &Path,
        http_client: reqwest::Client,
        auditor_account: &str,
    ) -> Self {
        Self {
            wrappers,
            storage_dir: storage_dir.to_path_buf(),
            http_client,
            auditor_account: auditor_account.to_string(),
        }
    }

    pub fn analyzer_count(&self) -> usize {
        self.wrappers.len()
    }

    /// 已落盤合約的路徑，審計結束後文件仍然保留
    pub fn staged_contract_path(&self, request_id: u64, contract_uri: &str) -> PathBuf {
        self.storage_dir
            .join(format!("req-{}", request_id))
            .join(contract_file_name(contract_uri))
    }

    /// 對一個請求執行完整審計，返回聚合報告
    ///
    /// 合約無法取回是整個請求級別的失敗，直接報錯；此後任何
    /// 單個分析器的問題都只降級為報告中的錯誤條目。
    pub async fn audit(
        &self,
        request_id: u64,
        requestor: &str,
        contract_uri: &str,
    ) -> Result<FullReport> {
        let start_time = chrono::Utc::now();
        let source = self.fetch_contract(contract_uri).await?;
        let contract_hash = hex::encode(Keccak256::digest(&source));

        let file_name = contract_file_name(contract_uri);
        let contract_dir = self.storage_dir.join(format!("req-{}", request_id));
        tokio::fs::create_dir_all(&contract_dir).await?;
        let contract_path = contract_dir.join(&file_name);
        tokio::fs::write(&contract_path, &source).await?;
        debug!(request_id, uri = contract_uri, "contract staged for analysis");

        // 所有分析器併發執行，互不等待也互不拖累
        let mut tasks = Vec::with_capacity(self.wrappers.len());
        for wrapper in &self.wrappers {
            let name = wrapper.name().to_string();
            let wrapper = wrapper.clone();
            let path = contract_path.clone();
            let original = file_name.clone();
            let task = tokio::spawn(async move {
                let started = chrono::Utc::now();
                let metadata = wrapper.get_metadata(&path, &original).await;
                let result = wrapper.check(&path, &original).await;
                (metadata, started, result)
            });
            tasks.push((name, task));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let entry = match task.await {
                Ok((metadata, started, result)) => {
                    analyzer_entry(&name, metadata, started, result)
                }
                // 崩潰的任務也只折損自己的條目
                Err(e) => analyzer_entry(
                    &name,
                    serde_json::json!({ "name": name.clone() }),
                    chrono::Utc::now(),
                    Err(NodeError::Analyzer(format!(
                        "analyzer task panicked: {}",
                        e
                    ))),
                ),
            };
            reports.push(entry);
        }

        let verdict = derive_verdict(&reports);
        info!(
            request_id,
            audit_state = u8::from(verdict),
            analyzers = reports.len(),
            "audit complete"
        );

        let end_time = chrono::Utc::now();
        Ok(FullReport {
            version: REPORT_VERSION.to_string(),
            request_id,
            requestor: requestor.to_string(),
            contract_uri: contract_uri.to_string(),
            contract_hash,
            auditor: self.auditor_account.clone(),
            timestamp: end_time.to_rfc3339(),
            start_time: start_time.to_rfc3339(),
            end_time: end_time.to_rfc3339(),
            status: match verdict {
                AuditVerdict::Success => "success".to_string(),
                AuditVerdict::Error => "error".to_string(),
            },
            audit_state: verdict.into(),
            analyzers_reports: reports
                .into_iter()
                .map(|r| serde_json::to_value(r))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        })
    }

    /// 取回合約源碼
    ///
    /// 支持 `file://` 本地路徑與 `http(s)://` 遠端地址
    async fn fetch_contract(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(tokio::fs::read(path).await.map_err(|e| {
                NodeError::Analyzer(format!("cannot read contract {}: {}", uri, e))
            })?);
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let resp = self
                .http_client
                .get(uri)
                .send()
                .await
                .map_err(|e| NodeError::Analyzer(format!("contract fetch failed: {}", e)))?;
            if !resp.status().is_success() {
                return Err(NodeError::Analyzer(format!(
                    "contract fetch failed: HTTP {} for {}",
                    resp.status(),
                    uri
                )));
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| NodeError::Analyzer(format!("contract fetch failed: {}", e)))?;
            return Ok(body.to_vec());
        }
        Err(NodeError::Analyzer(format!(
            "unsupported contract URI scheme: {}",
            uri
        )))
    }
}

/// 從 URI 提取用於落盤的文件名
fn contract_file_name(uri: &str) -> String {
    uri.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("contract.sol")
        .to_string()
}

/// 把單個分析器的執行結果折成報告條目
///
/// 成功與失敗的條目都攜帶 `metadata` 入口取回的工具自描述。
fn analyzer_entry(
    name: &str,
    metadata: serde_json::Value,
    started: chrono::DateTime<chrono::Utc>,
    result: Result<crate::wrapper::RunOutcome>,
) -> AnalyzerReport {
    let start_time = started.to_rfc3339();
    let end_time = chrono::Utc::now().to_rfc3339();
    let metadata = match metadata {
        serde_json::Value::Object(map) => map,
        other => {
            warn!(analyzer = name, "non-object metadata discarded: {}", other);
            let mut map = serde_json::Map::new();
            map.insert("name".to_string(), serde_json::Value::from(name));
            map
        }
    };
    match result {
        Ok(outcome) => AnalyzerReport {
            analyzer: name.to_string(),
            status: "success".to_string(),
            report: Some(outcome.output),
            errors: None,
            start_time,
            end_time,
            metadata,
        },
        Err(e) => {
            warn!(analyzer = name, "analyzer failed: {}", e);
            let status = if e.to_string().contains("timed out") {
                "timeout"
            } else {
                "error"
            };
            AnalyzerReport {
                analyzer: name.to_string(),
                status: status.to_string(),
                report: None,
                errors: Some(vec![e.to_string()]),
                start_time,
                end_time,
                metadata,
            }
        }
    }
}

/// 由各分析器條目推導整體判定
///
/// 全部成功才算成功；沒有任何分析器也按失敗處理
fn derive_verdict(reports: &[AnalyzerReport]) -> AuditVerdict {
    if !reports.is_empty() && reports.iter().all(|r| r.status == "success") {
        AuditVerdict::Success
    } else {
        AuditVerdict::Error
    }
}
