//! 配置管理模塊
//!
//! 負責加載和驗證審計節點配置

use crate::error::{NodeError, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 單個分析器的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// 分析器名稱，同時用作日誌與報告條目的標識
    pub name: String,

    /// 封裝目錄路徑，內含 pull / metadata / run 三個入口腳本
    pub wrapper_home: String,

    /// 透傳給分析工具的附加參數
    #[serde(default)]
    pub args: String,

    /// 單次執行的牆鐘超時（秒）
    pub timeout_sec: u64,

    /// 覆蓋全局落盤目錄（可選）
    #[serde(default)]
    pub storage_dir: Option<String>,

    /// 啟動時是否執行 pull 預取鏡像
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_prefetch() -> bool {
    true
}

/// gas 價格策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPriceStrategy {
    /// 固定使用配置的默認值
    Static,
    /// 跟隨最近區塊的最高 gas 價格
    Dynamic,
}

/// 審計節點運行時配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 賬本網關基礎 URL
    pub ledger_gateway_url: String,

    /// 本節點賬戶地址
    pub account: String,

    /// 事件池 SQLite 數據庫路徑
    pub db_path: String,

    /// 合約源碼與中間產物的落盤目錄
    pub storage_dir: String,

    /// 本節點的最低接單報價（基礎計價單位）
    pub min_price: u64,

    /// 主輪詢間隔（秒）
    pub poll_interval_secs: u64,

    /// 已領取事件的處理間隔（秒）
    pub processing_interval_secs: u64,

    /// 待提交報告的提交間隔（秒）
    pub submission_interval_secs: u64,

    /// 報價同步間隔（秒）
    pub price_sync_interval_secs: u64,

    /// gas 價格刷新間隔（秒）
    pub gas_price_interval_secs: u64,

    /// 過期掃描間隔（秒）
    pub timeout_sweep_interval_secs: u64,

    /// 賬本拒收報告前允許的區塊數
    pub submission_timeout_limit_blocks: u64,

    /// 過期判定的提前量（區塊數）
    pub block_discard_on_restart: u64,

    /// gas 價格統計回看的區塊數
    pub gas_price_probe_blocks: u64,

    /// gas 價格策略
    pub gas_price_strategy: GasPriceStrategy,

    /// 靜態策略與空樣本時的默認 gas 價格
    pub default_gas_price: u64,

    /// 動態策略允許的 gas 價格上限
    pub gas_price_ceiling: u64,

    /// 本節點願意同時持有的已領取事件上限
    pub max_assigned_requests: u64,

    /// 同一事件的最大提交嘗試次數
    pub max_submission_attempts: u32,

    /// 併發處理事件數上限
    pub max_concurrent_audits: usize,

    /// HTTP 請求超時（秒）
    pub http_timeout_secs: u64,

    /// 是否將完整報告上傳到外部存儲
    pub enable_report_upload: bool,

    /// 報告上傳基礎 URL（啟用上傳時必填）
    pub report_upload_url: Option<String>,

    /// 是否啟用警察複核輪詢
    pub enable_police_checks: bool,

    /// 分析器列表
    pub analyzers: Vec<AnalyzerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ledger_gateway_url: "http://127.0.0.1:8545".to_string(),
            account: "0x0000000000000000000000000000000000000000".to_string(),
            db_path: "./audit-node.db".to_string(),
            storage_dir: "./storage".to_string(),
            min_price: 1,
            poll_interval_secs: 5,
            processing_interval_secs: 5,
            submission_interval_secs: 5,
            price_sync_interval_secs: 120,
            gas_price_interval_secs: 60,
            timeout_sweep_interval_secs: 30,
            submission_timeout_limit_blocks: 25,
            block_discard_on_restart: 2,
            gas_price_probe_blocks: 50,
            gas_price_strategy: GasPriceStrategy::Dynamic,
            default_gas_price: 1_000_000_000,
            gas_price_ceiling: 50_000_000_000,
            max_assigned_requests: 8,
            max_submission_attempts: 3,
            max_concurrent_audits: 4,
            http_timeout_secs: 30,
            enable_report_upload: false,
            report_upload_url: None,
            enable_police_checks: true,
            analyzers: Vec::new(),
        }
    }
}

/// 從配置文件加載節點配置
///
/// # 參數
/// - `config_path`: 配置文件路徑（支持 TOML、JSON、YAML）
///
/// # 示例
/// ```no_run
/// use audit_node::config::load_config;
///
/// let config = load_config("config.toml").expect("Failed to load config");
/// println!("Gateway: {}", config.ledger_gateway_url);
/// ```
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<NodeConfig> {
    let config = Config::builder()
        .add_source(File::from(config_path.as_ref()))
        .build()
        .map_err(|e| NodeError::Config(format!("Failed to load config file: {}", e)))?;

    let node_config: NodeConfig = config
        .try_deserialize()
        .map_err(|e| NodeError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&node_config)?;

    Ok(node_config)
}

/// 從環境變量加載配置（用於容器化部署）
///
/// 環境變量前綴: `AUDIT_NODE_`
/// 示例: `AUDIT_NODE_LEDGER_GATEWAY_URL`, `AUDIT_NODE_MIN_PRICE`
pub fn load_config_from_env() -> Result<NodeConfig> {
    let config = Config::builder()
        .add_source(config::Environment::with_prefix("AUDIT_NODE"))
        .build()
        .map_err(|e| NodeError::Config(format!("Failed to load env vars: {}", e)))?;

    let node_config: NodeConfig = config
        .try_deserialize()
        .map_err(|e| NodeError::Config(format!("Failed to parse env config: {}", e)))?;

    validate_config(&node_config)?;

    Ok(node_config)
}

/// 驗證配置的有效性
///
/// 檢查:
/// - URL 格式是否正確
/// - 超時與區塊窗口是否在允許範圍內
/// - 每個分析器的超時是否合法
pub fn validate_config(config: &NodeConfig) -> Result<()> {
    if !config.ledger_gateway_url.starts_with("http://")
        && !config.ledger_gateway_url.starts_with("https://")
    {
        return Err(NodeError::Config(format!(
            "Invalid ledger gateway URL: {}",
            config.ledger_gateway_url
        )));
    }

    if config.account.trim().is_empty() {
        return Err(NodeError::Config("account must not be empty".to_string()));
    }

    // 賬本側的確認窗口決定了合理區間
    if !(10..=120).contains(&config.submission_timeout_limit_blocks) {
        return Err(NodeError::Config(format!(
            "submission_timeout_limit_blocks must be within [10, 120], got {}",
            config.submission_timeout_limit_blocks
        )));
    }

    if config.block_discard_on_restart >= config.submission_timeout_limit_blocks {
        return Err(NodeError::Config(
            "block_discard_on_restart must be smaller than submission_timeout_limit_blocks"
                .to_string(),
        ));
    }

    if config.max_submission_attempts == 0 {
        return Err(NodeError::Config(
            "max_submission_attempts must be greater than 0".to_string(),
        ));
    }

    if config.max_concurrent_audits == 0 {
        return Err(NodeError::Config(
            "max_concurrent_audits must be greater than 0".to_string(),
        ));
    }

    if config.max_assigned_requests == 0 {
        return Err(NodeError::Config(
            "max_assigned_requests must be greater than 0".to_string(),
        ));
    }

    if config.gas_price_ceiling < config.default_gas_price {
        return Err(NodeError::Config(
            "gas_price_ceiling must not be smaller than default_gas_price".to_string(),
        ));
    }

    if config.analyzers.is_empty() {
        return Err(NodeError::Config(
            "at least one analyzer must be configured".to_string(),
        ));
    }

    for analyzer in &config.analyzers {
        if analyzer.timeout_sec == 0 || analyzer.timeout_sec > 3600 {
            return Err(NodeError::Config(format!(
                "analyzer {}: timeout_sec must be within (0, 3600], got {}",
                analyzer.name, analyzer.timeout_sec
            )));
        }
    }

    if config.enable_report_upload && config.report_upload_url.is_none() {
        return Err(NodeError::Config(
            "report upload enabled but report_upload_url not provided".to_string(),
        ));
    }

    Ok(())
}
