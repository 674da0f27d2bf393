//! 去中心化審計市場工作節點
//!
//! 本 crate 實現了一個完整的審計工作節點，負責:
//! 1. 輪詢賬本上的審計市場並出價認領請求
//! 2. 在沙箱中運行多個獨立的靜態分析工具
//! 3. 把各工具結果聚合為一份帶最終判定的報告
//! 4. 壓縮報告並以交易形式提交回賬本
//!
//! # 架構
//!
//! ```text
//! ┌──────────────┐
//! │  AuditNode   │  ← 循環編排與准入控制
//! └──────┬───────┘
//!        │
//!   ┌────┴────┬─────────┬──────────┬──────────┐
//!   ▼         ▼         ▼          ▼          ▼
//! Ledger   Event    Report    Analyzer   Config
//! Client   Pool     Aggregator Wrapper
//! ```
//!
//! # 示例用法
//!
//! ```no_run
//! use audit_node::{AuditNode, config::load_config};
//!
//! # async fn example(node: AuditNode) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.toml")?;
//! node.run().await?;
//! # Ok(())
//! # }
//! ```

// 公開模塊
pub mod analyzer;
pub mod codec;
pub mod config;
pub mod error;
pub mod ledger;
pub mod node;
pub mod pool;
pub mod store;
pub mod transact;
pub mod types;
pub mod upload;
pub mod wrapper;

// Re-export 常用類型
pub use error::{NodeError, Result};
pub use node::AuditNode;
pub use types::{Assignment, AuditEvent, EventStatus, FullReport, RequestKind};
