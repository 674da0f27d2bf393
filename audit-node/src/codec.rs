//! 報告壓縮編解碼
//!
//! 完整報告序列化為 JSON 後以 zstd 壓縮，再以十六進制字符串
//! 存入事件池並提交賬本。解碼走相反方向，兩個方向互為逆操作。

use crate::error::{NodeError, Result};
use crate::types::FullReport;

/// zstd 壓縮級別
///
/// 默認級別在報告這種高度重複的 JSON 上已有足夠壓縮比
const COMPRESSION_LEVEL: i32 = 3;

/// 將完整報告壓縮編碼為十六進制字符串
pub fn encode_report(report: &FullReport) -> Result<String> {
    let json = serde_json::to_vec(report)?;
    let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| NodeError::Serialization(format!("zstd encode failed: {}", e)))?;
    Ok(hex::encode(compressed))
}

/// 從十六進制字符串解碼出完整報告
pub fn decode_report(encoded: &str) -> Result<FullReport> {
    let compressed = hex::decode(encoded)
        .map_err(|e| NodeError::Serialization(format!("invalid hex: {}", e)))?;
    let json = zstd::decode_all(compressed.as_slice())
        .map_err(|e| NodeError::Serialization(format!("zstd decode failed: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}
