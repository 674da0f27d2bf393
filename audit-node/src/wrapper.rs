//! 分析器沙箱封裝
//!
//! 每個外部分析工具打包為一個目錄，內含三個可執行入口腳本：
//!
//! - `pull`：啟動時預取工具鏡像或依賴
//! - `metadata`：輸出工具自描述 JSON（名稱、版本、檢查項）
//! - `run`：對單個合約源文件執行分析，輸出結果 JSON
//!
//! 節點以子進程方式調用入口腳本，通過固定的環境變量傳遞上下文，
//! 工作目錄設為封裝目錄本身。每個入口都受牆鐘超時約束，超時的
//! 子進程會被強制終止。分析器的失敗只影響它自己的報告條目。

use crate::error::{NodeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// 傳遞給入口腳本的環境變量名
const ENV_STORAGE_DIR: &str = "STORAGE_DIR";
const ENV_WRAPPER_HOME: &str = "WRAPPER_HOME";
const ENV_ANALYZER_NAME: &str = "ANALYZER_NAME";
const ENV_ANALYZER_ARGS: &str = "ANALYZER_ARGS";
const ENV_CONTRACT_PATH: &str = "CONTRACT_PATH";
const ENV_CONTRACT_FILE_NAME: &str = "CONTRACT_FILE_NAME";
const ENV_ORIGINAL_FILE_NAME: &str = "ORIGINAL_FILE_NAME";

/// `run` 入口的一次執行結果
#[derive(Debug)]
pub struct RunOutcome {
    /// 腳本標準輸出解析出的 JSON
    pub output: Value,
    /// 執行耗時
    pub elapsed: Duration,
}

/// 單個分析器的沙箱封裝
#[derive(Debug, Clone)]
pub struct AnalyzerWrapper {
    name: String,
    home: PathBuf,
    storage_dir: PathBuf,
    args: String,
    timeout: Duration,
}

impl AnalyzerWrapper {
    /// 構造封裝並校驗三個入口腳本
    ///
    /// 任一入口缺失或不可執行都視為配置錯誤，在啟動階段失敗。
    pub fn new(
        name: &str,
        home: &Path,
        storage_dir: &Path,
        args: &str,
        timeout: Duration,
    ) -> Result<Self> {
        for entry in ["pull", "metadata", "run"] {
            let path = home.join(entry);
            let meta = std::fs::metadata(&path).map_err(|_| {
                NodeError::Config(format!(
                    "analyzer {}: entry point {} not found in {}",
                    name,
                    entry,
                    home.display()
                ))
            })?;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(NodeError::Config(format!(
                    "analyzer {}: entry point {} is not executable",
                    name, entry
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            home: home.to_path_buf(),
            storage_dir: storage_dir.to_path_buf(),
            args: args.to_string(),
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 執行 `pull` 入口，預取工具依賴
    ///
    /// 在節點啟動階段調用，失敗或超時都會阻止啟動
    pub async fn prefetch(&self) -> Result<()> {
        let (status, _stdout, stderr) = self.spawn_bounded("pull", None, None).await?;
        if !status.success() {
            return Err(NodeError::Analyzer(format!(
                "{}: pull failed: {}",
                self.name,
                stderr.trim()
            )));
        }
        debug!(analyzer = %self.name, "prefetch complete");
        Ok(())
    }

    /// 執行 `metadata` 入口，返回工具對本次分析的自描述
    ///
    /// 與 `run` 走同一套環境變量契約並受同一超時約束，工具可以
    /// 按合約內容回報啟用的檢查項。盡力而為：入口失敗、超時或
    /// 輸出無法解析時退化為只含名稱的佔位對象，絕不讓元數據
    /// 問題影響審計流程。
    pub async fn get_metadata(
        &self,
        contract_path: &Path,
        original_file_name: &str,
    ) -> Value {
        match self
            .spawn_bounded("metadata", Some(contract_path), Some(original_file_name))
            .await
        {
            Ok((status, stdout, _)) if status.success() => {
                match serde_json::from_str(&stdout) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(analyzer = %self.name, "unparsable metadata: {}", e);
                        serde_json::json!({ "name": self.name })
                    }
                }
            }
            Ok((status, _, stderr)) => {
                warn!(
                    analyzer = %self.name,
                    code = ?status.code(),
                    "metadata entry failed: {}",
                    stderr.trim()
                );
                serde_json::json!({ "name": self.name })
            }
            Err(e) => {
                warn!(analyzer = %self.name, "metadata entry unavailable: {}", e);
                serde_json::json!({ "name": self.name })
            }
        }
    }

    /// 執行 `run` 入口對合約進行分析
    ///
    /// # 參數
    ///
    /// * `contract_path` - 本地合約源文件路徑
    /// * `original_file_name` - 合約在請求中的原始文件名
    ///
    /// # 返回
    ///
    /// 成功時為解析後的結果 JSON 與耗時；非零退出碼、超時或輸出
    /// 無法解析均原樣報錯，由聚合器轉為該分析器的錯誤條目。
    pub async fn check(
        &self,
        contract_path: &Path,
        original_file_name: &str,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let (status, stdout, stderr) = self
            .spawn_bounded("run", Some(contract_path), Some(original_file_name))
            .await?;
        let elapsed = started.elapsed();
        if !status.success() {
            return Err(NodeError::Analyzer(format!(
                "{}: run exited with {:?}: {}",
                self.name,
                status.code(),
                stderr.trim()
            )));
        }
        let output: Value = serde_json::from_str(&stdout).map_err(|e| {
            NodeError::Analyzer(format!("{}: unparsable run output: {}", self.name, e))
        })?;
        Ok(RunOutcome { output, elapsed })
    }

    /// 帶牆鐘超時地執行一個入口腳本，超時的子進程會被終止
    async fn spawn_bounded(
        &self,
        entry: &str,
        contract_path: Option<&Path>,
        original_file_name: Option<&str>,
    ) -> Result<(std::process::ExitStatus, String, String)> {
        tokio::time::timeout(
            self.timeout,
            self.spawn_entry(entry, contract_path, original_file_name),
        )
        .await
        .map_err(|_| {
            NodeError::Analyzer(format!(
                "{}: {} timed out after {:?}",
                self.name, entry, self.timeout
            ))
        })?
    }

    async fn spawn_entry(
        &self,
        entry: &str,
        contract_path: Option<&Path>,
        original_file_name: Option<&str>,
    ) -> Result<(std::process::ExitStatus, String, String)> {
        let mut env: HashMap<&str, String> = HashMap::new();
        env.insert(ENV_STORAGE_DIR, self.storage_dir.display().to_string());
        env.insert(ENV_WRAPPER_HOME, self.home.display().to_string());
        env.insert(ENV_ANALYZER_NAME, self.name.clone());
        env.insert(ENV_ANALYZER_ARGS, self.args.clone());
        if let Some(path) = contract_path {
            env.insert(ENV_CONTRACT_PATH, path.display().to_string());
            if let Some(file_name) = path.file_name() {
                env.insert(
                    ENV_CONTRACT_FILE_NAME,
                    file_name.to_string_lossy().into_owned(),
                );
            }
        }
        if let Some(name) = original_file_name {
            env.insert(ENV_ORIGINAL_FILE_NAME, name.to_string());
        }

        let child = Command::new(self.home.join(entry))
            .current_dir(&self.home)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NodeError::Analyzer(format!("{}: failed to spawn {}: {}", self.name, entry, e))
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| NodeError::Analyzer(format!("{}: {} failed: {}", self.name, entry, e)))?;
        Ok((
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_entry(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{}", body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    fn wrapper_dir(run_body: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path(), "pull", "exit 0");
        write_entry(
            dir.path(),
            "metadata",
            "echo '{\"name\": \"toy\", \"version\": \"1.0\"}'",
        );
        write_entry(dir.path(), "run", run_body);
        dir
    }

    fn wrapper(dir: &TempDir, timeout_secs: u64) -> AnalyzerWrapper {
        AnalyzerWrapper::new(
            "toy",
            dir.path(),
            dir.path(),
            "",
            Duration::from_secs(timeout_secs),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_config_error() {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path(), "pull", "exit 0");
        let err = AnalyzerWrapper::new(
            "toy",
            dir.path(),
            dir.path(),
            "",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_non_executable_entry_is_config_error() {
        let dir = wrapper_dir("exit 0");
        let run = dir.path().join("run");
        let mut perms = fs::metadata(&run).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&run, perms).unwrap();
        let err = AnalyzerWrapper::new(
            "toy",
            dir.path(),
            dir.path(),
            "",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_check_parses_json_output() {
        let dir =
            wrapper_dir("echo '{\"status\": \"success\", \"issues\": []}'");
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let outcome = w.check(&contract, "token.sol").await.unwrap();
        assert_eq!(outcome.output["status"], "success");
    }

    #[tokio::test]
    async fn test_check_passes_environment_contract() {
        let dir = wrapper_dir(
            "printf '{\"path\": \"%s\", \"orig\": \"%s\", \"name\": \"%s\"}' \
             \"$CONTRACT_PATH\" \"$ORIGINAL_FILE_NAME\" \"$ANALYZER_NAME\"",
        );
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let outcome = w.check(&contract, "Original.sol").await.unwrap();
        assert_eq!(outcome.output["path"], contract.display().to_string());
        assert_eq!(outcome.output["orig"], "Original.sol");
        assert_eq!(outcome.output["name"], "toy");
    }

    #[tokio::test]
    async fn test_check_nonzero_exit_is_error() {
        let dir = wrapper_dir("echo 'boom' >&2; exit 3");
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let err = w.check(&contract, "token.sol").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_check_times_out() {
        let dir = wrapper_dir("sleep 30");
        let w = wrapper(&dir, 1);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let err = w.check(&contract, "token.sol").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_metadata_falls_back_to_stub() {
        let dir = wrapper_dir("exit 0");
        write_entry(dir.path(), "metadata", "exit 1");
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let meta = w.get_metadata(&contract, "token.sol").await;
        assert_eq!(meta, serde_json::json!({ "name": "toy" }));
    }

    #[tokio::test]
    async fn test_metadata_returns_tool_description() {
        let dir = wrapper_dir("exit 0");
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let meta = w.get_metadata(&contract, "token.sol").await;
        assert_eq!(meta["version"], "1.0");
    }

    #[tokio::test]
    async fn test_metadata_sees_contract_environment() {
        let dir = wrapper_dir("exit 0");
        write_entry(
            dir.path(),
            "metadata",
            "printf '{\"name\": \"toy\", \"path\": \"%s\", \"orig\": \"%s\"}' \
             \"$CONTRACT_PATH\" \"$ORIGINAL_FILE_NAME\"",
        );
        let w = wrapper(&dir, 5);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let meta = w.get_metadata(&contract, "Original.sol").await;
        assert_eq!(meta["path"], contract.display().to_string());
        assert_eq!(meta["orig"], "Original.sol");
    }

    #[tokio::test]
    async fn test_metadata_timeout_falls_back_to_stub() {
        let dir = wrapper_dir("exit 0");
        write_entry(dir.path(), "metadata", "sleep 30");
        let w = wrapper(&dir, 1);
        let contract = dir.path().join("token.sol");
        fs::write(&contract, "contract T {}").unwrap();
        let meta = w.get_metadata(&contract, "token.sol").await;
        assert_eq!(meta, serde_json::json!({ "name": "toy" }));
    }

    #[tokio::test]
    async fn test_prefetch_times_out() {
        let dir = wrapper_dir("exit 0");
        write_entry(dir.path(), "pull", "sleep 30");
        let w = wrapper(&dir, 1);
        let err = w.prefetch().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
