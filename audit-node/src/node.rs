//! 節點編排器
//!
//! 把各個子系統接成一個長駐守護進程。節點由幾條獨立的週期循環
//! 構成，各循環共享同一套狀態，通過事件池解耦：
//!
//! - 主輪詢循環：發現並認領新請求（含警察任務）
//! - 審計處理循環：對 AS 事件執行本地分析
//! - 提交循環：把 TS 事件的報告推上賬本
//! - 報價同步循環：跟隨全網最低報價
//! - gas 價格循環：按策略刷新交易 gas 價格
//! - 過期掃描循環：作廢註定趕不上提交窗口的事件
//!
//! 每條循環的單輪失敗只記日誌不退出，唯一例外是報價同步：
//! 報價落後會讓節點持續空轉搶不到單，同步失敗觸發整體停機。

use crate::analyzer::ReportAggregator;
use crate::codec;
use crate::config::{GasPriceStrategy, NodeConfig};
use crate::error::{NodeError, Result};
use crate::ledger::LedgerClient;
use crate::pool::EventPool;
use crate::transact::execute_transaction;
use crate::types::{AuditEvent, EventStatus, RequestAvailability, RequestKind};
use crate::upload::{UploadProvider, UPLOAD_DISABLED_URI};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// 審計節點
///
/// 可廉價克隆，各循環持有同一份共享狀態
#[derive(Clone)]
pub struct AuditNode {
    config: Arc<NodeConfig>,
    ledger: Arc<dyn LedgerClient>,
    pool: Arc<EventPool>,
    aggregator: Arc<ReportAggregator>,
    upload: Arc<dyn UploadProvider>,
    gas_price: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    audit_slots: Arc<Semaphore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AuditNode {
    pub fn new(
        config: NodeConfig,
        ledger: Arc<dyn LedgerClient>,
        pool: Arc<EventPool>,
        aggregator: Arc<ReportAggregator>,
        upload: Arc<dyn UploadProvider>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let default_gas_price = config.default_gas_price;
        let max_concurrent = config.max_concurrent_audits;
        Self {
            config: Arc::new(config),
            ledger,
            pool,
            aggregator,
            upload,
            gas_price: Arc::new(AtomicU64::new(default_gas_price)),
            running: Arc::new(AtomicBool::new(false)),
            audit_slots: Arc::new(Semaphore::new(max_concurrent)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// 當前用於交易的 gas 價格
    pub fn current_gas_price(&self) -> u64 {
        self.gas_price.load(Ordering::Relaxed)
    }

    /// 請求節點停機，所有循環在本輪結束後退出
    pub fn stop(&self) {
        info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// 啟動節點並阻塞直到停機
    ///
    /// 同一實例只能啟動一次，重複調用報錯。啟動前先預取全部
    /// 分析器依賴並同步一次報價與 gas 價格。
    pub async fn run(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::AlreadyRunning);
        }
        info!(
            account = self.ledger.account(),
            analyzers = self.aggregator.analyzer_count(),
            "audit node starting"
        );

        self.update_gas_price().await;
        self.check_and_update_min_price().await?;

        let mut handles = Vec::new();
        handles.push(self.spawn_loop(
            "poll",
            Duration::from_secs(self.config.poll_interval_secs),
            |node| async move {
                node.poll_audit_request().await;
                Ok(())
            },
        ));
        handles.push(self.spawn_loop(
            "process",
            Duration::from_secs(self.config.processing_interval_secs),
            |node| async move {
                node.process_assigned_events().await;
                Ok(())
            },
        ));
        handles.push(self.spawn_loop(
            "submit",
            Duration::from_secs(self.config.submission_interval_secs),
            |node| async move {
                node.submit_pending_reports().await;
                Ok(())
            },
        ));
        handles.push(self.spawn_loop(
            "price-sync",
            Duration::from_secs(self.config.price_sync_interval_secs),
            |node| async move { node.check_and_update_min_price().await },
        ));
        handles.push(self.spawn_loop(
            "gas-price",
            Duration::from_secs(self.config.gas_price_interval_secs),
            |node| async move {
                node.update_gas_price().await;
                Ok(())
            },
        ));
        handles.push(self.spawn_loop(
            "timeout-sweep",
            Duration::from_secs(self.config.timeout_sweep_interval_secs),
            |node| async move {
                node.timeout_stale_requests().await;
                Ok(())
            },
        ));

        for handle in handles {
            if let Err(e) = handle.await {
                error!("loop task failed: {}", e);
            }
        }
        info!("audit node stopped");
        Ok(())
    }

    /// 以固定間隔驅動一個週期函數，直到收到停機信號
    ///
    /// 週期函數返回 Err 表示致命故障，觸發整體停機。
    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        interval: Duration,
        cycle: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(AuditNode) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let node = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cycle(node.clone()).await {
                            error!(loop_name = name, "fatal loop error: {}", e);
                            node.stop();
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(loop_name = name, "loop exiting");
                        break;
                    }
                }
            }
        })
    }

    /// 主輪詢的一輪：發現並認領新請求
    ///
    /// 認領本質上是和其他節點搶單，落空是常態，所以認領交易的
    /// 一切失敗（包括重複）都只記日誌，絕不向外傳播。
    pub async fn poll_audit_request(&self) {
        if self.config.enable_police_checks {
            if let Err(e) = self.poll_police_assignment().await {
                warn!("police poll failed: {}", e);
            }
        }

        let state = match self.ledger.any_request_available().await {
            Ok(state) => RequestAvailability::from_ledger_state(state),
            Err(e) => {
                warn!("availability check failed: {}", e);
                return;
            }
        };
        match state {
            RequestAvailability::Ready => {}
            RequestAvailability::Understaked => {
                warn!("node is understaked, cannot bid on requests");
                return;
            }
            RequestAvailability::Unavailable(code) => {
                debug!(code, "no requests available");
                return;
            }
        }

        // 准入控制：在途請求已滿時不再出價
        match self.admission_allowed().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("assigned request limit reached, skipping bid");
                return;
            }
            Err(e) => {
                warn!("admission check failed: {}", e);
                return;
            }
        }

        let gas_price = self.current_gas_price();
        let min_price = self.config.min_price;
        let ledger = Arc::clone(&self.ledger);
        let claim = execute_transaction("claimNextRequest", self.ledger.account(), || async move {
            ledger.claim_next_request(min_price, gas_price).await
        })
        .await;
        match claim {
            Ok(assignment) => {
                info!(
                    request_id = assignment.request_id,
                    uri = %assignment.contract_uri,
                    "request claimed"
                );
                if let Err(e) = self.pool.add_event(&assignment) {
                    error!(
                        request_id = assignment.request_id,
                        "failed to record claimed request: {}", e
                    );
                }
            }
            Err(e) => {
                // 交易執行器已按類別記過日誌，這裡只補充上下文
                debug!("claim did not go through: {}", e);
            }
        }
    }

    async fn poll_police_assignment(&self) -> Result<()> {
        if !self.ledger.is_police_node().await? {
            return Ok(());
        }
        if let Some(assignment) = self.ledger.get_next_police_assignment().await? {
            info!(
                request_id = assignment.request_id,
                "police assignment received"
            );
            self.pool.add_event(&assignment)?;
        }
        Ok(())
    }

    async fn admission_allowed(&self) -> Result<bool> {
        let assigned = self.ledger.assigned_request_count().await?;
        let ledger_max = self.ledger.get_max_assigned_requests().await?;
        // 取本地上限與賬本上限中較緊的那個
        let max = self.config.max_assigned_requests.min(ledger_max);
        Ok(assigned < max)
    }

    /// 報價同步的一輪
    ///
    /// 賬本上記錄的本節點報價與配置不一致時重新寫入。節點靠
    /// 報價參與搶單，報價陳舊會讓節點持續空轉，所以同步失敗
    /// 向上傳播並導致停機。
    pub async fn check_and_update_min_price(&self) -> Result<()> {
        let ledger_price = self.ledger.get_min_audit_price().await?;
        let own = self.config.min_price;
        if ledger_price == own {
            return Ok(());
        }
        debug!(ledger_price, own, "synchronizing audit price");
        self.update_min_price(own).await
    }

    /// 把報價寫上賬本
    pub async fn update_min_price(&self, price: u64) -> Result<()> {
        let gas_price = self.current_gas_price();
        let ledger = Arc::clone(&self.ledger);
        let tx_hash =
            execute_transaction("setAuditNodePrice", self.ledger.account(), || async move {
                ledger.set_audit_node_price(price, gas_price).await
            })
            .await?;
        info!(price, tx_hash = %tx_hash, "audit price updated");
        Ok(())
    }

    /// gas 價格刷新的一輪
    ///
    /// 動態策略取最近區塊樣本的中位數，但不低於默認值、不高於
    /// 上限；樣本不足一個完整觀察窗口或讀取失敗時退回默認值。
    pub async fn update_gas_price(&self) {
        let price = self.compute_gas_price().await;
        self.gas_price.store(price, Ordering::Relaxed);
        debug!(gas_price = price, "gas price refreshed");
    }

    pub async fn compute_gas_price(&self) -> u64 {
        let default = self.config.default_gas_price;
        match self.config.gas_price_strategy {
            GasPriceStrategy::Static => default,
            GasPriceStrategy::Dynamic => {
                let probe = self.config.gas_price_probe_blocks;
                match self.ledger.recent_gas_prices(probe).await {
                    Ok(samples) if samples.len() as u64 >= probe => {
                        median(samples).max(default).min(self.config.gas_price_ceiling)
                    }
                    Ok(samples) => {
                        debug!(
                            samples = samples.len(),
                            probe, "gas price history too short, using default"
                        );
                        default
                    }
                    Err(e) => {
                        warn!("gas price probe failed, using default: {}", e);
                        default
                    }
                }
            }
        }
    }

    /// 過期掃描的一輪
    pub async fn timeout_stale_requests(&self) {
        let current_block = match self.ledger.block_number().await {
            Ok(n) => n,
            Err(e) => {
                warn!("block number unavailable, sweep skipped: {}", e);
                return;
            }
        };
        match self.pool.timeout_stale_events(
            current_block,
            self.config.submission_timeout_limit_blocks,
            self.config.block_discard_on_restart,
        ) {
            Ok(expired) => {
                for request_id in expired {
                    info!(request_id, current_block, "request expired");
                }
            }
            Err(e) => error!("timeout sweep failed: {}", e),
        }
    }

    /// 審計處理的一輪：對全部 AS 事件併發執行本地分析
    ///
    /// 併發度由信號量限制，單個事件的失敗標為 ER，不影響其他事件。
    pub async fn process_assigned_events(&self) {
        let events = match self.pool.events_to_be_processed() {
            Ok(events) => events,
            Err(e) => {
                error!("cannot list assigned events: {}", e);
                return;
            }
        };
        let mut tasks = Vec::with_capacity(events.len());
        for event in events {
            let node = self.clone();
            let slots = Arc::clone(&self.audit_slots);
            tasks.push(tokio::spawn(async move {
                let _permit = match slots.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let request_id = event.request_id;
                if let Err(e) = node.process_event(&event).await {
                    error!(request_id, "audit processing failed: {}", e);
                    if let Err(e) = node
                        .pool
                        .set_error(request_id, &format!("Audit failed: {}", e))
                    {
                        error!(request_id, "cannot mark event as error: {}", e);
                    }
                }
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("audit task panicked: {}", e);
            }
        }
    }

    async fn process_event(&self, event: &AuditEvent) -> Result<()> {
        let report = self
            .aggregator
            .audit(event.request_id, &event.requestor, &event.contract_uri)
            .await?;
        let encoded = codec::encode_report(&report)?;
        let report_json = serde_json::to_string(&report)?;
        let report_hash = hex::encode(Keccak256::digest(report_json.as_bytes()));

        self.pool.set_to_be_submitted(
            event.request_id,
            report.audit_state,
            &report_json,
            &encoded,
            &report_hash,
        )?;

        // 完整報告與合約源碼旁路上傳，成敗都不影響主流程
        if self.config.enable_report_upload {
            let outcome = self
                .upload
                .upload_report(&report_hash, report_json.as_bytes())
                .await;
            let uri = outcome
                .url
                .unwrap_or_else(|| UPLOAD_DISABLED_URI.to_string());
            self.pool.set_audit_uri(event.request_id, &uri)?;
            self.upload_staged_contract(event).await;
        } else {
            self.pool
                .set_audit_uri(event.request_id, UPLOAD_DISABLED_URI)?;
        }
        Ok(())
    }

    /// 把審計時落盤的合約源碼同步上傳，供人工對照報告
    async fn upload_staged_contract(&self, event: &AuditEvent) {
        let path = self
            .aggregator
            .staged_contract_path(event.request_id, &event.contract_uri);
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return,
        };
        match tokio::fs::read(&path).await {
            Ok(source) => {
                let outcome = self
                    .upload
                    .upload_contract(event.request_id, &file_name, &source)
                    .await;
                if !outcome.success {
                    warn!(
                        request_id = event.request_id,
                        "contract upload failed: {}",
                        outcome.provider_error.unwrap_or_default()
                    );
                }
            }
            Err(e) => warn!(
                request_id = event.request_id,
                "staged contract unreadable, upload skipped: {}", e
            ),
        }
    }

    /// 提交的一輪：把全部 TS 事件的報告推上賬本
    ///
    /// 超過最大嘗試次數的事件標為 ER；可恢復的交易失敗讓事件
    /// 留在 TS 等下一輪重試。
    pub async fn submit_pending_reports(&self) {
        let events = match self.pool.events_to_be_submitted() {
            Ok(events) => events,
            Err(e) => {
                error!("cannot list pending reports: {}", e);
                return;
            }
        };
        for event in events {
            if let Err(e) = self.submit_event(&event).await {
                error!(request_id = event.request_id, "submission failed: {}", e);
            }
        }
    }

    async fn submit_event(&self, event: &AuditEvent) -> Result<()> {
        debug_assert_eq!(event.status, EventStatus::ToBeSubmitted);
        if event.submission_attempts >= self.config.max_submission_attempts {
            warn!(
                request_id = event.request_id,
                attempts = event.submission_attempts,
                "submission attempts exhausted"
            );
            self.pool.set_error(
                event.request_id,
                "Maximum number of submission attempts reached",
            )?;
            return Ok(());
        }
        let compressed = event
            .compressed_report
            .as_deref()
            .ok_or_else(|| NodeError::Serialization("event has no report".to_string()))?;
        let audit_state = event
            .audit_state
            .ok_or_else(|| NodeError::Serialization("event has no audit state".to_string()))?;

        self.pool.record_submission_attempt(event.request_id)?;
        let gas_price = self.current_gas_price();

        let result = match event.kind {
            RequestKind::Audit => {
                let ledger = Arc::clone(&self.ledger);
                let request_id = event.request_id;
                let report = compressed.to_string();
                execute_transaction("submitReport", self.ledger.account(), || async move {
                    ledger
                        .submit_audit_report(request_id, audit_state, &report, gas_price)
                        .await
                })
                .await
            }
            RequestKind::Police => {
                let is_verified = self.verify_submitted_report(event, audit_state).await;
                let ledger = Arc::clone(&self.ledger);
                let request_id = event.request_id;
                let report = compressed.to_string();
                execute_transaction("submitPoliceReport", self.ledger.account(), || async move {
                    ledger
                        .submit_police_report(request_id, &report, is_verified, gas_price)
                        .await
                })
                .await
            }
        };

        match result {
            Ok(tx_hash) => {
                self.pool.set_done(
                    event.request_id,
                    &tx_hash,
                    "Report successfully submitted",
                )?;
                info!(request_id = event.request_id, tx_hash = %tx_hash, "report submitted");
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                // 留在 TS，嘗試計數已遞增，下一輪重試
                debug!(
                    request_id = event.request_id,
                    "submission will be retried: {}", e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 警察複核：比對自己的判定與被複核報告的判定
    ///
    /// 被複核報告無法取回或解碼時按不一致處理
    async fn verify_submitted_report(&self, event: &AuditEvent, own_state: u8) -> bool {
        let stored = match self.ledger.get_report(event.request_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    request_id = event.request_id,
                    "cannot fetch audited report: {}", e
                );
                return false;
            }
        };
        match codec::decode_report(&stored) {
            Ok(report) => report.audit_state == own_state,
            Err(e) => {
                warn!(
                    request_id = event.request_id,
                    "audited report undecodable: {}", e
                );
                false
            }
        }
    }
}

/// 樣本中位數，偶數個取中間兩值的平均，空樣本為 0
fn median(mut samples: Vec<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        samples[mid - 1] + (samples[mid] - samples[mid - 1]) / 2
    } else {
        samples[mid]
    }
}
