//! 審計節點生命週期集成測試
//!
//! 以內存假賬本替換 HTTP 網關，逐輪驅動編排器的週期方法，
//! 驗證從認領到提交的完整鏈路以及各種失敗路徑。

use audit_node::analyzer::ReportAggregator;
use audit_node::codec;
use audit_node::config::{GasPriceStrategy, NodeConfig};
use audit_node::ledger::LedgerClient;
use audit_node::node::AuditNode;
use audit_node::pool::EventPool;
use audit_node::store::SerializedStore;
use audit_node::transact::TransactionError;
use audit_node::types::{Assignment, EventStatus, FullReport, RequestKind};
use audit_node::upload::NullUploadProvider;
use audit_node::wrapper::AnalyzerWrapper;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// 假賬本的可變狀態
#[derive(Default)]
struct LedgerState {
    block_number: u64,
    availability: u8,
    assigned_count: u64,
    max_assigned: u64,
    ledger_price: u64,
    gas_samples: Vec<u64>,
    claim_queue: VecDeque<Assignment>,
    claim_error: Option<&'static str>,
    submit_error: Option<&'static str>,
    is_police: bool,
    police_assignment: Option<Assignment>,
    stored_report: Option<String>,
    submissions: Vec<(u64, u8, String, u64)>,
    police_submissions: Vec<(u64, bool)>,
    price_updates: Vec<u64>,
}

struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    fn new(state: LedgerState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

fn make_tx_error(category: &str) -> TransactionError {
    match category {
        "timeout" => TransactionError::Timeout("mock".to_string()),
        "duplicate" => TransactionError::Duplicate("mock".to_string()),
        "uncled" => TransactionError::Uncled("mock".to_string()),
        _ => TransactionError::Other("mock".to_string()),
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn account(&self) -> &str {
        "0xmock"
    }

    async fn block_number(&self) -> audit_node::Result<u64> {
        Ok(self.with(|s| s.block_number))
    }

    async fn any_request_available(&self) -> audit_node::Result<u8> {
        Ok(self.with(|s| s.availability))
    }

    async fn assigned_request_count(&self) -> audit_node::Result<u64> {
        Ok(self.with(|s| s.assigned_count))
    }

    async fn get_max_assigned_requests(&self) -> audit_node::Result<u64> {
        Ok(self.with(|s| s.max_assigned))
    }

    async fn get_min_audit_price(&self) -> audit_node::Result<u64> {
        Ok(self.with(|s| s.ledger_price))
    }

    async fn get_report(&self, _request_id: u64) -> audit_node::Result<String> {
        self.with(|s| s.stored_report.clone())
            .ok_or_else(|| audit_node::NodeError::Ledger("no report".to_string()))
    }

    async fn is_audit_finished(&self, _request_id: u64) -> audit_node::Result<bool> {
        Ok(false)
    }

    async fn is_police_node(&self) -> audit_node::Result<bool> {
        Ok(self.with(|s| s.is_police))
    }

    async fn get_next_police_assignment(&self) -> audit_node::Result<Option<Assignment>> {
        Ok(self.with(|s| s.police_assignment.take()))
    }

    async fn recent_gas_prices(&self, _max_blocks: u64) -> audit_node::Result<Vec<u64>> {
        Ok(self.with(|s| s.gas_samples.clone()))
    }

    async fn claim_next_request(
        &self,
        _price: u64,
        _gas_price: u64,
    ) -> Result<Assignment, TransactionError> {
        self.with(|s| {
            if let Some(category) = s.claim_error {
                return Err(make_tx_error(category));
            }
            s.claim_queue
                .pop_front()
                .ok_or_else(|| TransactionError::Other("queue empty".to_string()))
        })
    }

    async fn set_audit_node_price(
        &self,
        price: u64,
        _gas_price: u64,
    ) -> Result<String, TransactionError> {
        self.with(|s| {
            s.price_updates.push(price);
            s.ledger_price = price;
        });
        Ok("0xtx-price".to_string())
    }

    async fn submit_audit_report(
        &self,
        request_id: u64,
        audit_state: u8,
        compressed_report: &str,
        gas_price: u64,
    ) -> Result<String, TransactionError> {
        self.with(|s| {
            if let Some(category) = s.submit_error {
                return Err(make_tx_error(category));
            }
            s.submissions
                .push((request_id, audit_state, compressed_report.to_string(), gas_price));
            Ok("0xtx-submit".to_string())
        })
    }

    async fn submit_police_report(
        &self,
        request_id: u64,
        _compressed_report: &str,
        is_verified: bool,
        _gas_price: u64,
    ) -> Result<String, TransactionError> {
        self.with(|s| {
            s.police_submissions.push((request_id, is_verified));
        });
        Ok("0xtx-police".to_string())
    }
}

fn write_entry(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh").unwrap();
    writeln!(f, "{}", body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

fn make_wrapper(root: &Path, name: &str, run_body: &str) -> AnalyzerWrapper {
    let home = root.join(name);
    std::fs::create_dir_all(&home).unwrap();
    write_entry(&home, "pull", "exit 0");
    write_entry(&home, "metadata", "echo '{}'");
    write_entry(&home, "run", run_body);
    AnalyzerWrapper::new(name, &home, root, "", Duration::from_secs(10)).unwrap()
}

struct Harness {
    _dir: TempDir,
    node: AuditNode,
    pool: Arc<EventPool>,
    ledger: Arc<MockLedger>,
    contract_uri: String,
}

fn build_harness(
    ledger_state: LedgerState,
    run_bodies: &[(&str, &str)],
    tweak: impl FnOnce(&mut NodeConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SerializedStore::open(":memory:").unwrap());
    let pool = Arc::new(EventPool::new(store).unwrap());
    let ledger = MockLedger::new(ledger_state);

    let wrappers = run_bodies
        .iter()
        .map(|(name, body)| make_wrapper(dir.path(), name, body))
        .collect();
    let aggregator = Arc::new(ReportAggregator::new(
        wrappers,
        dir.path(),
        reqwest::Client::new(),
        "0xmock",
    ));

    let contract_path = dir.path().join("token.sol");
    std::fs::write(&contract_path, "contract Token {}").unwrap();
    let contract_uri = format!("file://{}", contract_path.display());

    let mut config = NodeConfig {
        account: "0xmock".to_string(),
        min_price: 100,
        submission_timeout_limit_blocks: 10,
        block_discard_on_restart: 2,
        max_submission_attempts: 3,
        gas_price_strategy: GasPriceStrategy::Dynamic,
        default_gas_price: 777,
        poll_interval_secs: 1,
        price_sync_interval_secs: 1,
        gas_price_interval_secs: 1,
        timeout_sweep_interval_secs: 1,
        ..NodeConfig::default()
    };
    tweak(&mut config);

    let node = AuditNode::new(
        config,
        ledger.clone() as Arc<dyn LedgerClient>,
        pool.clone(),
        aggregator,
        Arc::new(NullUploadProvider),
    );
    Harness {
        _dir: dir,
        node,
        pool,
        ledger,
        contract_uri,
    }
}

fn ready_state() -> LedgerState {
    LedgerState {
        block_number: 100,
        availability: 1,
        assigned_count: 0,
        max_assigned: 5,
        ledger_price: 100,
        ..LedgerState::default()
    }
}

#[tokio::test]
async fn test_end_to_end_claim_process_submit() {
    let mut state = ready_state();
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[("alpha", "echo '{\"issues\": []}'")],
        |_| {},
    );
    let uri = h.contract_uri.clone();
    h.ledger
        .with(|s| s.claim_queue.front_mut().unwrap().contract_uri = uri);

    h.node.poll_audit_request().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::Assigned);

    h.node.process_assigned_events().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::ToBeSubmitted);
    assert_eq!(evt.audit_state, Some(4));
    assert!(evt.compressed_report.is_some());
    assert!(evt.is_persisted);
    // 落庫的完整報告記錄了委託人
    let full: FullReport = serde_json::from_str(evt.full_report.as_deref().unwrap()).unwrap();
    assert_eq!(full.requestor, "0xrequestor");

    h.node.submit_pending_reports().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::Done);
    assert_eq!(evt.submission_attempts, 1);
    assert_eq!(evt.tx_hash.as_deref(), Some("0xtx-submit"));
    assert_eq!(
        evt.status_info.as_deref(),
        Some("Report successfully submitted")
    );

    let submissions = h.ledger.with(|s| s.submissions.clone());
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, 1);
    assert_eq!(submissions[0].1, 4);
    // 提交的就是事件池裡存的壓縮報告
    let decoded = codec::decode_report(&submissions[0].2).unwrap();
    assert_eq!(decoded.request_id, 1);
}

fn state_with_claim(state: &mut LedgerState, request_id: u64, block: u64) -> LedgerState {
    let mut new_state = std::mem::take(state);
    new_state.claim_queue.push_back(Assignment {
        request_id,
        requestor: "0xrequestor".to_string(),
        contract_uri: String::new(),
        event_name: "RequestAssigned".to_string(),
        assigned_block_number: block,
        price: 100,
        kind: RequestKind::Audit,
    });
    new_state
}

#[tokio::test]
async fn test_claimed_event_uses_assignment_uri() {
    let mut state = ready_state();
    let h = build_harness(
        state_with_claim(&mut state, 7, 100),
        &[("alpha", "echo '{}'")],
        |_| {},
    );
    // 認領結果裡的 URI 必須進到事件池
    let uri = h.contract_uri.clone();
    h.ledger.with(|s| {
        s.claim_queue.front_mut().unwrap().contract_uri = uri;
    });
    h.node.poll_audit_request().await;
    let evt = h.pool.get(7).unwrap().unwrap();
    assert_eq!(evt.contract_uri, h.contract_uri);
}

#[tokio::test]
async fn test_admission_control_blocks_bidding() {
    let mut state = ready_state();
    state.assigned_count = 5;
    state.max_assigned = 5;
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[("alpha", "echo '{}'")],
        |_| {},
    );
    h.node.poll_audit_request().await;
    // 在途已滿，不出價也不認領
    assert!(h.pool.get(1).unwrap().is_none());
    assert_eq!(h.ledger.with(|s| s.claim_queue.len()), 1);
}

#[tokio::test]
async fn test_understaked_node_does_not_bid() {
    let mut state = ready_state();
    state.availability = 5;
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[("alpha", "echo '{}'")],
        |_| {},
    );
    h.node.poll_audit_request().await;
    assert_eq!(h.ledger.with(|s| s.claim_queue.len()), 1);
}

#[tokio::test]
async fn test_claim_errors_are_swallowed() {
    for category in ["timeout", "duplicate", "uncled", "other"] {
        let mut state = ready_state();
        state.claim_error = Some(match category {
            "timeout" => "timeout",
            "duplicate" => "duplicate",
            "uncled" => "uncled",
            _ => "other",
        });
        let h = build_harness(state, &[("alpha", "echo '{}'")], |_| {});
        // 搶單失敗是常態，絕不 panic 也不留殘餘狀態
        h.node.poll_audit_request().await;
        assert!(h.pool.events_to_be_processed().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_analyzer_failure_isolated_and_submitted_as_error() {
    let mut state = ready_state();
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[
            ("alpha", "echo '{\"issues\": []}'"),
            ("beta", "exit 2"),
        ],
        |_| {},
    );
    let uri = h.contract_uri.clone();
    h.ledger
        .with(|s| s.claim_queue.front_mut().unwrap().contract_uri = uri);

    h.node.poll_audit_request().await;
    h.node.process_assigned_events().await;
    h.node.submit_pending_reports().await;

    let submissions = h.ledger.with(|s| s.submissions.clone());
    assert_eq!(submissions.len(), 1);
    // 單個分析器失敗 → 整體判定失敗，但報告照常提交
    assert_eq!(submissions[0].1, 5);
    let decoded = codec::decode_report(&submissions[0].2).unwrap();
    assert_eq!(decoded.analyzers_reports.len(), 2);
}

#[tokio::test]
async fn test_recoverable_submit_error_leaves_event_for_retry() {
    let mut state = ready_state();
    state.submit_error = Some("timeout");
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[("alpha", "echo '{}'")],
        |_| {},
    );
    let uri = h.contract_uri.clone();
    h.ledger
        .with(|s| s.claim_queue.front_mut().unwrap().contract_uri = uri);

    h.node.poll_audit_request().await;
    h.node.process_assigned_events().await;

    h.node.submit_pending_reports().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::ToBeSubmitted);
    assert_eq!(evt.submission_attempts, 1);

    // 網關恢復後下一輪提交成功
    h.ledger.with(|s| s.submit_error = None);
    h.node.submit_pending_reports().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::Done);
    assert_eq!(evt.submission_attempts, 2);
}

#[tokio::test]
async fn test_submission_attempts_are_bounded() {
    let mut state = ready_state();
    state.submit_error = Some("timeout");
    let h = build_harness(
        state_with_claim(&mut state, 1, 100),
        &[("alpha", "echo '{}'")],
        |c| c.max_submission_attempts = 2,
    );
    let uri = h.contract_uri.clone();
    h.ledger
        .with(|s| s.claim_queue.front_mut().unwrap().contract_uri = uri);

    h.node.poll_audit_request().await;
    h.node.process_assigned_events().await;

    h.node.submit_pending_reports().await;
    h.node.submit_pending_reports().await;
    // 第三輪發現次數耗盡，標為終態錯誤
    h.node.submit_pending_reports().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.status, EventStatus::Error);
    assert_eq!(
        evt.status_info.as_deref(),
        Some("Maximum number of submission attempts reached")
    );
}

#[tokio::test]
async fn test_timeout_sweep_expires_boundary_events() {
    let mut state = ready_state();
    state.block_number = 100;
    let h = build_harness(state, &[("alpha", "echo '{}'")], |c| {
        c.submission_timeout_limit_blocks = 10;
        c.block_discard_on_restart = 2;
    });
    // 閾值 100 - 10 + 2 = 92：92 作廢，93 存活
    h.pool
        .add_event(&Assignment {
            request_id: 1,
            requestor: "0xrequestor".to_string(),
            contract_uri: "file:///x".to_string(),
            event_name: "RequestAssigned".to_string(),
            assigned_block_number: 92,
            price: 1,
            kind: RequestKind::Audit,
        })
        .unwrap();
    h.pool
        .add_event(&Assignment {
            request_id: 2,
            requestor: "0xrequestor".to_string(),
            contract_uri: "file:///x".to_string(),
            event_name: "RequestAssigned".to_string(),
            assigned_block_number: 93,
            price: 1,
            kind: RequestKind::Audit,
        })
        .unwrap();

    h.node.timeout_stale_requests().await;
    assert_eq!(h.pool.get(1).unwrap().unwrap().status, EventStatus::Error);
    assert_eq!(h.pool.get(2).unwrap().unwrap().status, EventStatus::Assigned);
}

/// 模擬其他節點已上鏈的一份報告
fn stored_report(audit_state: u8) -> FullReport {
    FullReport {
        version: "2.0.0".to_string(),
        request_id: 9,
        requestor: "0xrequestor".to_string(),
        contract_uri: "file:///x".to_string(),
        contract_hash: "00".repeat(32),
        auditor: "0xother".to_string(),
        timestamp: "2026-01-01T00:00:05Z".to_string(),
        start_time: "2026-01-01T00:00:00Z".to_string(),
        end_time: "2026-01-01T00:00:05Z".to_string(),
        status: if audit_state == 4 { "success" } else { "error" }.to_string(),
        audit_state,
        analyzers_reports: vec![],
    }
}

#[tokio::test]
async fn test_police_assignment_verifies_matching_report() {
    let mut state = ready_state();
    state.availability = 0;
    state.is_police = true;
    let h = build_harness(state, &[("alpha", "echo '{\"issues\": []}'")], |_| {});
    let uri = h.contract_uri.clone();
    h.ledger.with(|s| {
        s.police_assignment = Some(Assignment {
            request_id: 9,
            requestor: "0xrequestor".to_string(),
            contract_uri: uri,
            event_name: "PoliceAssigned".to_string(),
            assigned_block_number: 100,
            price: 0,
            kind: RequestKind::Police,
        });
    });

    h.node.poll_audit_request().await;
    h.node.process_assigned_events().await;

    // 被複核的節點提交過一份同判定的報告
    let own = h.pool.get(9).unwrap().unwrap();
    let stored = stored_report(own.audit_state.unwrap());
    let encoded = codec::encode_report(&stored).unwrap();
    h.ledger.with(|s| s.stored_report = Some(encoded));

    h.node.submit_pending_reports().await;
    let police = h.ledger.with(|s| s.police_submissions.clone());
    assert_eq!(police, vec![(9, true)]);
    assert_eq!(h.pool.get(9).unwrap().unwrap().status, EventStatus::Done);
}

#[tokio::test]
async fn test_police_mismatch_votes_not_verified() {
    let mut state = ready_state();
    state.availability = 0;
    state.is_police = true;
    let h = build_harness(state, &[("alpha", "echo '{\"issues\": []}'")], |_| {});
    let uri = h.contract_uri.clone();
    h.ledger.with(|s| {
        s.police_assignment = Some(Assignment {
            request_id: 9,
            requestor: "0xrequestor".to_string(),
            contract_uri: uri,
            event_name: "PoliceAssigned".to_string(),
            assigned_block_number: 100,
            price: 0,
            kind: RequestKind::Police,
        });
    });

    h.node.poll_audit_request().await;
    h.node.process_assigned_events().await;

    let stored = stored_report(5);
    let encoded = codec::encode_report(&stored).unwrap();
    h.ledger.with(|s| s.stored_report = Some(encoded));

    h.node.submit_pending_reports().await;
    let police = h.ledger.with(|s| s.police_submissions.clone());
    assert_eq!(police, vec![(9, false)]);
}

#[tokio::test]
async fn test_gas_price_dynamic_median_with_bounds() {
    let mut state = ready_state();
    state.gas_samples = vec![900, 2000, 1000];
    let h = build_harness(state, &[("alpha", "echo '{}'")], |c| {
        c.gas_price_probe_blocks = 3;
        c.gas_price_ceiling = 1500;
    });
    // 中位數 1000 落在默認值與上限之間，原樣採用
    assert_eq!(h.node.compute_gas_price().await, 1000);

    // 中位數超過上限時截到上限
    h.ledger.with(|s| s.gas_samples = vec![2000, 3000, 4000]);
    assert_eq!(h.node.compute_gas_price().await, 1500);

    // 中位數低於默認值時抬到默認值
    h.ledger.with(|s| s.gas_samples = vec![1, 2, 3]);
    assert_eq!(h.node.compute_gas_price().await, 777);

    // 樣本不足一個完整觀察窗口時退回默認值
    h.ledger.with(|s| s.gas_samples = vec![9000, 9000]);
    assert_eq!(h.node.compute_gas_price().await, 777);
}

#[tokio::test]
async fn test_price_sync_pushes_configured_price() {
    let mut state = ready_state();
    state.ledger_price = 50;
    let h = build_harness(state, &[("alpha", "echo '{}'")], |c| c.min_price = 100);
    h.node.check_and_update_min_price().await.unwrap();
    assert_eq!(h.ledger.with(|s| s.price_updates.clone()), vec![100]);
    // 一致後不再重複寫
    h.node.check_and_update_min_price().await.unwrap();
    assert_eq!(h.ledger.with(|s| s.price_updates.len()), 1);
}

#[tokio::test]
async fn test_run_refuses_second_start() {
    let state = ready_state();
    let h = build_harness(state, &[("alpha", "echo '{}'")], |_| {});
    let node = h.node.clone();
    let first = tokio::spawn(async move { node.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = h.node.run().await.unwrap_err();
    assert!(matches!(err, audit_node::NodeError::AlreadyRunning));

    h.node.stop();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_claim_does_not_clobber_existing_event() {
    let mut state = ready_state();
    let h = build_harness(
        state_with_claim(&mut state, 1, 50),
        &[("alpha", "echo '{}'")],
        |_| {},
    );
    h.node.poll_audit_request().await;
    // 賬本又把同一個請求派了回來
    h.ledger.with(|s| {
        s.claim_queue.push_back(Assignment {
            request_id: 1,
            requestor: "0xrequestor".to_string(),
            contract_uri: "file:///other".to_string(),
            event_name: "RequestAssigned".to_string(),
            assigned_block_number: 99,
            price: 1,
            kind: RequestKind::Audit,
        })
    });
    h.node.poll_audit_request().await;
    let evt = h.pool.get(1).unwrap().unwrap();
    assert_eq!(evt.assigned_block_number, 50);
}
