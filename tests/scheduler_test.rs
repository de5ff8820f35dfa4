//! End-to-end scheduler behavior, run in paused virtual time.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auditq::alert::run_alert_subscriber;
use auditq::backend::AnalyzeError;
use auditq::config::Settings;
use auditq::engine::SchedulerConfig;
use auditq::model::{ErrorClass, ItemId, Status, Verdict};
use auditq::stats;
use common::*;
use tokio_util::sync::CancellationToken;

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("0x{i:04x}")).collect()
}

fn as_strs(ids: &[String]) -> Vec<&str> {
    ids.iter().map(String::as_str).collect()
}

// ---------------------------------------------------------------------------
// Throughput and fairness
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ten_items_spread_over_three_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let ids = ids(10);
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        3,
        Duration::from_secs(1),
        VecSource::new(&as_strs(&ids)),
        ScriptedAnalyzer::new(Duration::from_millis(50)),
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&as_strs(&ids)).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    let calls = harness.analyzer.calls();
    assert_eq!(calls.len(), 10);

    let mut per_credential: HashMap<String, Vec<tokio::time::Instant>> = HashMap::new();
    for call in &calls {
        per_credential
            .entry(call.credential.clone())
            .or_default()
            .push(call.at);
    }
    assert_eq!(per_credential.len(), 3);
    for (credential, times) in &per_credential {
        assert!(
            (3..=4).contains(&times.len()),
            "{credential} used {} times",
            times.len()
        );
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_secs(1),
                "{credential} dispatched twice within min_delay"
            );
        }
    }

    let first = calls.iter().map(|c| c.at).min().unwrap();
    let last = calls.iter().map(|c| c.at).max().unwrap();
    let span = last - first;
    assert!(span >= Duration::from_secs(3), "finished too fast: {span:?}");
    assert!(span < Duration::from_millis(4500), "finished too slow: {span:?}");
}

#[tokio::test(start_paused = true)]
async fn default_settings_keep_every_credential_busy() {
    let dir = tempfile::tempdir().unwrap();
    let ids = ids(10);
    let settings = Settings::default();
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        3,
        settings.min_delay(),
        VecSource::new(&as_strs(&ids)),
        ScriptedAnalyzer::new(Duration::ZERO),
        settings.scheduler(),
    )
    .await;

    let start = tokio::time::Instant::now();
    let run = harness.spawn();
    harness.wait_terminal(&as_strs(&ids)).await;
    let elapsed = start.elapsed();
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    // Bound by the one-second rest per credential, not the discovery interval.
    assert!(elapsed >= Duration::from_secs(3), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(4500), "finished too slow: {elapsed:?}");
    assert_eq!(harness.analyzer.calls().len(), 10);

    let mut per_credential: HashMap<String, usize> = HashMap::new();
    for call in harness.analyzer.calls() {
        *per_credential.entry(call.credential).or_default() += 1;
    }
    assert_eq!(per_credential.len(), 3);
    assert!(per_credential.values().all(|n| (3..=4).contains(n)));
}

#[tokio::test(start_paused = true)]
async fn an_item_is_never_analyzed_twice_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let ids = ids(20);
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        4,
        Duration::from_millis(100),
        VecSource::new(&as_strs(&ids)),
        // Slower than the discovery interval, so items are still in flight
        // when they are listed again.
        ScriptedAnalyzer::new(Duration::from_millis(750)),
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&as_strs(&ids)).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    assert!(harness.analyzer.overlaps().is_empty());
    for id in &ids {
        assert_eq!(harness.analyzer.calls_for(id).len(), 1, "{id} analyzed more than once");
    }
    assert!(harness.ctx().locks.is_empty());
    assert_eq!(harness.ctx().pool.busy(), 0);
}

#[tokio::test(start_paused = true)]
async fn launches_in_one_round_are_staggered() {
    let dir = tempfile::tempdir().unwrap();
    let stagger = Duration::from_millis(300);
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        3,
        Duration::ZERO,
        VecSource::new(&["0x1", "0x2", "0x3"]),
        ScriptedAnalyzer::new(Duration::from_secs(1)),
        SchedulerConfig {
            launch_stagger: stagger,
            ..fast_config()
        },
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0x1", "0x2", "0x3"]).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    let mut starts: Vec<_> = harness.analyzer.calls().iter().map(|c| c.at).collect();
    starts.sort();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= stagger, "launched {:?} apart", pair[1] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_stagger_releases_the_waiting_item() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        2,
        Duration::ZERO,
        VecSource::new(&["0xfirst", "0xsecond"]),
        ScriptedAnalyzer::new(Duration::ZERO),
        SchedulerConfig {
            launch_stagger: Duration::from_secs(10),
            ..fast_config()
        },
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0xfirst"]).await;
    assert!(harness.ctx().locks.contains(&ItemId::new("0xsecond")));
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    assert!(harness.ctx().locks.is_empty());
    assert!(harness.ctx().store.get(&ItemId::new("0xsecond")).is_none());
    assert!(harness.analyzer.calls_for("0xsecond").is_empty());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rate_limited_item_cools_its_slot_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = ScriptedAnalyzer::new(Duration::ZERO).script(
        "0xa",
        vec![
            Step::Fail(AnalyzeError::RateLimited("429".to_string())),
            Step::Verdict(Verdict::with_findings(vec![finding("reentrancy")])),
        ],
    );
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        1,
        Duration::from_millis(100),
        VecSource::new(&["0xa"]),
        analyzer,
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0xa"]).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    let calls = harness.analyzer.calls_for("0xa");
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(2));

    let record = harness.ctx().store.get(&ItemId::new("0xa")).unwrap();
    assert_eq!(record.status, Status::Succeeded);
    assert_eq!(record.findings.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_recorded_once_and_never_retried() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = ScriptedAnalyzer::new(Duration::ZERO).script(
        "0xbad",
        vec![Step::Fail(AnalyzeError::Permanent("bytecode only".to_string()))],
    );
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        2,
        Duration::from_millis(100),
        VecSource::new(&["0xbad"]),
        analyzer,
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0xbad"]).await;
    // Several more discovery passes.
    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    assert_eq!(harness.analyzer.calls_for("0xbad").len(), 1);
    let record = harness.ctx().store.get(&ItemId::new("0xbad")).unwrap();
    assert_eq!(record.status, Status::Failed);
    assert_eq!(record.error_class, Some(ErrorClass::Permanent));
    assert!(!record.retryable);
    assert!(harness.source.cleaned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_escalate_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let timeout = || Step::Fail(AnalyzeError::Transient("timed out".to_string()));
    let analyzer = ScriptedAnalyzer::new(Duration::ZERO)
        .script("0xflaky", vec![timeout(), timeout(), timeout(), timeout()]);
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        1,
        Duration::from_millis(100),
        VecSource::new(&["0xflaky"]),
        analyzer,
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0xflaky"]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    assert_eq!(harness.analyzer.calls_for("0xflaky").len(), 3);
    let record = harness.ctx().store.get(&ItemId::new("0xflaky")).unwrap();
    assert_eq!(record.status, Status::Failed);
    assert_eq!(record.error_class, Some(ErrorClass::Transient));
    assert_eq!(record.attempts, 3);
    assert!(!record.retryable);
}

#[tokio::test(start_paused = true)]
async fn analyzer_panic_is_a_transient_failure_and_frees_everything() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = ScriptedAnalyzer::new(Duration::ZERO).script("0xboom", vec![Step::Panic]);
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        1,
        Duration::from_millis(100),
        VecSource::new(&["0xboom", "0xfine"]),
        analyzer,
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    harness.wait_terminal(&["0xboom", "0xfine"]).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    // Panicked once, then succeeded on retry.
    assert_eq!(harness.analyzer.calls_for("0xboom").len(), 2);
    let record = harness.ctx().store.get(&ItemId::new("0xboom")).unwrap();
    assert_eq!(record.status, Status::Succeeded);
    assert!(harness.ctx().locks.is_empty());
    assert_eq!(harness.ctx().pool.busy(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_store_write_leaves_item_pending_for_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("audited.json");
    // Occupy the temp-file path so atomic writes fail.
    let blocker = dir.path().join("audited.json.tmp");
    std::fs::create_dir(&blocker).unwrap();

    let harness = Harness::new(
        &store_path,
        1,
        Duration::from_millis(100),
        VecSource::new(&["0xa"]),
        ScriptedAnalyzer::new(Duration::ZERO),
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    let analyzer = harness.analyzer.clone();
    wait_until(|| !analyzer.calls_for("0xa").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.ctx().store.get(&ItemId::new("0xa")).is_none());
    assert!(!store_path.exists());

    std::fs::remove_dir(&blocker).unwrap();
    harness.wait_terminal(&["0xa"]).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    assert!(harness.analyzer.calls_for("0xa").len() >= 2);
    assert_eq!(open_store(&store_path).await.view().len(), 1);
}

// ---------------------------------------------------------------------------
// Restart, shutdown, side effects
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn restart_does_not_redispatch_finished_items() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("audited.json");
    let items = ["0x1", "0x2", "0x3"];

    let first = Harness::new(
        &store_path,
        2,
        Duration::from_millis(100),
        VecSource::new(&items),
        ScriptedAnalyzer::new(Duration::ZERO),
        fast_config(),
    )
    .await;
    let run = first.spawn();
    first.wait_terminal(&items).await;
    first.control.shutdown();
    run.await.unwrap().unwrap();
    assert_eq!(first.analyzer.calls().len(), 3);

    let second = Harness::new(
        &store_path,
        2,
        Duration::from_millis(100),
        VecSource::new(&items),
        ScriptedAnalyzer::new(Duration::ZERO),
        fast_config(),
    )
    .await;
    let run = second.spawn();
    tokio::time::sleep(Duration::from_secs(2)).await;
    second.control.shutdown();
    run.await.unwrap().unwrap();
    assert!(second.analyzer.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_running_analyses_finish() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        1,
        Duration::from_millis(100),
        VecSource::new(&["0xslow", "0xwaiting"]),
        ScriptedAnalyzer::new(Duration::from_secs(5)),
        fast_config(),
    )
    .await;

    let run = harness.spawn();
    let analyzer = harness.analyzer.clone();
    wait_until(|| !analyzer.calls().is_empty()).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();

    let store = &harness.ctx().store;
    assert_eq!(
        store.get(&ItemId::new("0xslow")).map(|r| r.status),
        Some(Status::Succeeded)
    );
    // Never got a slot; stays pending with no record.
    assert!(store.get(&ItemId::new("0xwaiting")).is_none());
    assert_eq!(harness.analyzer.calls().len(), 1);
    assert!(harness.ctx().locks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn findings_alert_once_and_payloads_are_cleaned_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = ScriptedAnalyzer::new(Duration::ZERO)
        .script(
            "0xvuln",
            vec![Step::Verdict(Verdict::with_findings(vec![
                finding("reentrancy"),
                finding("access-control"),
            ]))],
        )
        .script("0xnosrc", vec![Step::Verdict(Verdict::skipped("no verified source"))])
        .script(
            "0xbroken",
            vec![Step::Fail(AnalyzeError::Permanent("unparseable".to_string()))],
        );
    let harness = Harness::new(
        &dir.path().join("audited.json"),
        2,
        Duration::from_millis(100),
        VecSource::new(&["0xvuln", "0xclean", "0xnosrc", "0xbroken"]),
        analyzer,
        fast_config(),
    )
    .await;

    let hook = Arc::new(RecordingHook::default());
    let alerts_done = CancellationToken::new();
    let alerts = tokio::spawn(run_alert_subscriber(
        harness.ctx().events.subscribe(),
        hook.clone(),
        alerts_done.clone(),
    ));

    let run = harness.spawn();
    harness
        .wait_terminal(&["0xvuln", "0xclean", "0xnosrc", "0xbroken"])
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.control.shutdown();
    run.await.unwrap().unwrap();
    alerts_done.cancel();
    alerts.await.unwrap();

    let alerts = hook.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, ItemId::new("0xvuln"));
    assert_eq!(alerts[0].1, vec!["reentrancy", "access-control"]);

    let mut cleaned: Vec<String> = harness
        .source
        .cleaned()
        .iter()
        .map(|id| id.to_string())
        .collect();
    cleaned.sort();
    assert_eq!(cleaned, vec!["0xclean", "0xnosrc", "0xvuln"]);

    let snapshot = stats::snapshot(&harness.ctx().store).await.unwrap();
    assert_eq!(snapshot.total, 4);
    assert_eq!(snapshot.succeeded, 2);
    assert_eq!(snapshot.skipped, 1);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.with_findings, 1);
}
