//! End-to-end pipeline runs against scripted backends
//!
//! Each test gets its own temp-file database. Pacing is disabled and backoff
//! is a few milliseconds, so the runs use the real clock.

mod helpers;

use bibscout_common::events::{EnrichEvent, EventBus};
use bibscout_enrich::db::checkpoints::load_checkpoint;
use bibscout_enrich::models::{InputItem, PipelineState, RecordOutcome, RecordStatus, RunOptions};
use bibscout_enrich::PipelineOrchestrator;
use helpers::*;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 90 fresh DONE records plus 10 new ones that all become candidates
async fn seed_scenario_a(pool: &sqlx::SqlitePool, search: &MockSearch) -> Vec<InputItem> {
    let mut existing = Vec::new();
    let mut items = Vec::new();
    for i in 0..90 {
        let id = format!("old-{:03}", i);
        existing.push(done_record(&id, "A", 6.0 + (i % 40) as f64 / 10.0, 50 + i as i64));
        items.push(InputItem::new(id.clone(), Some(format!("isbn-{}", id))).with_classification("A"));
    }
    seed_records(pool, &existing).await.unwrap();

    for item in inputs("new", 10, "B") {
        search.hit(&item.id, 9.0, 100);
        items.push(item);
    }
    items
}

#[tokio::test]
async fn test_mixed_batch_only_touches_new_records() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    let items = seed_scenario_a(&pool, &search).await;

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(items, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.final_state, PipelineState::Done);
    assert_eq!(summary.total_requested, 100);
    assert_eq!(summary.search_calls, 10);
    assert_eq!(summary.detail_calls, 10);
    assert_eq!(summary.reused, 90);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.status_counts[&RecordStatus::Done], 100);

    // Category B: ten identical signals, percentile logic applies
    let b = summary.thresholds.iter().find(|t| t.category == "B").unwrap();
    assert!(b.percentile_applied);
    assert_eq!(b.candidates, 10);

    let record = stored(&pool, "new-003").await;
    assert_eq!(record.status, RecordStatus::Done);
    assert_eq!(record.link.as_deref(), Some("https://catalog.test/subject/new-003"));
    assert!(record.is_candidate);
    assert!(record.stale_after.is_some());

    let counts = test_store(&pool).count_by_status().await.unwrap();
    assert_eq!(counts[&RecordStatus::Done], 100);

    let checkpoint = load_checkpoint(&pool, &summary.batch_key).await.unwrap().unwrap();
    assert_eq!(checkpoint.state, PipelineState::Done);
    assert_eq!(checkpoint.record_count, 100);
}

#[tokio::test]
async fn test_second_run_makes_no_calls() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    let items = seed_scenario_a(&pool, &search).await;
    let orch = orchestrator(&pool, test_config(), &search, &detail);

    orch.run(items.clone(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    let before = test_store(&pool).lookup(&ids(&items)).await.unwrap();

    let summary = orch
        .run(items.clone(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.search_calls, 0);
    assert_eq!(summary.detail_calls, 0);
    assert_eq!(summary.reused, 100);
    assert_eq!(search.calls(), 10);
    assert_eq!(detail.calls(), 10);

    let after = test_store(&pool).lookup(&ids(&items)).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_detail_fields_are_mapped() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    search.hit("b1", 9.1, 300);

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(
            vec![InputItem::new("b1", Some("9787536692930".into())).with_classification("I247")],
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.outcomes["b1"], RecordOutcome::Succeeded);

    let record = stored(&pool, "b1").await;
    assert_eq!(record.status, RecordStatus::Done);
    let fields = record.detail.unwrap();
    assert_eq!(fields["title"], json!("Title b1"));
    assert_eq!(fields["authors"], json!("Liu Cixin, Ken Liu"));
    assert_eq!(fields["pages"], json!(302));
    assert_eq!(fields["rating_count"], json!(1234));
    assert!(!fields.contains_key("summary"));
}

#[tokio::test]
async fn test_not_found_outcomes() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    search.hit("linked", 9.0, 10);
    detail.not_found("linked");

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(
            vec![
                InputItem::new("linked", Some("111".into())),
                InputItem::new("unknown", Some("222".into())),
            ],
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.final_state, PipelineState::Done);
    assert_eq!(summary.not_found, 2);
    assert_eq!(summary.failed_retryable + summary.failed_fatal, 0);

    // Search miss: link stage is finished, nothing to filter on
    let unknown = stored(&pool, "unknown").await;
    assert_eq!(unknown.status, RecordStatus::LinkAcquired);
    assert_eq!(unknown.link, None);
    assert!(!unknown.is_candidate);
    assert!(unknown.last_error.is_none());

    // Detail miss: terminal, no detail stored
    let linked = stored(&pool, "linked").await;
    assert_eq!(linked.status, RecordStatus::Done);
    assert_eq!(linked.detail, None);
    assert_eq!(detail.requested(), vec!["linked".to_string()]);
}

#[tokio::test]
async fn test_only_candidates_reach_detail() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());

    // 20 scored records in one category; see the threshold arithmetic below
    let items = inputs("c", 20, "A");
    for (i, item) in items.iter().enumerate() {
        search.hit(&item.id, 6.0 + i as f64 * 0.2, 100 + i as i64 * 10);
    }

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(items, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    // votes p10 = 119, p90 = 271; scores in range p75 = 8.65
    let a = &summary.thresholds[0];
    assert!(a.percentile_applied);
    assert!((a.votes_lower.unwrap() - 119.0).abs() < 1e-9);
    assert!((a.votes_upper.unwrap() - 271.0).abs() < 1e-9);
    assert!((a.score_cut.unwrap() - 8.65).abs() < 1e-9);

    let mut fetched = detail.requested();
    fetched.sort();
    assert_eq!(fetched, vec!["c-014", "c-015", "c-016", "c-017"]);
    assert_eq!(summary.candidates, 4);
    assert_eq!(summary.status_counts[&RecordStatus::Done], 4);
    assert_eq!(summary.status_counts[&RecordStatus::LinkAcquired], 16);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());

    let seeded: Vec<_> = (0..20)
        .map(|i| done_record(&format!("d-{:03}", i), "A", 6.0 + i as f64 * 0.2, 100 + i * 10))
        .collect();
    seed_records(&pool, &seeded).await.unwrap();

    let mut items: Vec<InputItem> = seeded
        .iter()
        .map(|r| InputItem::new(r.id.clone(), r.secondary_key.clone()).with_classification("A"))
        .collect();
    items.extend(inputs("fresh", 5, "B"));

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(items, RunOptions::dry_run(), CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.final_state, PipelineState::Done);
    assert_eq!(summary.search_calls + summary.detail_calls, 0);
    assert_eq!(search.calls() + detail.calls(), 0);
    assert_eq!(summary.candidates, 4);
    assert_eq!(summary.pending, 5);

    assert_eq!(test_store(&pool).count().await.unwrap(), 20);
    let flags = test_store(&pool)
        .lookup(&seeded.iter().map(|r| r.id.clone()).collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(flags.values().all(|r| !r.is_candidate));
    assert!(load_checkpoint(&pool, &summary.batch_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_skip_flags() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    let items = inputs("s", 3, "B");
    for item in &items {
        search.hit(&item.id, 9.0, 10);
    }
    let orch = orchestrator(&pool, test_config(), &search, &detail);

    let skip_links = RunOptions {
        skip_links: true,
        ..RunOptions::default()
    };
    let summary = orch
        .run(items.clone(), skip_links, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.search_calls, 0);
    assert_eq!(summary.pending, 3);
    assert_eq!(stored(&pool, "s-000").await.status, RecordStatus::NeedsLink);

    let skip_detail = RunOptions {
        skip_detail: true,
        ..RunOptions::default()
    };
    let summary = orch
        .run(items.clone(), skip_detail, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.search_calls, 3);
    assert_eq!(summary.detail_calls, 0);
    assert_eq!(summary.status_counts[&RecordStatus::NeedsDetail], 3);
    assert_eq!(stored(&pool, "s-001").await.status, RecordStatus::NeedsDetail);
}

#[tokio::test]
async fn test_user_agents_rotate() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    let config = test_config();
    let agents = config.anti_detection.user_agents.clone();

    orchestrator(&pool, config, &search, &detail)
        .run(inputs("ua", 6, "B"), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let seen = search.user_agents();
    assert_eq!(seen.len(), 6);
    for agent in &seen {
        assert!(agents.contains(agent.as_ref().unwrap()));
    }
    let distinct: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(distinct.len(), agents.len());
}

#[tokio::test]
async fn test_duplicate_ids_collapse() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    search.hit("dup", 8.0, 5);

    let summary = orchestrator(&pool, test_config(), &search, &detail)
        .run(
            vec![
                InputItem::new("dup", Some("1".into())),
                InputItem::new(" dup ", Some("1".into())),
            ],
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.total_requested, 1);
    assert_eq!(search.calls_for("dup"), 1);
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let search = Arc::new(MockSearch::new());
    let detail = Arc::new(MockDetail::new());
    search.hit("e1", 9.0, 10);

    let bus = EventBus::new(1_000);
    let mut rx = bus.subscribe();
    let orch = PipelineOrchestrator::new(pool.clone(), test_config(), search.clone(), detail.clone(), bus)
        .unwrap();
    let summary = orch
        .run(vec![InputItem::new("e1", Some("1".into()))], RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(EnrichEvent::RunStarted { total: 1, .. })));
    match events.last() {
        Some(EnrichEvent::RunFinished { run_id, state, .. }) => {
            assert_eq!(*run_id, summary.run_id);
            assert_eq!(state, "DONE");
        }
        other => panic!("unexpected last event: {:?}", other),
    }

    let stages: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EnrichEvent::StageStarted { stage, .. } => Some(stage.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec!["LOADING", "DEDUP", "RESOLVING_LINKS", "FILTERING", "FETCHING_DETAIL", "PERSISTING"]
    );

    let advanced = events
        .iter()
        .filter(|e| matches!(e, EnrichEvent::RecordAdvanced { record_id, .. } if record_id == "e1"))
        .count();
    assert_eq!(advanced, 2);
}
