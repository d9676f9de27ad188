//! Model-selector rule tests against a real config table.

use std::time::Duration;

use autodev_db::models::{Complexity, Effort};
use autodev_db::queries::model_configs as model_db;
use autodev_test_utils::{create_test_db, drop_test_db};

use autodev_core::selector::{ModelSelector, SelectionContext, Tier, FALLBACK_MODEL};
use autodev_core::state::Action;

fn ctx(
    action: Action,
    complexity: Option<Complexity>,
    effort: Option<Effort>,
    attempt_count: i32,
) -> SelectionContext {
    SelectionContext {
        action,
        complexity,
        effort,
        attempt_count,
    }
}

#[tokio::test]
async fn xs_low_first_attempt_uses_the_coder_position() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    let selection = selector
        .select(&ctx(Action::Code, Some(Complexity::Xs), Some(Effort::Low), 0))
        .await
        .unwrap();

    assert_eq!(selection.tier, Tier::Standard);
    assert!(!selection.requires_breakdown);
    assert!(
        selection.reason.contains("coder_xs_low"),
        "reason should name the position: {}",
        selection.reason
    );
    assert!(
        selection.reason.contains(&selection.model_id),
        "reason should name the model: {}",
        selection.reason
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn s_and_m_are_symmetric_with_xs_on_first_attempt() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    let s = selector
        .select(&ctx(Action::Code, Some(Complexity::S), Some(Effort::High), 0))
        .await
        .unwrap();
    assert!(s.reason.contains("coder_s_high"), "got: {}", s.reason);

    let m = selector
        .select(&ctx(Action::Code, Some(Complexity::M), Some(Effort::Medium), 0))
        .await
        .unwrap();
    assert!(m.reason.contains("coder_m_medium"), "got: {}", m.reason);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unspecified_effort_uses_the_default_column() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    let selection = selector
        .select(&ctx(Action::Code, Some(Complexity::S), None, 0))
        .await
        .unwrap();
    assert!(
        selection.reason.contains("coder_s_default"),
        "got: {}",
        selection.reason
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn first_retry_escalates_regardless_of_stage() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    for action in [Action::Code, Action::Review, Action::Fix, Action::Plan] {
        let selection = selector
            .select(&ctx(action, Some(Complexity::Xs), Some(Effort::Low), 1))
            .await
            .unwrap();
        assert_eq!(selection.tier, Tier::Escalation1, "action {action}");
        assert!(
            selection.reason.contains("escalation_1"),
            "got: {}",
            selection.reason
        );
    }

    let selection = selector
        .select(&ctx(Action::Code, Some(Complexity::Xs), Some(Effort::Low), 2))
        .await
        .unwrap();
    assert_eq!(selection.tier, Tier::Escalation2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn large_complexity_requires_breakdown_instead_of_a_model() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    for complexity in [Complexity::L, Complexity::Xl] {
        let selection = selector
            .select(&ctx(Action::Code, Some(complexity), Some(Effort::High), 0))
            .await
            .unwrap();
        assert!(selection.requires_breakdown);
        assert_eq!(selection.tier, Tier::Standard);
        assert_eq!(selection.reason, "requires breakdown");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn configured_position_overrides_the_default_table() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    // Warm the cache with the defaults first.
    let before = selector.resolve("planner").await.unwrap();
    assert_eq!(before, "orion-large");

    model_db::set_model_config(&pool, "planner", "orion-custom")
        .await
        .unwrap();

    // Stale read is tolerated until invalidation.
    selector.invalidate().await;
    let after = selector.resolve("planner").await.unwrap();
    assert_eq!(after, "orion-custom");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resolution_falls_through_to_the_universal_fallback() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_secs(60));

    // A position outside both config and defaults still resolves.
    let model = selector.resolve("coder_xl_low").await.unwrap();
    assert_eq!(model, FALLBACK_MODEL);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn short_ttl_picks_up_writes_without_invalidation() {
    let (pool, db_name) = create_test_db().await;
    let selector = ModelSelector::new(pool.clone(), Duration::from_millis(10));

    let before = selector.resolve("fixer").await.unwrap();
    assert_eq!(before, "orion-medium");

    model_db::set_model_config(&pool, "fixer", "orion-max")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let after = selector.resolve("fixer").await.unwrap();
    assert_eq!(after, "orion-max");

    pool.close().await;
    drop_test_db(&db_name).await;
}
