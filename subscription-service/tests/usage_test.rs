//! Usage ledger and quota tests.

mod common;

use common::{at, drain, user, TestApp};
use subscription_service::config::FeatureConfig;
use subscription_service::error::SubscriptionError;
use subscription_service::models::{Quota, UNLIMITED};
use subscription_service::services::{FeatureManagerConfig, SubscriptionEvent};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn overage_is_recorded_but_blocks_further_use() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "exports", 5).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert!(assert_ok!(quota.can_use(&sub, "exports").await));
    assert_ok!(quota.record_usage(&sub, "exports", 3, true).await);
    app.set_time(at(2025, 1, 10));
    let record = assert_ok!(quota.record_usage(&sub, "exports", 3, true).await);

    assert_eq!(record.used, 6);
    let status = assert_ok!(quota.quota_status(&sub, "exports").await);
    assert_eq!(status.quota, Quota::Limited(5));
    assert_eq!(status.used, 6);
    assert_eq!(status.remaining, -1);
    assert_eq!(status.display_remaining(), 0);
    assert!(!status.can_use);
    assert!(!assert_ok!(quota.can_use(&sub, "exports").await));
}

#[tokio::test]
async fn first_usage_anchors_the_reset_at_subscription_creation() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "exports", 5).await;
    let sub = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 1, 20));
    let record = assert_ok!(
        app.state
            .quota
            .record_usage(&sub, "exports", 1, true)
            .await
    );
    assert_eq!(record.valid_until, Some(at(2025, 2, 1)));
}

#[tokio::test]
async fn expired_usage_resets_and_chains_from_the_previous_boundary() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "exports", 5).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.record_usage(&sub, "exports", 5, true).await);
    assert!(!assert_ok!(quota.can_use(&sub, "exports").await));

    app.set_time(at(2025, 2, 10));
    assert_eq!(assert_ok!(quota.usage(&sub, "exports").await), 0);
    assert!(assert_ok!(quota.can_use(&sub, "exports").await));

    let record = assert_ok!(quota.record_usage(&sub, "exports", 2, true).await);
    assert_eq!(record.used, 2);
    assert_eq!(record.valid_until, Some(at(2025, 3, 1)));
    assert_eq!(assert_ok!(quota.remaining(&sub, "exports").await), 3);
}

#[tokio::test]
async fn lifetime_features_never_reset() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.lifetime_feature(&plan, "projects", 3).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    let record = assert_ok!(quota.record_usage(&sub, "projects", 2, true).await);
    assert_eq!(record.valid_until, None);

    app.set_time(at(2027, 1, 1));
    assert_eq!(assert_ok!(quota.usage(&sub, "projects").await), 2);
}

#[tokio::test]
async fn non_incremental_usage_replaces_the_value() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.lifetime_feature(&plan, "seats", 10).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.record_usage(&sub, "seats", 4, true).await);
    let record = assert_ok!(quota.record_usage(&sub, "seats", 7, false).await);
    assert_eq!(record.used, 7);
}

#[tokio::test]
async fn reduce_reverses_record_and_floors_at_zero() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "exports", 10).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert!(assert_ok!(quota.reduce_usage(&sub, "exports", 1).await).is_none());

    assert_ok!(quota.record_usage(&sub, "exports", 2, true).await);
    assert_ok!(quota.record_usage(&sub, "exports", 3, true).await);
    let reduced = assert_ok!(quota.reduce_usage(&sub, "exports", 3).await).unwrap();
    assert_eq!(reduced.used, 2);

    let reduced = assert_ok!(quota.reduce_usage(&sub, "exports", 50).await).unwrap();
    assert_eq!(reduced.used, 0);
}

#[tokio::test]
async fn unlimited_and_disabled_features() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "api-calls", UNLIMITED).await;
    app.monthly_feature(&plan, "sso", 0).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.record_usage(&sub, "api-calls", 1_000_000, true).await);
    assert!(assert_ok!(quota.can_use(&sub, "api-calls").await));
    assert_eq!(
        assert_ok!(quota.total_feature_balance(&sub, "api-calls").await),
        UNLIMITED
    );

    assert!(!assert_ok!(quota.can_use(&sub, "sso").await));
    assert_ok!(quota.record_usage(&sub, "sso", 0, true).await);
    assert!(!assert_ok!(quota.can_use(&sub, "sso").await));
}

#[tokio::test]
async fn unknown_feature_is_not_found() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    let err = assert_err!(
        app.state
            .quota
            .record_usage(&sub, "missing", 1, true)
            .await
    );
    assert!(matches!(err, SubscriptionError::NotFound(_)));
}

#[tokio::test]
async fn purchased_quantity_raises_the_ceiling() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.lifetime_feature(&plan, "seats", 2).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.record_usage(&sub, "seats", 2, true).await);
    assert!(!assert_ok!(quota.can_use(&sub, "seats").await));

    assert_ok!(quota.set_additional_quantity(&sub, "seats", 3).await);
    assert_eq!(assert_ok!(quota.additional_quantity(&sub, "seats").await), 3);
    assert_eq!(assert_ok!(quota.total_feature_balance(&sub, "seats").await), 5);
    assert_eq!(assert_ok!(quota.remaining(&sub, "seats").await), 3);
    assert!(assert_ok!(quota.can_use(&sub, "seats").await));

    let err = assert_err!(quota.set_additional_quantity(&sub, "seats", -1).await);
    assert!(matches!(err, SubscriptionError::InvalidCount(-1)));
}

#[tokio::test]
async fn purchased_quantity_can_be_left_out_of_remaining() {
    let app = TestApp::spawn_with(
        FeatureConfig {
            include_purchased: false,
            ..FeatureConfig::default()
        },
        FeatureManagerConfig::new(),
    );
    let plan = app.monthly_plan("basic").await;
    app.lifetime_feature(&plan, "seats", 2).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.set_additional_quantity(&sub, "seats", 3).await);
    assert_ok!(quota.record_usage(&sub, "seats", 2, true).await);

    assert_eq!(assert_ok!(quota.remaining(&sub, "seats").await), 0);
    assert!(!assert_ok!(quota.can_use(&sub, "seats").await));
    assert_eq!(assert_ok!(quota.total_feature_balance(&sub, "seats").await), 5);
}

#[tokio::test]
async fn feature_summary_lists_every_plan_feature() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.lifetime_feature(&plan, "projects", 3).await;
    app.monthly_feature(&plan, "exports", 10).await;
    let sub = app.subscribe(&user("1"), &plan).await;

    assert_ok!(
        app.state
            .quota
            .record_usage(&sub, "exports", 4, true)
            .await
    );
    let summary = assert_ok!(app.state.quota.feature_summary(&sub).await);

    let slugs: Vec<&str> = summary.iter().map(|s| s.feature_slug.as_str()).collect();
    assert_eq!(slugs, vec!["exports", "projects"]);
    assert_eq!(summary[0].used, 4);
    assert_eq!(summary[0].remaining, 6);
    assert_eq!(summary[1].used, 0);
    assert_eq!(summary[1].remaining, 3);
}

#[tokio::test]
async fn reset_expired_usage_honours_dry_run() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let feature = app.monthly_feature(&plan, "exports", 10).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    let quota = &app.state.quota;

    assert_ok!(quota.record_usage(&sub, "exports", 4, true).await);
    assert_eq!(assert_ok!(quota.reset_expired_usage(false).await), 0);

    app.set_time(at(2025, 2, 2));
    assert_eq!(assert_ok!(quota.reset_expired_usage(true).await), 1);
    let entry = app.usage_entry(sub.subscription_id, feature.feature_id).await;
    assert_eq!(entry.map(|e| e.used), Some(4));

    let mut events = app.events();
    assert_eq!(assert_ok!(quota.reset_expired_usage(false).await), 1);
    let entry = app
        .usage_entry(sub.subscription_id, feature.feature_id)
        .await
        .unwrap();
    assert_eq!(entry.used, 0);
    assert_eq!(entry.valid_until, None);
    assert_eq!(
        drain(&mut events),
        vec![SubscriptionEvent::UsageReset {
            subscription_id: sub.subscription_id,
            feature_id: feature.feature_id,
        }]
    );
    assert_eq!(assert_ok!(quota.reset_expired_usage(false).await), 0);
}
