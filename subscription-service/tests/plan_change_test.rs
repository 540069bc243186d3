//! Plan change tests.

mod common;

use common::{at, drain, user, TestApp};
use rust_decimal::Decimal;
use subscription_service::error::SubscriptionError;
use subscription_service::models::{BillingType, CreatePlan};
use subscription_service::services::SubscriptionEvent;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

#[tokio::test]
async fn same_cadence_keeps_period_and_usage() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let feature = app.monthly_feature(&basic, "exports", 10).await;
    let pro = app.monthly_plan("pro").await;
    let sub = app.subscribe(&user("1"), &basic).await;
    assert_ok!(app.state.quota.record_usage(&sub, "exports", 3, true).await);

    app.set_time(at(2025, 1, 15));
    let changed = assert_ok!(
        app.state
            .subscriptions
            .change_plan(sub.subscription_id, pro.plan_id)
            .await
    );

    assert_eq!(changed.plan_id, pro.plan_id);
    assert_eq!(changed.starts_at, sub.starts_at);
    assert_eq!(changed.ends_at, sub.ends_at);
    let entry = app
        .usage_entry(sub.subscription_id, feature.feature_id)
        .await
        .unwrap();
    assert_eq!(entry.used, 3);
}

#[tokio::test]
async fn different_cadence_starts_a_new_period_and_clears_usage() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let feature = app.monthly_feature(&basic, "exports", 10).await;
    let yearly = app.yearly_plan("annual").await;
    let sub = app.subscribe(&user("1"), &basic).await;
    assert_ok!(app.state.quota.record_usage(&sub, "exports", 3, true).await);

    app.set_time(at(2025, 1, 15));
    let mut events = app.events();
    let changed = assert_ok!(
        app.state
            .subscriptions
            .change_plan(sub.subscription_id, yearly.plan_id)
            .await
    );

    assert_eq!(changed.plan_id, yearly.plan_id);
    assert_eq!(changed.starts_at, Some(at(2025, 1, 15)));
    assert_eq!(changed.ends_at, Some(at(2026, 1, 15)));
    assert!(app
        .usage_entry(sub.subscription_id, feature.feature_id)
        .await
        .is_none());
    assert_eq!(
        drain(&mut events),
        vec![SubscriptionEvent::Updated(changed)]
    );
}

#[tokio::test]
async fn billing_type_follows_the_new_plan() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let mut input = CreatePlan::monthly("metered", "Metered", Decimal::new(500, 2));
    input.billing_type = BillingType::Payg;
    let metered = app.create_plan(input).await;
    let sub = app.subscribe(&user("1"), &basic).await;
    assert_eq!(sub.billing_type, "fixed");

    let changed = assert_ok!(
        app.state
            .subscriptions
            .change_plan(sub.subscription_id, metered.plan_id)
            .await
    );
    assert_eq!(changed.billing_type, "payg");
}

#[tokio::test]
async fn changing_to_an_unknown_plan_fails() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &basic).await;

    let err = assert_err!(
        app.state
            .subscriptions
            .change_plan(sub.subscription_id, Uuid::new_v4())
            .await
    );
    assert!(matches!(err, SubscriptionError::NotFound(_)));
    assert_eq!(app.stored(sub.subscription_id).await.plan_id, basic.plan_id);
}
