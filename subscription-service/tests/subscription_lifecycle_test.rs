//! Subscription lifecycle tests: create, cancel, renew, activate, delete and restore.

mod common;

use common::{at, drain, user, TestApp};
use subscription_service::error::SubscriptionError;
use subscription_service::models::{NewSubscription, SubscriptionState};
use subscription_service::services::SubscriptionEvent;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn create_without_trial_starts_billing_immediately() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let mut events = app.events();

    let sub = app.subscribe(&user("1"), &plan).await;

    assert_eq!(sub.starts_at, Some(at(2025, 1, 1)));
    assert_eq!(sub.ends_at, Some(at(2025, 2, 1)));
    assert_eq!(sub.trial_ends_at, Some(at(2025, 1, 1)));
    assert!(sub.is_active);
    assert!(!sub.is_paid);
    assert_eq!(sub.state(at(2025, 1, 2)), SubscriptionState::Active);

    let events = drain(&mut events);
    assert_eq!(events, vec![SubscriptionEvent::Created(sub)]);
}

#[tokio::test]
async fn create_with_trial_starts_billing_after_trial() {
    let app = TestApp::spawn();
    let plan = app.plan_with_trial("trial", 14).await;

    let sub = app.subscribe(&user("1"), &plan).await;

    assert_eq!(sub.trial_ends_at, Some(at(2025, 1, 15)));
    assert_eq!(sub.starts_at, Some(at(2025, 1, 15)));
    assert_eq!(sub.ends_at, Some(at(2025, 2, 15)));
    assert!(sub.on_trial(at(2025, 1, 1)));
    assert_eq!(sub.state(at(2025, 1, 1)), SubscriptionState::Trial);
}

#[tokio::test]
async fn create_with_explicit_start_anchors_the_trial() {
    let app = TestApp::spawn();
    let plan = app.plan_with_trial("trial", 7).await;

    let sub = assert_ok!(
        app.state
            .subscriptions
            .create(
                NewSubscription::new(user("1"), "main").starting_at(at(2025, 3, 1)),
                plan.plan_id,
            )
            .await
    );

    assert_eq!(sub.trial_ends_at, Some(at(2025, 3, 8)));
    assert_eq!(sub.ends_at, Some(at(2025, 4, 8)));
    assert_eq!(sub.created_utc, at(2025, 1, 1));
}

#[tokio::test]
async fn create_for_unknown_plan_is_not_found() {
    let app = TestApp::spawn();
    let err = assert_err!(
        app.state
            .subscriptions
            .create(NewSubscription::new(user("1"), "main"), uuid::Uuid::new_v4())
            .await
    );
    assert!(matches!(err, SubscriptionError::NotFound(_)));
}

#[tokio::test]
async fn second_create_cancels_the_previous_subscription_immediately() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let pro = app.monthly_plan("pro").await;

    let first = app.subscribe(&user("1"), &basic).await;
    app.advance_days(5);
    let mut events = app.events();
    let second = app.subscribe(&user("1"), &pro).await;

    let first = app.stored(first.subscription_id).await;
    assert!(!first.is_active);
    assert_eq!(first.canceled_at, Some(at(2025, 1, 6)));
    assert_eq!(first.ends_at, Some(at(2025, 1, 6)));
    assert!(second.is_active);
    assert_eq!(app.active_count(&user("1")).await, 1);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Updated(first),
            SubscriptionEvent::Created(second)
        ]
    );
}

#[tokio::test]
async fn other_subscribers_are_untouched() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;

    let alice = app.subscribe(&user("alice"), &plan).await;
    app.subscribe(&user("bob"), &plan).await;

    let alice = app.stored(alice.subscription_id).await;
    assert!(alice.is_active);
    assert_eq!(app.active_count(&user("alice")).await, 1);
    assert_eq!(app.active_count(&user("bob")).await, 1);
}

#[tokio::test]
async fn cancel_at_period_end_keeps_the_period() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 1, 10));
    let canceled = assert_ok!(
        app.state
            .subscriptions
            .cancel(sub.subscription_id, false)
            .await
    );

    assert_eq!(canceled.canceled_at, Some(at(2025, 1, 10)));
    assert_eq!(canceled.ends_at, Some(at(2025, 2, 1)));
    assert!(!canceled.is_active);
    assert_eq!(
        canceled.state(at(2025, 1, 11)),
        SubscriptionState::CanceledPending
    );
    assert_eq!(canceled.state(at(2025, 2, 1)), SubscriptionState::Ended);

    // Repeating the call is harmless.
    app.set_time(at(2025, 1, 12));
    let again = assert_ok!(
        app.state
            .subscriptions
            .cancel(sub.subscription_id, false)
            .await
    );
    assert_eq!(again.ends_at, Some(at(2025, 2, 1)));
    assert!(!again.is_active);
}

#[tokio::test]
async fn cancel_immediately_ends_now() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 1, 10));
    let canceled = assert_ok!(
        app.state
            .subscriptions
            .cancel(sub.subscription_id, true)
            .await
    );

    assert_eq!(canceled.ends_at, Some(at(2025, 1, 10)));
    assert!(canceled.ended(at(2025, 1, 10)));
    assert!(!assert_ok!(
        app.state
            .subscriptions
            .has_active_subscription(&user("1"))
            .await
    ));
}

#[tokio::test]
async fn renew_of_ended_and_canceled_subscription_is_rejected() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    assert_ok!(
        app.state
            .subscriptions
            .cancel(sub.subscription_id, true)
            .await
    );

    let err = assert_err!(app.state.subscriptions.renew(sub.subscription_id).await);
    assert!(matches!(err, SubscriptionError::InvalidState(_)));
}

#[tokio::test]
async fn renew_of_ended_but_not_canceled_subscription_starts_a_new_period() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 3, 15));
    let renewed = assert_ok!(app.state.subscriptions.renew(sub.subscription_id).await);

    assert_eq!(renewed.starts_at, Some(at(2025, 3, 15)));
    assert_eq!(renewed.ends_at, Some(at(2025, 4, 15)));
    assert!(renewed.is_active);
}

#[tokio::test]
async fn renew_clears_cancellation_and_usage() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    app.monthly_feature(&plan, "api-calls", 10).await;
    let sub = app.subscribe(&user("1"), &plan).await;

    assert_ok!(
        app.state
            .quota
            .record_usage(&sub, "api-calls", 4, true)
            .await
    );
    app.set_time(at(2025, 1, 10));
    assert_ok!(
        app.state
            .subscriptions
            .cancel(sub.subscription_id, false)
            .await
    );

    app.set_time(at(2025, 1, 20));
    let renewed = assert_ok!(app.state.subscriptions.renew(sub.subscription_id).await);

    assert_eq!(renewed.canceled_at, None);
    assert!(renewed.is_active);
    assert_eq!(renewed.starts_at, Some(at(2025, 1, 20)));
    assert_eq!(renewed.ends_at, Some(at(2025, 2, 20)));
    assert_eq!(
        assert_ok!(app.state.quota.usage(&renewed, "api-calls").await),
        0
    );
}

#[tokio::test]
async fn renew_deactivates_the_other_active_subscription() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let pro = app.monthly_plan("pro").await;

    let old = app.subscribe(&user("1"), &basic).await;
    app.set_time(at(2025, 1, 5));
    assert_ok!(
        app.state
            .subscriptions
            .cancel(old.subscription_id, false)
            .await
    );
    app.set_time(at(2025, 1, 6));
    let current = app.subscribe(&user("1"), &pro).await;

    app.set_time(at(2025, 1, 7));
    let mut events = app.events();
    let renewed = assert_ok!(app.state.subscriptions.renew(old.subscription_id).await);

    let current = app.stored(current.subscription_id).await;
    assert!(!current.is_active);
    assert_eq!(current.canceled_at, None);
    assert!(renewed.is_active);
    assert_eq!(app.active_count(&user("1")).await, 1);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Updated(current),
            SubscriptionEvent::Updated(renewed)
        ]
    );
}

#[tokio::test]
async fn activate_flips_siblings_off() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;

    let first = app.subscribe(&user("1"), &plan).await;
    app.set_time(at(2025, 1, 2));
    let second = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 1, 3));
    let first = assert_ok!(app.state.subscriptions.activate(first.subscription_id).await);

    let second = app.stored(second.subscription_id).await;
    assert!(first.is_active);
    assert!(!second.is_active);
    assert_eq!(app.active_count(&user("1")).await, 1);
}

#[tokio::test]
async fn mark_paid_sets_the_flag() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let sub = app.subscribe(&user("1"), &plan).await;

    let paid = assert_ok!(
        app.state
            .subscriptions
            .mark_paid(sub.subscription_id, true)
            .await
    );
    assert!(paid.is_paid);
    assert!(paid.is_active);
}

#[tokio::test]
async fn delete_hides_the_subscription_and_drops_usage() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;
    let feature = app.lifetime_feature(&plan, "projects", 5).await;
    let sub = app.subscribe(&user("1"), &plan).await;
    assert_ok!(
        app.state
            .quota
            .record_usage(&sub, "projects", 2, true)
            .await
    );

    let mut events = app.events();
    let deleted = assert_ok!(app.state.subscriptions.delete(sub.subscription_id).await);

    assert!(deleted.is_deleted());
    assert_eq!(deleted.state(at(2025, 1, 2)), SubscriptionState::Deleted);
    let err = assert_err!(app.state.subscriptions.get(sub.subscription_id).await);
    assert!(matches!(err, SubscriptionError::NotFound(_)));
    assert_eq!(app.active_count(&user("1")).await, 0);
    assert!(app.usage_entry(sub.subscription_id, feature.feature_id).await.is_none());

    let events = drain(&mut events);
    assert_eq!(events, vec![SubscriptionEvent::Deleted(deleted)]);

    // A copy taken before the delete cannot write usage back.
    let err = assert_err!(app.state.quota.record_usage(&sub, "projects", 2, true).await);
    assert!(matches!(err, SubscriptionError::InvalidState(_)));
    let err = assert_err!(app.state.quota.reduce_usage(&sub, "projects", 1).await);
    assert!(matches!(err, SubscriptionError::InvalidState(_)));
    assert!(app.usage_entry(sub.subscription_id, feature.feature_id).await.is_none());

    let err = assert_err!(app.state.subscriptions.cancel(sub.subscription_id, true).await);
    assert!(matches!(err, SubscriptionError::NotFound(_)));
}

#[tokio::test]
async fn restore_brings_the_subscription_back_as_the_only_active_one() {
    let app = TestApp::spawn();
    let plan = app.monthly_plan("basic").await;

    let original = app.subscribe(&user("1"), &plan).await;
    assert_ok!(app.state.subscriptions.delete(original.subscription_id).await);
    app.set_time(at(2025, 1, 2));
    let replacement = app.subscribe(&user("1"), &plan).await;

    app.set_time(at(2025, 1, 3));
    let mut events = app.events();
    let restored = assert_ok!(
        app.state
            .subscriptions
            .restore(original.subscription_id)
            .await
    );

    assert!(!restored.is_deleted());
    assert!(restored.is_active);
    let replacement = app.stored(replacement.subscription_id).await;
    assert!(!replacement.is_active);
    assert_eq!(app.active_count(&user("1")).await, 1);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Updated(replacement),
            SubscriptionEvent::Restored(restored.clone())
        ]
    );

    let err = assert_err!(
        app.state
            .subscriptions
            .restore(restored.subscription_id)
            .await
    );
    assert!(matches!(err, SubscriptionError::InvalidState(_)));
}

#[tokio::test]
async fn subscriber_lookups() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let pro = app.monthly_plan("pro").await;
    let subscriber = user("1");

    assert!(!assert_ok!(
        app.state
            .subscriptions
            .has_active_subscription(&subscriber)
            .await
    ));

    app.subscribe(&subscriber, &basic).await;
    app.set_time(at(2025, 1, 2));
    let current = app.subscribe(&subscriber, &pro).await;

    let subs = &app.state.subscriptions;
    assert_eq!(assert_ok!(subs.subscriptions(&subscriber).await).len(), 2);
    assert_eq!(
        assert_ok!(subs.active_subscription(&subscriber).await),
        Some(current)
    );
    assert!(assert_ok!(subs.subscribed_to(&subscriber, pro.plan_id).await));
    assert!(!assert_ok!(subs.subscribed_to(&subscriber, basic.plan_id).await));

    let plans = assert_ok!(subs.subscribed_plans(&subscriber).await);
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan_id, pro.plan_id);
}

#[tokio::test]
async fn subscriptions_can_be_found_by_name() {
    let app = TestApp::spawn();
    let basic = app.monthly_plan("basic").await;
    let subscriber = user("1");
    let main = app.subscribe(&subscriber, &basic).await;
    let side = assert_ok!(
        app.state
            .subscriptions
            .create(NewSubscription::new(subscriber.clone(), "side"), basic.plan_id)
            .await
    );
    let subs = &app.state.subscriptions;

    let found = assert_ok!(subs.subscription_named(&subscriber, "main").await);
    assert_eq!(found.map(|s| s.subscription_id), Some(main.subscription_id));
    let found = assert_ok!(subs.subscription_named(&subscriber, "side").await);
    assert_eq!(found.map(|s| s.subscription_id), Some(side.subscription_id));
    assert!(assert_ok!(subs.subscription_named(&subscriber, "other").await).is_none());
    assert!(assert_ok!(subs.subscription_named(&user("2"), "main").await).is_none());

    assert_ok!(subs.delete(side.subscription_id).await);
    assert!(assert_ok!(subs.subscription_named(&subscriber, "side").await).is_none());
}
