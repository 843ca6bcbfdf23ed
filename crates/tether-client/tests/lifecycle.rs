//! Query host lifecycle: readiness, errors, teardown, reconnects and commands.
#![allow(missing_docs)]

mod common;

use common::setup;
use serde_json::json;
use std::time::Duration;
use tether_client::{CommandError, QueryState};
use tether_core::{
    ActorId, Command, FlowEvent, Notification, QueryDef, QueryResult, TetherError, ViewKey,
    ViewQueryDef, ViewValue,
};
use tether_testkit::fixtures::{self, changed, item_added, sub, synced};
use tether_testkit::ConnectionCall;

fn name_result(name: &str, change_id: u64) -> QueryResult {
    QueryResult::empty().with_view("name", fixtures::value(json!(name), change_id))
}

#[tokio::test]
async fn reference_without_sub_query_loads_on_own_marker() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty().with_view("manager", fixtures::reference(Some("u2"), 1, None)),
    );
    let host = system.root_host(QueryDef::new("User").reference("manager", QueryDef::new("User")));
    host.run("u1").await.unwrap();
    assert_eq!(host.state(), QueryState::Created);

    system.handle_notification(synced("User", "u1", "manager", 1)).await;
    assert_eq!(host.state(), QueryState::Loaded);
}

#[tokio::test]
async fn reference_waits_for_referenced_entity() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty().with_view(
            "manager",
            fixtures::reference(Some("u2"), 1, Some(name_result("Bob", 1))),
        ),
    );
    let query = QueryDef::new("User").reference("manager", QueryDef::new("User").value("name"));
    let host = system.root_host(query);
    host.run("u1").await.unwrap();

    system.handle_notification(synced("User", "u1", "manager", 1)).await;
    assert_eq!(host.state(), QueryState::Created);

    system.handle_notification(synced("User", "u2", "name", 1)).await;
    assert_eq!(host.state(), QueryState::Loaded);
    assert_eq!(
        host.view("manager").unwrap().ref_host().unwrap().state(),
        QueryState::Loaded
    );
}

#[tokio::test]
async fn list_waits_for_every_item() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty().with_view(
            "friends",
            fixtures::list(
                &[("a", "u2"), ("b", "u3")],
                1,
                "p1",
                vec![name_result("Bob", 1), name_result("Cy", 1)],
            ),
        ),
    );
    let host = system.root_host(QueryDef::new("User").list("friends", QueryDef::new("User").value("name")));
    host.run("u1").await.unwrap();

    system.handle_notification(synced("User", "u1", "friends", 1)).await;
    system.handle_notification(synced("User", "u2", "name", 1)).await;
    assert_eq!(host.state(), QueryState::Created);

    system.handle_notification(synced("User", "u3", "name", 1)).await;
    assert_eq!(host.state(), QueryState::Loaded);
    let friends = host.view("friends").unwrap();
    assert_eq!(friends.page_id().as_deref(), Some("p1"));
    assert_eq!(
        friends.subscriptions()[0],
        sub("User", "u1", "friends").with_page("p1")
    );
}

#[tokio::test]
async fn unsubscribed_views_are_ready_at_once() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let query = QueryDef::new("User").with_view("name", ViewQueryDef::value().without_subscription());
    let host = system.root_host(query);
    host.run("u1").await.unwrap();

    assert_eq!(host.state(), QueryState::Loaded);
    assert!(host.subscriptions().is_empty());
    let key = ViewKey::new("User", ActorId::new("u1"), "name");
    assert_eq!(system.store().listener_count(&key), 0);
}

#[tokio::test]
async fn detached_host_can_run_again() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let host = system.root_host(QueryDef::new("User").value("name"));
    host.run("u1").await.unwrap();
    system.handle_notification(synced("User", "u1", "name", 1)).await;
    assert_eq!(host.state(), QueryState::Loaded);

    host.detach();
    let view = host.view("name").unwrap();
    assert_eq!(host.state(), QueryState::Created);
    assert_eq!(host.actor_id(), None);
    assert_eq!(view.value(), None);
    assert!(!view.is_attached());

    host.run("u1").await.unwrap();
    assert_eq!(host.state(), QueryState::Loaded);
    assert_eq!(view.value(), Some(ViewValue::Value(json!("Ada"))));
    assert_eq!(mock.query_count(), 2);
}

#[tokio::test]
async fn fetch_failure_settles_in_error() {
    let (mock, system) = setup();
    mock.fail_queries(true);
    let host = system.root_host(QueryDef::new("User").value("name"));

    host.run("u1").await.unwrap();
    assert!(matches!(
        host.wait_until_settled().await,
        QueryState::Error(TetherError::Transport { .. })
    ));
    assert_eq!(system.synchronizer().in_flight(), 0);
    assert!(host.subscriptions().is_empty());
}

#[tokio::test]
async fn unrequested_view_in_result_is_a_protocol_mismatch() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        name_result("Ada", 1).with_view("age", fixtures::value(json!(36), 1)),
    );
    let host = system.root_host(QueryDef::new("User").value("name"));

    let err = host.run("u1").await.unwrap_err();
    assert!(matches!(err, TetherError::ProtocolMismatch { .. }));
    assert_eq!(host.state(), QueryState::Error(err));
    assert_eq!(system.synchronizer().in_flight(), 0);
}

#[tokio::test]
async fn result_of_wrong_kind_is_rejected() {
    let (mock, system) = setup();
    mock.respond("User", "u1", QueryResult::empty().with_view("manager", fixtures::value(json!("u2"), 1)));
    let host = system.root_host(QueryDef::new("User").reference("manager", QueryDef::new("User")));

    let err = host.run("u1").await.unwrap_err();
    assert_eq!(
        err,
        TetherError::view_kind_mismatch("manager", "ref", "value")
    );
    assert!(!host.view("manager").unwrap().is_attached());
}

#[tokio::test]
async fn failed_view_attach_unbinds_views_already_attached() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty()
            .with_view("alias", fixtures::value(json!("ada"), 1))
            .with_view("manager", fixtures::value(json!("u2"), 1)),
    );
    let query = QueryDef::new("User")
        .value("alias")
        .reference("manager", QueryDef::new("User"));
    let host = system.root_host(query);

    let err = host.run("u1").await.unwrap_err();
    assert_eq!(err, TetherError::view_kind_mismatch("manager", "ref", "value"));
    assert_eq!(host.actor_id(), None);
    assert!(!host.view("alias").unwrap().is_attached());
    assert!(matches!(host.state(), QueryState::Error(_)));
    assert_eq!(
        mock.unsubscribe_calls().concat(),
        vec![sub("User", "u1", "alias"), sub("User", "u1", "manager")]
    );
    assert_eq!(system.subscription_count(&sub("User", "u1", "alias")), 0);
}

#[tokio::test]
async fn failed_rerun_releases_old_and_new_bindings() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty()
            .with_view("alias", fixtures::value(json!("ada"), 1))
            .with_view("manager", fixtures::reference(Some("u3"), 1, None)),
    );
    mock.respond(
        "User",
        "u2",
        QueryResult::empty()
            .with_view("alias", fixtures::value(json!("bob"), 1))
            .with_view("manager", fixtures::value(json!("u3"), 1)),
    );
    let query = QueryDef::new("User")
        .value("alias")
        .reference("manager", QueryDef::new("User"));
    let host = system.root_host(query);
    host.run("u1").await.unwrap();

    host.run("u2").await.unwrap_err();
    let mut released = mock.unsubscribe_calls().concat();
    released.sort();
    assert_eq!(
        released,
        vec![
            sub("User", "u1", "alias"),
            sub("User", "u1", "manager"),
            sub("User", "u2", "alias"),
            sub("User", "u2", "manager"),
        ]
    );
    for id in ["u1", "u2"] {
        assert_eq!(system.subscription_count(&sub("User", id, "alias")), 0);
    }
    assert!(host.subscriptions().is_empty());
}

#[tokio::test]
async fn accessors_reject_misuse() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        name_result("Ada", 1).with_view("friends", fixtures::list(&[("a", "u2")], 1, "p1", Vec::new())),
    );
    let query = QueryDef::new("User")
        .value("name")
        .list("friends", QueryDef::new("User"));
    let host = system.root_host(query);
    host.run("u1").await.unwrap();

    assert!(matches!(
        host.view("missing"),
        Err(TetherError::ProtocolMismatch { .. })
    ));
    let name = host.view("name").unwrap();
    assert!(matches!(name.ref_host(), Err(TetherError::ViewKindMismatch { .. })));
    assert!(matches!(name.count(), Err(TetherError::ViewKindMismatch { .. })));
    assert_eq!(
        host.view("friends").unwrap().list_item(5),
        Err(TetherError::IndexOutOfBounds { index: 5, len: 1 })
    );
}

#[tokio::test]
async fn stopped_host_ignores_run() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let host = system.root_host(QueryDef::new("User").value("name"));
    host.stop();

    host.run("u1").await.unwrap();
    assert!(host.is_stopped());
    assert_eq!(host.state(), QueryState::Stopped);
    assert_eq!(mock.query_count(), 0);
    assert!(host.views().is_empty());
}

#[tokio::test]
async fn reconnect_resubscribes_live_roots() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let host = system.root_host(QueryDef::new("User").value("name"));
    host.run("u1").await.unwrap();
    system.handle_notification(synced("User", "u1", "name", 1)).await;
    mock.clear_calls();

    mock.respond("User", "u1", name_result("Ada B.", 4));
    system.handle_notification(Notification::Reconnected).await;

    assert_eq!(mock.unsubscribe_calls(), vec![vec![sub("User", "u1", "name")]]);
    assert_eq!(mock.query_count(), 1);
    assert_eq!(host.state(), QueryState::Created);
    assert_eq!(system.subscription_count(&sub("User", "u1", "name")), 1);
    assert_eq!(
        host.view("name").unwrap().value(),
        Some(ViewValue::Value(json!("Ada B.")))
    );

    system.handle_notification(synced("User", "u1", "name", 4)).await;
    assert_eq!(host.state(), QueryState::Loaded);
}

#[tokio::test]
async fn shutdown_stops_roots_and_forgets_state() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let host = system.root_host(QueryDef::new("User").value("name"));
    host.run("u1").await.unwrap();
    system
        .handle_notification(changed("User", "u1", "name", 2, fixtures::set(json!("Grace"))))
        .await;

    system.shutdown();
    let key = ViewKey::new("User", ActorId::new("u1"), "name");
    assert_eq!(host.state(), QueryState::Stopped);
    assert_eq!(system.subscription_count(&sub("User", "u1", "name")), 0);
    assert_eq!(system.store().history_len(&key), 0);
    assert_eq!(system.store().listener_count(&key), 0);
}

#[tokio::test]
async fn welcome_authenticates_session() {
    let (_mock, system) = setup();
    assert_eq!(system.user_id(), None);
    system
        .handle_notification(Notification::Welcome {
            user_id: "alice".to_string(),
        })
        .await;
    assert_eq!(system.user_id().as_deref(), Some("alice"));
}

#[tokio::test]
async fn fetch_only_query_leaves_no_subscriptions() {
    let (mock, system) = setup();
    mock.respond("User", "u1", name_result("Ada", 1));
    let query = QueryDef::new("User").value("name");

    let result = system.query(&ActorId::new("u1"), "profile", &query).await.unwrap();
    assert_eq!(result, name_result("Ada", 1));
    assert_eq!(
        mock.calls(),
        vec![ConnectionCall::Query {
            entity_name: "User".to_string(),
            actor_id: ActorId::new("u1"),
            name: "profile".to_string(),
        }]
    );
    assert_eq!(system.subscription_count(&sub("User", "u1", "name")), 0);
}

#[tokio::test]
async fn commands_reach_the_transport() {
    let (mock, system) = setup();
    let id = ActorId::new("u1");
    let rename = Command::new("rename", json!({ "name": "Grace" }));

    system.send("User", &id, &rename).await.unwrap();
    let answer = system.call("User", &id, &rename).await.unwrap();
    assert_eq!(answer.name, "rename");
    assert_eq!(answer.id, id);

    let flow = system
        .dispatch_event(&FlowEvent {
            name: "onboard".to_string(),
            payload: json!({}),
        })
        .await
        .unwrap();
    assert_eq!(flow.flow_id, "flow-onboard");
    assert!(matches!(mock.calls()[0], ConnectionCall::Send { .. }));
}

#[tokio::test(start_paused = true)]
async fn slow_call_times_out() {
    let (mock, system) = setup();
    mock.delay_replies(Duration::from_secs(60));

    let err = system
        .call("User", &ActorId::new("u1"), &Command::new("ping", json!(null)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err, CommandError::timeout("ping", Duration::from_secs(10)));
}

#[tokio::test]
async fn refused_dispatch_is_returned_to_caller() {
    let (mock, system) = setup();
    mock.reply_to_dispatch(Err(TetherError::protocol_mismatch("unknown flow")));

    let err = system
        .dispatch_event(&FlowEvent {
            name: "nope".to_string(),
            payload: json!(null),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Rejected { .. }));
}

#[tokio::test]
async fn added_list_item_loads_its_edge_attributes() {
    let (mock, system) = setup();
    mock.respond(
        "User",
        "u1",
        QueryResult::empty().with_view("friends", fixtures::list(&[], 1, "p1", Vec::new())),
    );
    mock.respond("User", "u2", name_result("Bob", 1));
    mock.respond(
        "User.friends",
        "u1:u2",
        QueryResult::empty().with_view("since", fixtures::value(json!("2019"), 1)),
    );
    let query = QueryDef::new("User").with_view(
        "friends",
        ViewQueryDef::list(QueryDef::new("User").value("name")).with_attrs(["since"]),
    );
    let host = system.root_host(query);
    host.run("u1").await.unwrap();

    system
        .handle_notification(changed("User", "u1", "friends", 2, item_added("p1", "a", "u2")))
        .await;

    let friends = host.view("friends").unwrap();
    let attributes = friends.item_attributes(&ActorId::new("u2")).unwrap().unwrap();
    assert_eq!(attributes.edge_id(), Some(ActorId::new("u1:u2")));
    assert_eq!(attributes.value("since"), Some(json!("2019")));
    let mut held = host.subscriptions();
    held.sort();
    assert_eq!(
        held,
        vec![
            sub("User", "u1", "friends").with_page("p1"),
            sub("User", "u2", "name"),
            sub("User.friends", "u1:u2", "since"),
        ]
    );
}
