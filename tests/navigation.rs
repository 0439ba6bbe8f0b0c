//! End-to-end coverage of the navigator wired through the public `Spf`
//! facade, using the in-memory fakes from `spf::testing`.

use std::sync::Arc;

use spf::config::SpfConfig;
use spf::testing::{dom, snapshot_store, GatedTransport, InMemoryHistoryBackend, ScriptedTransport};
use spf::{NavigationOutcome, NoopDiagnostics, Response, Spf};

fn build(transport: Arc<ScriptedTransport>) -> Spf {
    Spf::new(
        SpfConfig::default(),
        dom(),
        Arc::new(InMemoryHistoryBackend::default()),
        transport,
        snapshot_store(),
        Arc::new(NoopDiagnostics),
        "/start",
    )
    .expect("facade construction never fails for in-memory collaborators")
}

#[tokio::test]
async fn multipart_response_is_applied_in_declared_order() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_response(
        "/article?spf=navigate",
        vec![
            Response {
                title: Some("Article".into()),
                ..Default::default()
            },
            Response {
                body: [("main".to_string(), "<p>hi</p>".to_string())].into_iter().collect(),
                ..Default::default()
            },
        ],
    );
    let spf = build(transport);
    let outcome = spf.navigate("/article").await;
    assert!(matches!(outcome, NavigationOutcome::Completed { .. }));
}

#[tokio::test]
async fn session_cap_forces_full_page_load_once_reached() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_response("/a?spf=navigate", vec![Response::default()]);
    transport.push_response("/b?spf=navigate", vec![Response::default()]);

    let mut config = SpfConfig::default();
    config.navigate_limit = Some(1);
    config.navigate_lifetime_ms = 60_000;
    let spf = Spf::new(
        config,
        dom(),
        Arc::new(InMemoryHistoryBackend::default()),
        transport,
        snapshot_store(),
        Arc::new(NoopDiagnostics),
        "/start",
    )
    .unwrap();

    let first = spf.navigate("/a").await;
    assert!(matches!(first, NavigationOutcome::Completed { .. }));

    let second = spf.navigate("/b").await;
    match second {
        NavigationOutcome::FullPageLoad { url, .. } => assert_eq!(url, "/b"),
        other => panic!("expected FullPageLoad once navigate-limit is reached, got {other:?}"),
    }
}

#[tokio::test]
async fn redirect_response_navigates_to_the_new_target() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_response(
        "/old?spf=navigate",
        vec![Response {
            redirect: Some("/new".into()),
            ..Default::default()
        }],
    );
    transport.push_response(
        "/new?spf=navigate",
        vec![Response {
            title: Some("New".into()),
            ..Default::default()
        }],
    );
    let spf = build(transport);
    let outcome = spf.navigate("/old").await;
    match outcome {
        NavigationOutcome::Completed { url } => assert_eq!(url, "/new"),
        other => panic!("expected redirect to complete at /new, got {other:?}"),
    }
}

#[tokio::test]
async fn promotion_reuses_the_in_flight_prefetch_instead_of_duplicating_request() {
    let transport = Arc::new(GatedTransport::new(Response {
        title: Some("Promoted".into()),
        ..Default::default()
    }));
    let spf = Arc::new(
        Spf::new(
            SpfConfig::default(),
            dom(),
            Arc::new(InMemoryHistoryBackend::default()),
            transport.clone(),
            snapshot_store(),
            Arc::new(NoopDiagnostics),
            "/start",
        )
        .unwrap(),
    );

    let prefetch_spf = spf.clone();
    let prefetch_task = tokio::spawn(async move { prefetch_spf.prefetch("/shared").await });
    transport.wait_until_started().await;

    let navigate_spf = spf.clone();
    let navigate_task = tokio::spawn(async move { navigate_spf.navigate("/shared").await });

    transport.release();

    let prefetch_outcome = prefetch_task.await.unwrap();
    let navigate_outcome = navigate_task.await.unwrap();

    assert_eq!(transport.call_count(), 1, "promotion must not issue a second transport request");
    assert!(matches!(prefetch_outcome, NavigationOutcome::Completed { .. }));
    match navigate_outcome {
        NavigationOutcome::Completed { url } => assert_eq!(url, "/shared"),
        other => panic!("expected the promoted navigation to complete, got {other:?}"),
    }
}

#[tokio::test]
async fn dispatcher_sees_request_and_done_topics_in_order() {
    use parking_lot::Mutex;
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_response(
        "/topic?spf=navigate",
        vec![Response {
            title: Some("T".into()),
            ..Default::default()
        }],
    );
    let spf = build(transport);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for topic in ["spf_request", "spf_received", "spf_done"] {
        let seen = seen.clone();
        let topic_owned = topic.to_string();
        spf.subscribe(topic, move |_t: &str, _a: &spf::Args| {
            seen.lock().push(topic_owned.clone());
        });
    }
    spf.navigate("/topic").await;
    assert_eq!(*seen.lock(), vec!["spf_request", "spf_received", "spf_done"]);
}
