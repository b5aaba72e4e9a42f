//! End-to-end engine scenarios: producer mutations, subscriber fan-out,
//! durability, and version-history recovery, all against a temporary data
//! directory.

use drawbridge_core::{
    Element, ElementsSource, Engine, EngineError, ServerMessage, SessionStore, Viewport,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn rect(id: &str) -> Element {
    json!({"id": id, "type": "rectangle", "x": 10, "y": 10, "width": 50, "height": 20})
}

fn camera(width: f64, height: f64) -> Element {
    json!({"type": "cameraUpdate", "x": 0, "y": 0, "width": width, "height": height})
}

async fn engine(dir: &TempDir) -> Engine {
    Engine::new(dir.path()).await.expect("engine should open")
}

async fn subscriber(engine: &Engine, session: &str) -> UnboundedReceiver<ServerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.subscribe(session, tx).await.expect("subscribe should succeed");
    rx
}

fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    rx.try_recv().expect("a frame should be queued")
}

fn drain(rx: &mut UnboundedReceiver<ServerMessage>) {
    while rx.try_recv().is_ok() {}
}

#[tokio::test]
async fn set_then_get_round_trip() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    let (count, clients) = engine
        .set_elements("s1", vec![rect("a")], None)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(clients, 0);

    let scene = engine.scene("s1").await.unwrap();
    assert_eq!(scene.elements.len(), 1);
    assert_eq!(scene.elements[0]["id"], "a");
}

#[tokio::test]
async fn camera_elements_become_the_viewport() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine
        .set_elements("s2", vec![camera(400.0, 300.0), rect("r")], None)
        .await
        .unwrap();

    let scene = engine.scene("s2").await.unwrap();
    assert_eq!(scene.elements.len(), 1);
    assert_eq!(scene.elements[0]["id"], "r");
    assert_eq!(
        scene.viewport,
        Some(Viewport {
            x: 0.0,
            y: 0.0,
            width: 400.0,
            height: 300.0
        })
    );
}

#[tokio::test]
async fn camera_only_payload_broadcasts_empty_elements_then_viewport() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;
    let mut rx = subscriber(&engine, "s").await;
    drain(&mut rx);

    engine
        .set_elements("s", vec![camera(640.0, 480.0)], None)
        .await
        .unwrap();

    match next(&mut rx) {
        ServerMessage::Elements { elements, version, .. } => {
            assert!(elements.is_empty());
            assert_eq!(version, 1);
        }
        other => panic!("expected elements frame, got {other:?}"),
    }
    match next(&mut rx) {
        ServerMessage::Viewport { viewport } => {
            assert_eq!(viewport.width, 640.0);
            assert_eq!(viewport.height, 480.0);
        }
        other => panic!("expected viewport frame, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn fan_out_matches_mutation_order() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;
    let mut first = subscriber(&engine, "s3").await;
    let mut second = subscriber(&engine, "s3").await;
    drain(&mut first);
    drain(&mut second);

    engine.append_elements("s3", vec![rect("a")]).await.unwrap();
    engine.append_elements("s3", vec![rect("b")]).await.unwrap();
    engine.set_elements("s3", vec![rect("c")], None).await.unwrap();

    for rx in [&mut first, &mut second] {
        match next(rx) {
            ServerMessage::Append { elements } => assert_eq!(elements[0]["id"], "a"),
            other => panic!("expected append, got {other:?}"),
        }
        match next(rx) {
            ServerMessage::Append { elements } => assert_eq!(elements[0]["id"], "b"),
            other => panic!("expected append, got {other:?}"),
        }
        match next(rx) {
            ServerMessage::Elements { elements, .. } => assert_eq!(elements[0]["id"], "c"),
            other => panic!("expected elements, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn initial_state_carries_version_viewport_and_files() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    engine
        .set_viewport(
            "s",
            Viewport {
                x: 1.0,
                y: 2.0,
                width: 300.0,
                height: 200.0,
            },
        )
        .await
        .unwrap();
    engine
        .add_file("s", "f1".into(), "https://cdn.example/f1.png".into(), "image/png".into())
        .await
        .unwrap();

    let mut rx = subscriber(&engine, "s").await;
    match next(&mut rx) {
        ServerMessage::Elements { elements, version, .. } => {
            assert_eq!(elements.len(), 1);
            // Two logged mutations so far; file registration is not one.
            assert_eq!(version, 2);
        }
        other => panic!("expected elements frame, got {other:?}"),
    }
    assert!(matches!(next(&mut rx), ServerMessage::Viewport { .. }));
    match next(&mut rx) {
        ServerMessage::FilesMeta { files } => assert!(files.contains_key("f1")),
        other => panic!("expected files-meta frame, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_update_corrects_only_the_originator() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    let (tx_x, mut rx_x) = mpsc::unbounded_channel();
    let x = engine.subscribe("s4", tx_x).await.unwrap();
    match next(&mut rx_x) {
        ServerMessage::Elements { version, .. } => assert_eq!(version, 0),
        other => panic!("expected initial elements, got {other:?}"),
    }
    let mut rx_y = subscriber(&engine, "s4").await;
    drain(&mut rx_y);

    engine.set_elements("s4", vec![rect("p")], None).await.unwrap();
    drain(&mut rx_x);
    drain(&mut rx_y);

    engine
        .handle_update("s4", x, vec![rect("mine")], Some(0))
        .await
        .unwrap();

    match next(&mut rx_x) {
        ServerMessage::Elements { elements, version, source, .. } => {
            assert_eq!(source, Some(ElementsSource::VersionCorrection));
            assert_eq!(version, 1);
            assert_eq!(elements[0]["id"], "p");
        }
        other => panic!("expected correction frame, got {other:?}"),
    }
    assert!(rx_y.try_recv().is_err(), "stale writes must not fan out");

    let scene = engine.scene("s4").await.unwrap();
    assert_eq!(scene.elements[0]["id"], "p");
}

#[tokio::test]
async fn accepted_update_fans_out_to_everyone_but_the_originator() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    let (tx_x, mut rx_x) = mpsc::unbounded_channel();
    let x = engine.subscribe("s", tx_x).await.unwrap();
    let mut rx_y = subscriber(&engine, "s").await;
    drain(&mut rx_x);
    drain(&mut rx_y);

    engine
        .handle_update("s", x, vec![rect("edit")], None)
        .await
        .unwrap();

    assert!(rx_x.try_recv().is_err(), "updates must not echo back");
    match next(&mut rx_y) {
        ServerMessage::Elements { elements, version, source, .. } => {
            assert_eq!(elements[0]["id"], "edit");
            assert_eq!(version, 1);
            assert_eq!(source, None);
        }
        other => panic!("expected elements frame, got {other:?}"),
    }
}

#[tokio::test]
async fn undo_drops_the_newest_operation() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("s5", vec![rect("a")], None).await.unwrap();
    engine.append_elements("s5", vec![rect("b")]).await.unwrap();

    let count = engine.undo("s5").await.unwrap();
    assert_eq!(count, 1);
    let scene = engine.scene("s5").await.unwrap();
    assert_eq!(scene.elements.len(), 1);
    assert_eq!(scene.elements[0]["id"], "a");
}

#[tokio::test]
async fn undo_fails_on_an_empty_log_without_touching_state() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    assert!(matches!(engine.undo("fresh").await, Err(EngineError::EmptyLog)));

    // Compaction truncates the log, putting earlier operations out of reach.
    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    engine.flush_all().await;
    assert!(matches!(engine.undo("s").await, Err(EngineError::EmptyLog)));
    assert_eq!(engine.scene("s").await.unwrap().elements.len(), 1);
}

#[tokio::test]
async fn restore_recovers_a_prior_snapshot_and_preserves_the_overwritten_state() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;
    let mut rx = subscriber(&engine, "s6").await;
    drain(&mut rx);

    engine.set_elements("s6", vec![rect("a")], None).await.unwrap();
    engine.flush_all().await;
    engine.append_elements("s6", vec![rect("b")]).await.unwrap();
    engine.flush_all().await;
    drain(&mut rx);

    let listing = engine.versions("s6").await.unwrap();
    assert_eq!(listing.versions.len(), 1, "the pre-b snapshot should be listed");
    assert_eq!(listing.versions[0].element_count, 1);
    assert_eq!(listing.current.as_ref().unwrap().element_count, 2);

    assert_eq!(engine.scene("s6").await.unwrap().elements.len(), 2);
    engine.set_viewport("s6", Viewport::default()).await.unwrap();
    drain(&mut rx);

    let count = engine
        .restore("s6", listing.versions[0].timestamp)
        .await
        .unwrap();
    assert_eq!(count, 1);

    match next(&mut rx) {
        ServerMessage::Elements { elements, source, version, .. } => {
            assert_eq!(elements.len(), 1);
            assert_eq!(elements[0]["id"], "a");
            assert_eq!(source, Some(ElementsSource::Restore));
            assert!(version >= 4, "restore consumes a version like any mutation");
        }
        other => panic!("expected restore frame, got {other:?}"),
    }

    // The pre-restore state joined the history and the source entry survived.
    let listing = engine.versions("s6").await.unwrap();
    assert_eq!(listing.versions.len(), 2);
    assert!(listing.versions.iter().any(|v| v.element_count == 2));
    assert_eq!(listing.current.as_ref().unwrap().element_count, 1);
}

#[tokio::test]
async fn restore_of_unknown_timestamp_fails_without_side_effects() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    assert!(matches!(
        engine.restore("s", 1).await,
        Err(EngineError::VersionNotFound(1))
    ));
    assert_eq!(engine.scene("s").await.unwrap().elements.len(), 1);
    assert!(engine.versions("s").await.unwrap().versions.is_empty());
}

#[tokio::test]
async fn versions_observed_by_subscribers_never_decrease() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;
    let mut rx = subscriber(&engine, "s").await;

    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    engine.flush_all().await;
    engine.append_elements("s", vec![rect("b")]).await.unwrap();
    engine.flush_all().await;
    let listing = engine.versions("s").await.unwrap();
    engine.restore("s", listing.versions[0].timestamp).await.unwrap();
    engine.set_elements("s", vec![rect("c")], None).await.unwrap();

    let mut last = 0;
    while let Ok(frame) = rx.try_recv() {
        if let ServerMessage::Elements { version, .. } = frame {
            assert!(version >= last, "version went backwards: {version} < {last}");
            last = version;
        }
    }
    assert!(last > 0);
}

#[tokio::test]
async fn clear_compacts_first_and_undo_brings_the_drawing_back() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    engine
        .add_file("s", "f1".into(), "https://cdn.example/f1.png".into(), "image/png".into())
        .await
        .unwrap();
    engine.clear("s").await.unwrap();

    let scene = engine.scene("s").await.unwrap();
    assert!(scene.elements.is_empty());
    assert!(engine.files("s").await.unwrap().is_empty());

    // The pre-clear drawing became the current snapshot, so the logged clear
    // is the only thing undo needs to peel off.
    let listing = engine.versions("s").await.unwrap();
    assert_eq!(listing.current.as_ref().unwrap().element_count, 1);
    let count = engine.undo("s").await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn clear_twice_matches_clear_once() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("s", vec![rect("a")], None).await.unwrap();
    engine.clear("s").await.unwrap();
    let once = engine.scene("s").await.unwrap();
    engine.clear("s").await.unwrap();
    assert_eq!(engine.scene("s").await.unwrap(), once);
}

#[tokio::test]
async fn disconnect_flushes_the_debounced_update_to_the_log() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let subscriber_id = engine.subscribe("s", tx).await.unwrap();
    engine
        .handle_update("s", subscriber_id, vec![rect("edit")], None)
        .await
        .unwrap();
    engine.unsubscribe("s", subscriber_id).await;

    let store = SessionStore::open(dir.path()).await.unwrap();
    let (scene, replayed) = store.load_scene("s").await;
    assert_eq!(replayed, 1);
    assert_eq!(scene.elements[0]["id"], "edit");
}

#[tokio::test]
async fn debounce_coalesces_bursts_into_one_logged_update() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let subscriber_id = engine.subscribe("s", tx).await.unwrap();
    for round in 0..5 {
        let label = format!("edit-{round}");
        engine
            .handle_update("s", subscriber_id, vec![rect(&label)], None)
            .await
            .unwrap();
    }

    let store = SessionStore::open(dir.path()).await.unwrap();
    let (_, replayed) = store.load_scene("s").await;
    assert_eq!(replayed, 0, "nothing should be logged inside the burst window");

    tokio::time::sleep(drawbridge_core::UPDATE_DEBOUNCE * 2).await;
    let (scene, replayed) = store.load_scene("s").await;
    assert_eq!(replayed, 1, "the burst should collapse to one update");
    assert_eq!(scene.elements[0]["id"], "edit-4");
}

#[tokio::test]
async fn health_counts_track_sessions_and_clients() {
    let dir = tempdir().unwrap();
    let engine = engine(&dir).await;

    engine.set_elements("a", vec![rect("x")], None).await.unwrap();
    let _rx = subscriber(&engine, "b").await;

    let (sessions, clients) = engine.stats().await;
    assert_eq!(sessions, 2);
    assert_eq!(clients, 1);

    let listing = engine.list_sessions().await;
    assert_eq!(listing.len(), 2);
    let by_id = |id: &str| listing.iter().find(|s| s.id == id).unwrap();
    assert_eq!(by_id("a").element_count, 1);
    assert_eq!(by_id("b").client_count, 1);
}
