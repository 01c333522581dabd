#![allow(clippy::explicit_iter_loop)]

mod common;

use common::{init_tracing, item_codes, real_frame, Behaviour, MockVenue, VenueEvent};
use kiwoom::core::kernel::{
    BearerSigner, Callback, SocketSession, SubscriptionRegistry, WsConfig,
};
use kiwoom::exchanges::kiwoom::KiwoomCodec;
use kiwoom::{ConnectionState, Envelope, KiwoomError};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn fast_config() -> WsConfig {
    WsConfig::default()
        .with_heartbeat(Duration::from_millis(200), Duration::from_millis(100))
        .with_reconnect(3, Duration::from_millis(100), Duration::from_millis(400))
        .with_login_timeout(Duration::from_secs(2))
        .with_shutdown_timeout(Duration::from_secs(1))
}

fn session(url: &str, config: WsConfig) -> SocketSession<KiwoomCodec> {
    SocketSession::new(
        url.to_string(),
        "kiwoom".to_string(),
        config,
        KiwoomCodec,
        Arc::new(SubscriptionRegistry::new()),
        Arc::new(BearerSigner::with_token("test-token")),
    )
    .unwrap()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// (group, subject) pairs announced by REG frames
fn announced(frames: &[Value]) -> BTreeSet<(String, String)> {
    frames
        .iter()
        .flat_map(|frame| {
            let group = frame["grp_no"].as_str().unwrap().to_string();
            frame["data"][0]["type"]
                .as_array()
                .unwrap()
                .iter()
                .map(move |subject| (group.clone(), subject.as_str().unwrap().to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

async fn wait_for_state(session: &SocketSession<KiwoomCodec>, wanted: ConnectionState) {
    let mut changes = session.state_changes();
    timeout(Duration::from_secs(5), async {
        while *changes.borrow_and_update() != wanted {
            changes.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {}", wanted));
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_login_then_live() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Live);

        let login = venue.frames(0, "LOGIN", 1).await;
        assert_eq!(login[0]["token"], "test-token");

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        venue.wait_disconnected(0).await;
    }

    #[tokio::test]
    async fn test_login_rejection_is_fatal_without_retry() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::RejectLogin, Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        let result = session.connect().await;
        assert!(matches!(result, Err(KiwoomError::AuthError(_))), "{:?}", result);
        assert!(matches!(session.fatal_error(), Some(KiwoomError::AuthError(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let events = venue.drain_for(Duration::from_millis(600)).await;
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, VenueEvent::Connected(n) if *n > 0)),
            "session reconnected after login rejection: {:?}",
            events
        );
    }

    #[tokio::test]
    async fn test_reconnect_budget_exhausted() {
        init_tracing();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let config = fast_config().with_reconnect(2, Duration::from_millis(10), Duration::from_millis(20));
        let session = session(&url, config);

        let result = timeout(Duration::from_secs(5), session.connect())
            .await
            .expect("connect should give up");
        // the first failure is not a reconnect attempt
        assert_eq!(result, Err(KiwoomError::ConnectionLost { attempts: 2 }));
        assert_eq!(session.fatal_error(), Some(KiwoomError::ConnectionLost { attempts: 2 }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_flapping_connection_exhausts_budget() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::DropAfterLogin]).await;
        let config = fast_config()
            .with_reconnect(2, Duration::from_millis(10), Duration::from_millis(20))
            .with_stable_after(Duration::from_secs(5));
        let session = session(&venue.url, config);

        // every connection goes live, though it may drop before connect observes it
        let outcome = session.connect().await;
        assert!(
            matches!(outcome, Ok(()) | Err(KiwoomError::ConnectionLost { .. })),
            "{:?}",
            outcome
        );

        timeout(Duration::from_secs(5), async {
            while session.fatal_error().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("flapping venue never exhausted the reconnect budget");
        assert_eq!(session.fatal_error(), Some(KiwoomError::ConnectionLost { attempts: 2 }));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        venue.wait_connected(2).await;
        let later = venue.drain_for(Duration::from_millis(200)).await;
        assert!(!later
            .iter()
            .any(|e| matches!(e, VenueEvent::Connected(n) if *n > 2)));
    }

    #[tokio::test]
    async fn test_stable_connection_restores_budget() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let config = fast_config()
            .with_reconnect(1, Duration::from_millis(10), Duration::from_millis(20))
            .with_stable_after(Duration::from_millis(50));
        let session = session(&venue.url, config);
        session.connect().await.unwrap();

        for connection in 0..3 {
            venue.wait_connected(connection).await;
            sleep(Duration::from_millis(100)).await;
            venue.drop_connection();
        }
        venue.wait_connected(3).await;
        wait_for_state(&session, ConnectionState::Live).await;
        assert!(session.fatal_error().is_none());

        session.close().await;
    }

    #[tokio::test]
    async fn test_missed_pong_disconnects_and_reconnects() {
        init_tracing();
        let mut venue =
            MockVenue::start(vec![Behaviour::SilentAfterLogin, Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut changes = session.state_changes();
        let recorder = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    let state = *changes.borrow_and_update();
                    seen.lock().unwrap().push(state);
                }
            })
        };

        session.connect().await.unwrap();
        venue.wait_connected(0).await;

        // a second connection proves the reconnect was scheduled
        venue.wait_connected(1).await;
        wait_for_state(&session, ConnectionState::Live).await;

        let states = seen.lock().unwrap().clone();
        let first_live = states
            .iter()
            .position(|s| *s == ConnectionState::Live)
            .unwrap();
        assert_eq!(
            states[first_live + 1],
            ConnectionState::Disconnected,
            "states: {:?}",
            states
        );
        assert!(session.fatal_error().is_none());

        session.close().await;
        recorder.abort();
    }

    #[tokio::test]
    async fn test_close_stops_sending() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());
        session.connect().await.unwrap();
        session.close().await;
        venue.wait_disconnected(0).await;

        session
            .register("1", &strings(&["005930"]), &strings(&["0B"]), None)
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(venue.drain_for(Duration::from_millis(200)).await.is_empty());
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_replays_registry() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        session
            .register("1", &strings(&["005930", "000660"]), &strings(&["0B"]), None)
            .unwrap();
        session
            .register("2", &strings(&["035720"]), &strings(&["0D"]), None)
            .unwrap();

        session.connect().await.unwrap();
        let initial = venue.frames(0, "REG", 2).await;
        assert_eq!(initial[0]["grp_no"], "1");
        assert_eq!(initial[0]["refresh"], "1");
        assert_eq!(initial[0]["data"][0]["item"], json!(["005930", "000660"]));

        // registered while live: sent immediately
        session
            .register("2", &strings(&["035720"]), &strings(&["0B"]), None)
            .unwrap();
        let live = venue.frames(0, "REG", 1).await;
        assert_eq!(live[0]["data"][0]["type"], json!(["0B"]));

        let before: BTreeSet<(String, String)> =
            session.registry().active_pairs().into_iter().collect();
        assert_eq!(before.len(), 3);

        venue.drop_connection();
        venue.wait_connected(1).await;
        let replayed = venue.frames(1, "REG", 3).await;

        assert_eq!(announced(&replayed), before);
        assert_eq!(replayed[0]["grp_no"], "1");

        session.close().await;
    }

    #[tokio::test]
    async fn test_remove_sends_unsubscribe_once() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());
        session.connect().await.unwrap();

        session
            .register("1", &strings(&["005930"]), &strings(&["0B", "0D"]), None)
            .unwrap();
        venue.frames(0, "REG", 1).await;

        session.remove("1", &strings(&["0B", "0D"])).unwrap();
        session.remove("1", &strings(&["0B", "0D"])).unwrap();

        let removed = venue.frames(0, "REMOVE", 1).await;
        assert_eq!(removed[0]["grp_no"], "1");
        assert_eq!(removed[0]["data"][0]["type"], json!(["0B", "0D"]));

        let later = venue.drain_for(Duration::from_millis(200)).await;
        assert!(!later
            .iter()
            .any(|e| matches!(e, VenueEvent::Frame(_, f) if f["trnm"] == "REMOVE")));
        assert!(session.registry().is_empty());

        session.close().await;
    }

    #[tokio::test]
    async fn test_callback_invoked_once_for_full_group() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        let received = Arc::new(Mutex::new(Vec::<Envelope>::new()));
        let sink = received.clone();
        let callback: Callback = Arc::new(move |envelope: &Envelope| -> anyhow::Result<()> {
            sink.lock().unwrap().push(envelope.clone());
            Ok(())
        });

        let items = item_codes("005930", 100);
        session
            .register("1", &items, &strings(&["0B"]), Some(callback))
            .unwrap();
        session.connect().await.unwrap();
        venue.frames(0, "REG", 1).await;

        venue.send(real_frame(
            "0B",
            Some("1"),
            "005930",
            json!({"20": "090001", "10": "+60700", "15": "+3"}),
        ));

        timeout(Duration::from_secs(5), async {
            while received.lock().unwrap().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sleep(Duration::from_millis(100)).await;

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].item, "005930");
        assert_eq!(received[0].group.as_deref(), Some("1"));
        assert_eq!(received[0].value("10"), Some("+60700"));

        session.close().await;
    }

    #[tokio::test]
    async fn test_capacity_exceeded_sends_nothing() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());
        session.connect().await.unwrap();

        let result = session.register("1", &item_codes("005930", 101), &strings(&["0B"]), None);
        assert!(matches!(
            result,
            Err(KiwoomError::CapacityExceeded { requested: 101, max: 100, .. })
        ));
        assert!(session.registry().is_empty());

        let events = venue.drain_for(Duration::from_millis(200)).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, VenueEvent::Frame(_, f) if f["trnm"] == "REG")));

        session.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_discards_queued_frames() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());

        let calls = Arc::new(Mutex::new(0usize));
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let counter = calls.clone();
        let callback: Callback = Arc::new(move |_: &Envelope| -> anyhow::Result<()> {
            let first = {
                let mut calls = counter.lock().unwrap();
                *calls += 1;
                *calls == 1
            };
            if first {
                let _ = started_tx.send(());
                let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }
            Ok(())
        });

        session
            .register("1", &strings(&["005930"]), &strings(&["0B"]), Some(callback))
            .unwrap();
        session.connect().await.unwrap();
        venue.frames(0, "REG", 1).await;

        let frame = real_frame("0B", Some("1"), "005930", json!({"10": "+60700"}));
        venue.send(frame.clone());
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("first frame never reached the callback");

        for _ in 0..4 {
            venue.send(frame.clone());
        }
        // let the queued frames land behind the blocked callback
        sleep(Duration::from_millis(100)).await;

        let releaser = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            let _ = release_tx.send(());
        });
        session.close().await;
        releaser.await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_ping_is_echoed_and_bad_frames_dropped() {
        init_tracing();
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;
        let session = session(&venue.url, fast_config());
        session.connect().await.unwrap();

        venue.send("{not json");
        venue.send(json!({"trnm": "PING", "seq": 7}).to_string());

        let echoed = venue.frames(0, "PING", 1).await;
        assert_eq!(echoed[0]["seq"], 7);
        assert_eq!(session.state(), ConnectionState::Live);

        session.close().await;
    }
}
