#![allow(clippy::explicit_iter_loop)]

mod common;

use common::{init_tracing, real_frame, Behaviour, MockVenue, VenueEvent};
use kiwoom::core::kernel::WsConfig;
use kiwoom::exchanges::kiwoom::{Market, Tick};
use kiwoom::{ConnectionState, KiwoomConfig, KiwoomError, KiwoomSession};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ws_config() -> WsConfig {
    WsConfig::default()
        .with_heartbeat(Duration::from_millis(500), Duration::from_millis(250))
        .with_reconnect(2, Duration::from_millis(50), Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn config(server: &MockServer, venue: &MockVenue) -> KiwoomConfig {
    KiwoomConfig::new("app-key".to_string(), "secret-key".to_string())
        .base_url(server.uri())
        .ws_url(venue.url.clone())
}

async fn mount_auth(server: &MockServer, revocations: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "session-token",
            "token_type": "bearer",
            "expires_dt": "20991231235959",
            "return_code": 0,
            "return_msg": "ok",
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .and(body_json(json!({
            "appkey": "app-key",
            "secretkey": "secret-key",
            "token": "session-token",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"return_code": 0})))
        .expect(revocations)
        .mount(server)
        .await;
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_stream_and_close() {
        init_tracing();
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/dostk/stkinfo"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "return_code": 0,
                "list": [{"code": "005930", "name": "Samsung"}, {"code": "000660", "name": "SK hynix"}],
            })))
            .mount(&server)
            .await;
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;

        let session = KiwoomSession::builder(config(&server, &venue))
            .with_ws_config(ws_config())
            .connect()
            .await
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Live);
        assert_eq!(session.token().unwrap().expose(), "session-token");

        let login = venue.frames(0, "LOGIN", 1).await;
        assert_eq!(login[0]["token"], "session-token");

        let stocks = session.stock_list(Market::Kospi).await.unwrap();
        assert_eq!(stocks.len(), 2);

        let ticks = Arc::new(Mutex::new(Vec::<Tick>::new()));
        let sink = ticks.clone();
        session
            .register_tick("1", &["005930"], move |tick| {
                sink.lock().unwrap().push(tick);
                Ok(())
            })
            .unwrap();
        let reg = venue.frames(0, "REG", 1).await;
        assert_eq!(reg[0]["data"][0]["type"], json!(["0B"]));

        venue.send(real_frame(
            "0B",
            Some("1"),
            "005930",
            json!({"20": "090001", "10": "-60700", "15": "-5"}),
        ));

        timeout(Duration::from_secs(5), async {
            while ticks.lock().unwrap().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            ticks.lock().unwrap()[0],
            Tick {
                item: "005930".to_string(),
                time: "090001".to_string(),
                price: 60_700,
                volume: -5,
            }
        );

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.token().is_none());
        assert!(session.registry().is_empty());
        venue.wait_disconnected(0).await;
    }

    #[tokio::test]
    async fn test_rejected_credentials_never_open_socket() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "return_code": 3,
                "return_msg": "invalid appkey",
            })))
            .mount(&server)
            .await;
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;

        let result = KiwoomSession::builder(config(&server, &venue))
            .with_ws_config(ws_config())
            .connect()
            .await;
        assert!(matches!(result, Err(KiwoomError::AuthError(_))));
        assert!(venue.drain_for(Duration::from_millis(200)).await.is_empty());
    }

    #[tokio::test]
    async fn test_login_rejection_closes_session() {
        init_tracing();
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        let mut venue = MockVenue::start(vec![Behaviour::RejectLogin]).await;

        let result = KiwoomSession::builder(config(&server, &venue))
            .with_ws_config(ws_config())
            .connect()
            .await;
        assert!(matches!(result, Err(KiwoomError::AuthError(_))), "{:?}", result);

        let events = venue.drain_for(Duration::from_millis(300)).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, VenueEvent::Connected(n) if *n > 0)));
    }

    #[tokio::test]
    async fn test_scoped_session_closes_on_exit() {
        init_tracing();
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        let mut venue = MockVenue::start(vec![Behaviour::Normal]).await;

        let group_size = KiwoomSession::scoped(config(&server, &venue), |session| async move {
            session.register_order_book("7", &["005930", "000660"], |_| Ok(()))?;
            Ok(session.registry().group_items("7").len())
        })
        .await
        .unwrap();
        assert_eq!(group_size, 2);

        let reg = venue.frames(0, "REG", 1).await;
        assert_eq!(reg[0]["grp_no"], "7");
        venue.wait_disconnected(0).await;
    }
}
