mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use common::{accept_and_engage, dictionary, settings, write_message, EchoHandler, FailingHandler};
use igor_config::DiameterPeerConfig;
use igor_core::constants::DIAMETER_SUCCESS;
use igor_core::IgorError;
use igor_peer::{DiameterPeer, PeerControlEvent, PeerSettings, PeerStatus};

fn active_config(host: &str, port: u16, watchdog_millis: u64) -> DiameterPeerConfig {
    serde_json::from_str(&format!(
        r#"{{"diameterHost": "{host}", "ipAddress": "127.0.0.1", "port": {port},
            "connectionPolicy": "active", "connectionTimeoutMillis": 1000,
            "watchdogIntervalMillis": {watchdog_millis}}}"#
    ))
    .unwrap()
}

fn handler(settings: &Arc<PeerSettings>) -> Arc<EchoHandler> {
    Arc::new(EchoHandler {
        dict: settings.dict.clone(),
    })
}

// Build an engaged active/passive pair over a loopback connection.
// Returns both handles, both control channels and the passive handle.
async fn engaged_pair(
    watchdog_millis: u64,
) -> (
    DiameterPeer,
    DiameterPeer,
    mpsc::Receiver<PeerControlEvent>,
    mpsc::Receiver<PeerControlEvent>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_settings = settings(
        "server.igorserver",
        r#"[{"diameterHost": "client.igorclient", "ipAddress": "127.0.0.1",
             "connectionPolicy": "passive", "originNetwork": "127.0.0.0/8"}]"#,
    );
    let client_settings = settings("client.igorclient", "[]");

    let (server_control_tx, server_control_rx) = mpsc::channel(16);
    let (client_control_tx, client_control_rx) = mpsc::channel(16);

    let passive_settings = server_settings.clone();
    let passive_handler = handler(&server_settings);
    let passive_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        DiameterPeer::new_passive(2, passive_settings, stream, server_control_tx, passive_handler)
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("server.igorserver", port, watchdog_millis),
        client_control_tx,
        handler(&client_settings),
    );

    let passive = passive_task.await.unwrap();
    (active, passive, client_control_rx, server_control_rx)
}

async fn expect_peer_up(control: &mut mpsc::Receiver<PeerControlEvent>) -> String {
    match tokio::time::timeout(Duration::from_secs(2), control.recv())
        .await
        .expect("no control event before timeout")
        .expect("control channel closed")
    {
        PeerControlEvent::PeerUp { diameter_host, .. } => diameter_host,
        other => panic!("expected PeerUp, got {other:?}"),
    }
}

async fn expect_peer_down(
    control: &mut mpsc::Receiver<PeerControlEvent>,
) -> Option<IgorError> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), control.recv())
            .await
            .expect("no control event before timeout")
            .expect("control channel closed")
        {
            PeerControlEvent::PeerDown { error, .. } => return error,
            PeerControlEvent::PeerUp { .. } => continue,
        }
    }
}

#[tokio::test]
async fn test_cer_cea_happy_path() {
    igor_logging::init_test();

    let (active, passive, mut client_control, mut server_control) = engaged_pair(10_000).await;

    assert_eq!(expect_peer_up(&mut client_control).await, "server.igorserver");
    assert_eq!(expect_peer_up(&mut server_control).await, "client.igorclient");

    assert_eq!(active.status(), PeerStatus::Engaged);
    assert_eq!(passive.status(), PeerStatus::Engaged);
}

#[tokio::test]
async fn test_request_answer_through_pair() {
    igor_logging::init_test();

    let (active, _passive, mut client_control, mut server_control) = engaged_pair(10_000).await;
    expect_peer_up(&mut client_control).await;
    expect_peer_up(&mut server_control).await;

    let dict = dictionary();
    let mut request =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    request.add("Session-Id", "session-1", &dict).unwrap();

    let answer = active
        .request(request, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!answer.is_request);
    assert_eq!(answer.get_result_code(), Some(DIAMETER_SUCCESS));
}

#[tokio::test]
async fn test_request_validations() {
    igor_logging::init_test();

    let (active, _passive, mut client_control, _server_control) = engaged_pair(10_000).await;
    expect_peer_up(&mut client_control).await;

    let dict = dictionary();

    // Base application requests are peer internal
    let base = igor_diameter::DiameterMessage::new_request("Base", "Device-Watchdog", &dict)
        .unwrap();
    assert!(active.request(base, Duration::from_secs(1)).await.is_err());

    // Answers cannot be sent through the request API
    let request =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    let answer = igor_diameter::DiameterMessage::new_answer(&request);
    assert!(active.request(answer, Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_cer_rejection_unknown_peer() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // The passive side allows no peers at all
    let server_settings = settings("server.igorserver", "[]");
    let client_settings = settings("rogue.igorclient", "[]");

    let (server_control_tx, mut server_control_rx) = mpsc::channel(16);
    let (client_control_tx, mut client_control_rx) = mpsc::channel(16);

    let passive_settings = server_settings.clone();
    let passive_handler = handler(&server_settings);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        DiameterPeer::new_passive(2, passive_settings, stream, server_control_tx, passive_handler)
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("server.igorserver", port, 10_000),
        client_control_tx,
        handler(&client_settings),
    );

    // The passive peer rejects the CER and goes down with an error
    assert!(expect_peer_down(&mut server_control_rx).await.is_some());

    // The active peer sees a CEA with Result-Code 3010 and closes too.
    // The error carried in PeerDown names the protocol failure.
    let error = expect_peer_down(&mut client_control_rx).await;
    match error {
        Some(IgorError::Protocol(reason)) => assert!(reason.contains("3010")),
        // The remote may close before the CEA is fully delivered
        Some(_) | None => {}
    }
    assert_eq!(active.status(), PeerStatus::Closed);
}

#[tokio::test]
async fn test_watchdog_escalation() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let client_settings = settings("client.igorclient", "[]");
    let (control_tx, mut control_rx) = mpsc::channel(16);

    // Stub that completes the handshake and then goes silent
    let stub_dict = dict.clone();
    tokio::spawn(async move {
        let stream = accept_and_engage(&listener, &stub_dict, "stub.watchdog.igor").await;
        // Hold the socket open without answering anything
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let _active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("stub.watchdog.igor", port, 100),
        control_tx,
        handler(&client_settings),
    );

    expect_peer_up(&mut control_rx).await;

    // Two watchdog requests go unanswered; the third tick closes the peer
    let started = std::time::Instant::now();
    let error = expect_peer_down(&mut control_rx).await;
    assert!(error.is_some());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_request_timeout_then_stalled_answer() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let client_settings = settings("client.igorclient", "[]");
    let (control_tx, mut control_rx) = mpsc::channel(16);

    // Stub that answers the request only after the caller has timed out
    let stub_dict = dict.clone();
    tokio::spawn(async move {
        let mut stream = accept_and_engage(&listener, &stub_dict, "stub.stalled.igor").await;
        let request = igor_diameter::DiameterMessage::read_from(&mut stream, &stub_dict)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut answer = igor_diameter::DiameterMessage::new_answer(&request);
        answer.add_origin_avps("stub.stalled.igor", "igor", &stub_dict).unwrap();
        answer.add("Result-Code", DIAMETER_SUCCESS, &stub_dict).unwrap();
        write_message(&mut stream, &answer).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("stub.stalled.igor", port, 10_000),
        control_tx,
        handler(&client_settings),
    );
    expect_peer_up(&mut control_rx).await;

    let mut request =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    request.add("Session-Id", "session-1", &dict).unwrap();

    let result = active.request(request, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(IgorError::Timeout)));

    // The late answer is discarded and recorded as stalled
    let stalled = igor_metrics::DIAMETER_STALLED_ANSWERS.with_label_values(&["stub.stalled.igor"]);
    let mut seen = false;
    for _ in 0..50 {
        if stalled.get() > 0 {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen, "stalled answer was not recorded");
    assert_eq!(active.status(), PeerStatus::Engaged);
}

#[tokio::test]
async fn test_duplicate_hop_by_hop_id() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let client_settings = settings("client.igorclient", "[]");
    let (control_tx, mut control_rx) = mpsc::channel(16);

    let stub_dict = dict.clone();
    tokio::spawn(async move {
        let mut stream = accept_and_engage(&listener, &stub_dict, "stub.duplicate.igor").await;
        // Swallow everything
        while igor_diameter::DiameterMessage::read_from(&mut stream, &stub_dict)
            .await
            .is_ok()
        {}
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("stub.duplicate.igor", port, 10_000),
        control_tx,
        handler(&client_settings),
    );
    expect_peer_up(&mut control_rx).await;

    let mut first =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    first.hop_by_hop_id = 777;
    let mut second = first.clone();
    second.hop_by_hop_id = 777;

    let first_peer = active.clone();
    let first_task =
        tokio::spawn(async move { first_peer.request(first, Duration::from_millis(500)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = active.request(second, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(IgorError::DuplicateId(_))));

    // The first request is still pending and times out on its own
    assert!(matches!(
        first_task.await.unwrap(),
        Err(IgorError::Timeout)
    ));
}

#[tokio::test]
async fn test_disconnect_peer_request() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let client_settings = settings("client.igorclient", "[]");
    let (control_tx, mut control_rx) = mpsc::channel(16);

    let stub_dict = dict.clone();
    let stub = tokio::spawn(async move {
        let mut stream = accept_and_engage(&listener, &stub_dict, "stub.disconnect.igor").await;

        let mut dpr =
            igor_diameter::DiameterMessage::new_request("Base", "Disconnect-Peer", &stub_dict)
                .unwrap();
        dpr.add_origin_avps("stub.disconnect.igor", "igor", &stub_dict)
            .unwrap();
        write_message(&mut stream, &dpr).await;

        // The peer answers with a DPA before closing
        let dpa = igor_diameter::DiameterMessage::read_from(&mut stream, &stub_dict)
            .await
            .unwrap();
        assert_eq!(dpa.command_code, 282);
        assert!(!dpa.is_request);
        assert_eq!(dpa.get_result_code(), Some(DIAMETER_SUCCESS));
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("stub.disconnect.igor", port, 10_000),
        control_tx,
        handler(&client_settings),
    );
    expect_peer_up(&mut control_rx).await;

    // Disconnect requested by the remote: orderly close, no error
    let error = expect_peer_down(&mut control_rx).await;
    assert!(error.is_none());
    assert_eq!(active.status(), PeerStatus::Closed);
    stub.await.unwrap();
}

#[tokio::test]
async fn test_handler_error_means_no_answer() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let server_settings = settings(
        "server.igorserver",
        r#"[{"diameterHost": "client.igorclient", "ipAddress": "127.0.0.1",
             "connectionPolicy": "passive", "originNetwork": "127.0.0.0/8"}]"#,
    );
    let client_settings = settings("client.igorclient", "[]");

    let (server_control_tx, _server_control_rx) = mpsc::channel(16);
    let (client_control_tx, mut client_control_rx) = mpsc::channel(16);

    let passive_settings = server_settings.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        DiameterPeer::new_passive(
            2,
            passive_settings,
            stream,
            server_control_tx,
            Arc::new(FailingHandler),
        )
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("server.igorserver", port, 10_000),
        client_control_tx,
        handler(&client_settings),
    );
    expect_peer_up(&mut client_control_rx).await;

    let request =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    // The failing handler never answers, so the caller times out
    let result = active.request(request, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(IgorError::Timeout)));

    // The peer itself stays engaged
    assert_eq!(active.status(), PeerStatus::Engaged);
}

#[tokio::test]
async fn test_disengage_drains_pending() {
    igor_logging::init_test();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dict = dictionary();

    let client_settings = settings("client.igorclient", "[]");
    let (control_tx, mut control_rx) = mpsc::channel(16);

    let stub_dict = dict.clone();
    tokio::spawn(async move {
        let mut stream = accept_and_engage(&listener, &stub_dict, "stub.drain.igor").await;
        while igor_diameter::DiameterMessage::read_from(&mut stream, &stub_dict)
            .await
            .is_ok()
        {}
    });

    let active = DiameterPeer::new_active(
        1,
        client_settings.clone(),
        active_config("stub.drain.igor", port, 10_000),
        control_tx,
        handler(&client_settings),
    );
    expect_peer_up(&mut control_rx).await;

    let request =
        igor_diameter::DiameterMessage::new_request("TestApplication", "TestRequest", &dict)
            .unwrap();
    let requester = active.clone();
    let pending =
        tokio::spawn(async move { requester.request(request, Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    active.disengage().await;

    // The pending request fails promptly instead of waiting out the timer
    let started = std::time::Instant::now();
    let result = pending.await.unwrap();
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));

    let error = expect_peer_down(&mut control_rx).await;
    assert!(error.is_none());
}
