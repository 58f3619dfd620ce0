//! Station → relay → central system over real WebSockets on localhost

use std::time::Duration;

use ocpp_link::ocpp::{DataTransferRequest, DataTransferStatus};
use ocpp_link::{
    CentralSystem, CentralSystemConfig, ChargingStation, Relay, RelayConfig, RttLog,
    StaticDiscovery, StationConfig, StationEvent,
};
use tempfile::tempdir;
use tokio::net::TcpListener;

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_station_through_relay() {
    let central_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let central_addr = central_listener.local_addr().unwrap();
    let central = CentralSystem::new(
        CentralSystemConfig::default().with_heartbeat_interval(Duration::from_secs(1)),
    );
    tokio::spawn(central.clone().serve(central_listener));

    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();
    let relay = Relay::new(RelayConfig::default().with_upstream(format!("ws://{}", central_addr)));
    tokio::spawn(relay.clone().serve(relay_listener));

    let dir = tempdir().unwrap();
    let report = dir.path().join("rtt.txt");
    let station = ChargingStation::new(
        StationConfig::new("CP100")
            .with_address("127.0.0.1")
            .with_port(relay_addr.port())
            .with_report_path(&report),
        StaticDiscovery::new(Vec::<String>::new()),
    );
    let mut events = station.subscribe();
    let running = tokio::spawn(async move { station.run().await });

    loop {
        match events.recv().await.unwrap() {
            StationEvent::BootAccepted { interval } => {
                assert_eq!(interval, Duration::from_secs(1));
                break;
            }
            StationEvent::ConnectFailed { reason, .. } => panic!("connect failed: {}", reason),
            StationEvent::BootRejected { .. } => panic!("boot rejected"),
            _ => {}
        }
    }

    assert_eq!(central.connected(), vec!["CP100"]);
    assert_eq!(relay.connected(), vec!["CP100"]);

    // Heartbeats travel the same path and are recorded
    let log = RttLog::new(&report);
    assert!(
        wait_until(|| log.read_all().map(|s| s.len() >= 2).unwrap_or(false)).await,
        "no heartbeat recorded"
    );
    for sample in log.read_all().unwrap() {
        assert!(sample.rtt_seconds >= 0.0);
    }

    // Calls from the central system reach the station
    let session = central.session("CP100").unwrap();
    let response = session
        .send(&DataTransferRequest {
            vendor_id: "INESCTEC".into(),
            message_id: Some("ping".into()),
            data: Some(serde_json::json!("hello")),
        })
        .await
        .unwrap();
    assert_eq!(response.status, DataTransferStatus::Accepted);
    assert_eq!(response.data, Some(serde_json::json!("hello")));

    // The station leaving ends both hops
    running.abort();
    assert!(wait_until(|| central.connected().is_empty()).await);
    assert!(wait_until(|| relay.connected().is_empty()).await);
}

#[tokio::test]
async fn test_station_reconnects_after_central_drops_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let central = CentralSystem::new(CentralSystemConfig::default());
    tokio::spawn(central.clone().serve(listener));

    let dir = tempdir().unwrap();
    let station = ChargingStation::new(
        StationConfig::new("CP200")
            .with_address("127.0.0.1")
            .with_port(addr.port())
            .with_report_path(dir.path().join("rtt.txt"))
            .with_reconnect_delay(Duration::from_millis(50)),
        StaticDiscovery::new(Vec::<String>::new()),
    );
    let mut events = station.subscribe();
    let running = tokio::spawn(async move { station.run().await });

    let mut boots = 0;
    let mut disconnects = 0;
    while boots < 2 {
        match events.recv().await.unwrap() {
            StationEvent::BootAccepted { .. } => {
                boots += 1;
                if boots == 1 {
                    assert!(wait_until(|| central.session("CP200").is_some()).await);
                    if let Some(session) = central.session("CP200") {
                        session.close();
                    }
                }
            }
            StationEvent::Disconnected { .. } => disconnects += 1,
            StationEvent::ConnectFailed { reason, .. } => panic!("connect failed: {}", reason),
            _ => {}
        }
    }

    assert_eq!(disconnects, 1);
    running.abort();
}
