use async_trait::async_trait;
use bgw_broker::{
    spawn_coordinator, CloudError, CloudEvent, CloudRegistrar, ConnectionId, ConnectionState,
    CoordinatorHandle, CoordinatorSettings, DeviceHandle, LocalRegistrar, NodeChannel, Telemetry,
    TransportError,
};
use bgwp_node::{DeviceAddress, DeviceData, GatewayMessage, NodeConfig, NodeId, NodeMessage};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        Semaphore,
    },
    time::Duration,
};

struct RecordingChannel(UnboundedSender<(ConnectionId, GatewayMessage)>);

impl NodeChannel for RecordingChannel {
    fn send(&self, connection_id: ConnectionId, message: GatewayMessage) -> Result<(), TransportError> {
        self.0
            .send((connection_id, message))
            .map_err(|_| TransportError::Closed(connection_id))
    }
}

#[derive(Debug)]
struct FakeHandle {
    address: DeviceAddress,
    published: Mutex<Vec<Telemetry>>,
    cleanups: AtomicUsize,
}

#[async_trait]
impl DeviceHandle for FakeHandle {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn publish(&self, telemetry: Telemetry) -> Result<(), CloudError> {
        self.published.lock().unwrap().push(telemetry);
        Ok(())
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeRegistrar {
    calls: AtomicUsize,
    fail: AtomicBool,
    gate: Semaphore,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeRegistrar {
    fn open() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    fn gated() -> Self {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Semaphore::new(permits),
            handles: Mutex::new(vec![]),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_handle(&self) -> Arc<FakeHandle> {
        self.handles.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl CloudRegistrar for FakeRegistrar {
    async fn register(&self, address: &DeviceAddress) -> Result<Arc<dyn DeviceHandle>, CloudError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|_| CloudError::Rejected("gate closed".into()))?
            .forget();
        if self.fail.load(Ordering::SeqCst) {
            return Err(CloudError::Rejected("registrar offline".into()));
        }
        let handle = Arc::new(FakeHandle {
            address: address.clone(),
            published: Mutex::new(vec![]),
            cleanups: AtomicUsize::new(0),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

struct Harness {
    coordinator: CoordinatorHandle,
    outbound: UnboundedReceiver<(ConnectionId, GatewayMessage)>,
    registrar: Arc<FakeRegistrar>,
    _task: tokio::task::JoinHandle<()>,
}

const N1: ConnectionId = 1;
const N2: ConnectionId = 2;

fn addr(a: &str) -> DeviceAddress {
    DeviceAddress::parse(a).unwrap()
}

fn connect(a: &str) -> GatewayMessage {
    GatewayMessage::ConnectDevice {
        device_address: addr(a),
    }
}

fn disconnect(a: &str) -> GatewayMessage {
    GatewayMessage::DisconnectDevice {
        device_address: addr(a),
    }
}

impl Harness {
    fn new(registrar: FakeRegistrar) -> Self {
        Self::with_settings(registrar, CoordinatorSettings::default())
    }

    fn with_settings(registrar: FakeRegistrar, settings: CoordinatorSettings) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, outbound) = unbounded_channel();
        let registrar = Arc::new(registrar);
        let (coordinator, _task) =
            spawn_coordinator(registrar.clone(), Arc::new(RecordingChannel(tx)), settings);
        Self {
            coordinator,
            outbound,
            registrar,
            _task,
        }
    }

    fn send(&self, connection_id: ConnectionId, message: NodeMessage) {
        self.coordinator.dispatch(connection_id, message).unwrap();
    }

    fn register(&self, connection_id: ConnectionId, node_id: &str) {
        self.send(
            connection_id,
            NodeMessage::Register {
                node_id: Some(NodeId::new(node_id)),
                config_data: NodeConfig::default(),
            },
        );
    }

    fn discovered(&self, connection_id: ConnectionId, a: &str, distance: f64, timestamp: i64) {
        self.send(
            connection_id,
            NodeMessage::Discovered {
                device_address: addr(a),
                distance,
                timestamp,
            },
        );
    }

    fn connected(&self, connection_id: ConnectionId, a: &str, timestamp: i64) {
        self.send(
            connection_id,
            NodeMessage::DeviceConnected {
                device_address: addr(a),
                timestamp,
            },
        );
    }

    fn out_of_range(&self, connection_id: ConnectionId, a: &str, timestamp: i64) {
        self.send(
            connection_id,
            NodeMessage::DeviceOutOfRange {
                device_address: addr(a),
                timestamp,
            },
        );
    }

    fn status(&self, connection_id: ConnectionId, a: &str, timestamp: i64) {
        self.send(
            connection_id,
            NodeMessage::DeviceStatus {
                device_address: addr(a),
                distance: 1.0,
                timestamp,
                data: DeviceData {
                    battery_level: Some(80),
                    ..Default::default()
                },
            },
        );
    }

    /// Round trip through the coordinator queue, so everything sent before
    /// has been handled
    async fn sync(&self) {
        self.coordinator.devices().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.coordinator.devices().await.unwrap();
    }

    async fn expect(&mut self) -> (ConnectionId, GatewayMessage) {
        tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
            .await
            .expect("no directive within a second")
            .expect("channel closed")
    }

    async fn expect_quiet(&mut self) {
        self.sync().await;
        if let Ok(unexpected) = self.outbound.try_recv() {
            panic!("unexpected directive {unexpected:?}");
        }
    }

    async fn state(&self, a: &str) -> (ConnectionState, Option<NodeId>) {
        let snapshot = self.coordinator.device(addr(a)).await.unwrap().unwrap();
        (snapshot.state, snapshot.owner)
    }
}

#[tokio::test]
async fn discovered_connected_out_of_range_cycle() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.2, 1);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::PendingConnect, Some(NodeId::new("N1")))
    );

    h.connected(N1, "AA:BB", 2);
    h.sync().await;
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::Connected, Some(NodeId::new("N1")))
    );

    h.out_of_range(N1, "AA:BB", 3);
    assert_eq!(h.expect().await, (N1, disconnect("AA:BB")));
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));
    assert_eq!(h.registrar.calls(), 1);
    assert_eq!(h.registrar.last_handle().cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn only_one_node_is_told_to_connect() {
    let mut h = Harness::new(FakeRegistrar::gated());
    h.register(N1, "N1");
    h.register(N2, "N2");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.discovered(N2, "AA:BB", 0.5, 1);
    h.discovered(N1, "AA:BB", 1.0, 2);
    h.sync().await;

    h.registrar.gate.add_permits(10);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    h.expect_quiet().await;
    assert_eq!(h.registrar.calls(), 1);

    let devices = h.coordinator.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].owner, Some(NodeId::new("N1")));
}

#[tokio::test]
async fn rediscovery_while_connected_reuses_the_cloud_handle() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    h.connected(N1, "AA:BB", 2);

    // the node lost track of the device and announces it again
    h.discovered(N1, "AA:BB", 1.0, 3);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::PendingConnect, Some(NodeId::new("N1")))
    );
    assert_eq!(h.registrar.calls(), 1);

    h.connected(N1, "AA:BB", 4);
    h.sync().await;
    assert_eq!(h.state("AA:BB").await.0, ConnectionState::Connected);
}

#[tokio::test]
async fn node_disconnect_releases_everything_it_owned() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.register(N2, "N2");
    for a in ["AA:01", "AA:02"] {
        h.discovered(N1, a, 1.0, 1);
        h.expect().await;
        h.connected(N1, a, 2);
    }
    h.sync().await;

    h.coordinator.node_disconnected(N1).unwrap();
    h.sync().await;
    assert_eq!(h.state("AA:01").await, (ConnectionState::Idle, None));
    assert_eq!(h.state("AA:02").await, (ConnectionState::Idle, None));

    h.discovered(N2, "AA:01", 2.0, 5);
    assert_eq!(h.expect().await, (N2, connect("AA:01")));
    assert_eq!(h.registrar.calls(), 2);

    let sessions = h.coordinator.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node_id, NodeId::new("N2"));
}

#[tokio::test]
async fn out_of_range_hands_the_device_to_the_next_node() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "X");
    h.register(N2, "Y");
    h.discovered(N1, "AA:BB", 1.0, 1);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    h.connected(N1, "AA:BB", 2);
    h.out_of_range(N1, "AA:BB", 3);
    assert_eq!(h.expect().await, (N1, disconnect("AA:BB")));

    h.discovered(N2, "AA:BB", 1.0, 4);
    assert_eq!(h.expect().await, (N2, connect("AA:BB")));
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::PendingConnect, Some(NodeId::new("Y")))
    );
    assert_eq!(h.registrar.calls(), 1);
}

#[tokio::test]
async fn node_disconnect_is_idempotent() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;

    h.coordinator.node_disconnected(N1).unwrap();
    h.coordinator.node_disconnected(N1).unwrap();
    h.coordinator.node_disconnected(42).unwrap();
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));
    assert!(h.coordinator.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn only_the_serving_node_forwards_telemetry() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.register(N2, "N2");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;

    // not connected yet
    h.status(N1, "AA:BB", 2);
    h.connected(N1, "AA:BB", 3);
    h.status(N1, "AA:BB", 4);
    h.status(N2, "AA:BB", 5);
    h.status(N1, "AA:BB", 6);
    h.sync().await;

    let handle = h.registrar.last_handle();
    for _ in 0..50 {
        if handle.published.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let seen: Vec<_> = handle
        .published
        .lock()
        .unwrap()
        .iter()
        .map(|t| (t.node_id.clone(), t.timestamp))
        .collect();
    assert_eq!(seen, vec![(NodeId::new("N1"), 4), (NodeId::new("N1"), 6)]);

    let snapshot = h.coordinator.device(addr("AA:BB")).await.unwrap().unwrap();
    assert_eq!(snapshot.last_seen_at, Some(6));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_connect_times_out() {
    let mut h = Harness::with_settings(
        FakeRegistrar::open(),
        CoordinatorSettings {
            pending_connect_timeout: Duration::from_secs(30),
        },
    );
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.expect().await, (N1, disconnect("AA:BB")));
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));

    // a confirmation arriving after the timeout is dropped
    h.connected(N1, "AA:BB", 2);
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await.0, ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn confirmed_connect_is_not_timed_out() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;
    h.connected(N1, "AA:BB", 2);

    tokio::time::sleep(Duration::from_secs(120)).await;
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await.0, ConnectionState::Connected);
}

#[tokio::test]
async fn registration_outliving_its_claim_is_kept_but_not_acted_on() {
    let mut h = Harness::new(FakeRegistrar::gated());
    h.register(N1, "N1");
    h.register(N2, "N2");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.sync().await;
    h.coordinator.node_disconnected(N1).unwrap();
    h.sync().await;

    h.registrar.gate.add_permits(1);
    h.expect_quiet().await;
    let snapshot = h.coordinator.device(addr("AA:BB")).await.unwrap().unwrap();
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert!(snapshot.registered);

    h.discovered(N2, "AA:BB", 1.0, 2);
    assert_eq!(h.expect().await, (N2, connect("AA:BB")));
    assert_eq!(h.registrar.calls(), 1);
}

#[tokio::test]
async fn failed_registration_frees_the_device() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.registrar.fail.store(true, Ordering::SeqCst);
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));

    h.registrar.fail.store(false, Ordering::SeqCst);
    h.discovered(N1, "AA:BB", 1.0, 2);
    assert_eq!(h.expect().await, (N1, connect("AA:BB")));
    assert_eq!(h.registrar.calls(), 2);
}

#[tokio::test]
async fn protocol_errors_are_reported_to_the_node() {
    let mut h = Harness::new(FakeRegistrar::open());

    h.discovered(N1, "AA:BB", 1.0, 1);
    let (to, msg) = h.expect().await;
    assert_eq!(to, N1);
    assert!(matches!(msg, GatewayMessage::Error { ref error_text, .. } if error_text == "protocol error"));
    assert!(h.coordinator.devices().await.unwrap().is_empty());

    h.send(
        N1,
        NodeMessage::Register {
            node_id: None,
            config_data: NodeConfig::default(),
        },
    );
    assert!(matches!(h.expect().await, (N1, GatewayMessage::Error { .. })));
    assert!(h.coordinator.sessions().await.unwrap().is_empty());

    h.register(N1, "N1");
    h.connected(N1, "CC:DD", 1);
    let (_, msg) = h.expect().await;
    match msg {
        GatewayMessage::Error { description, .. } => assert!(description.contains("CC:DD")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn messages_in_the_wrong_state_are_dropped_silently() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.register(N2, "N2");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;

    // N2 does not own the device
    h.connected(N2, "AA:BB", 2);
    h.out_of_range(N2, "AA:BB", 3);
    h.expect_quiet().await;
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::PendingConnect, Some(NodeId::new("N1")))
    );
}

#[tokio::test]
async fn reregistering_under_a_new_identity_releases_devices() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;
    h.connected(N1, "AA:BB", 2);

    // refresh keeps ownership
    h.register(N1, "N1");
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await.0, ConnectionState::Connected);

    h.register(N1, "N9");
    assert_eq!(h.expect().await, (N1, disconnect("AA:BB")));
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));
    let sessions = h.coordinator.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node_id, NodeId::new("N9"));
}

#[tokio::test]
async fn device_disconnected_notice_releases_the_owner() {
    let mut h = Harness::new(FakeRegistrar::open());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.expect().await;
    h.connected(N1, "AA:BB", 2);
    h.send(
        N1,
        NodeMessage::DeviceDisconnected {
            device_address: addr("AA:BB"),
        },
    );
    assert_eq!(h.expect().await, (N1, disconnect("AA:BB")));
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));

    let sessions = h.coordinator.sessions().await.unwrap();
    assert!(sessions[0].devices.is_empty());
}

#[tokio::test]
async fn out_of_range_before_connect_confirmation_sends_no_directive() {
    let mut h = Harness::new(FakeRegistrar::gated());
    h.register(N1, "N1");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.sync().await;
    assert_eq!(h.state("AA:BB").await.0, ConnectionState::Discovered);

    // N1 was never told to connect, so there is nothing to undo
    h.out_of_range(N1, "AA:BB", 2);
    h.expect_quiet().await;
    assert_eq!(h.state("AA:BB").await, (ConnectionState::Idle, None));
}

#[tokio::test]
async fn one_registration_in_flight_per_address() {
    let mut h = Harness::new(FakeRegistrar::gated());
    h.register(N1, "N1");
    h.register(N2, "N2");
    h.discovered(N1, "AA:BB", 1.0, 1);
    h.sync().await;
    h.out_of_range(N1, "AA:BB", 2);
    h.expect_quiet().await;

    // the first registration is still pending when N2 claims the device
    h.discovered(N2, "AA:BB", 1.0, 3);
    h.sync().await;
    assert_eq!(h.registrar.calls(), 1);
    let snapshot = h.coordinator.device(addr("AA:BB")).await.unwrap().unwrap();
    assert_eq!(snapshot.state, ConnectionState::Discovered);
    assert!(snapshot.registering);

    h.registrar.gate.add_permits(10);
    assert_eq!(h.expect().await, (N2, connect("AA:BB")));
    h.expect_quiet().await;
    assert_eq!(h.registrar.calls(), 1);
    assert_eq!(
        h.state("AA:BB").await,
        (ConnectionState::PendingConnect, Some(NodeId::new("N2")))
    );
}

#[tokio::test]
async fn registrations_for_different_devices_overlap() {
    let mut h = Harness::new(FakeRegistrar::gated());
    h.register(N1, "N1");
    h.discovered(N1, "AA:01", 1.0, 1);
    h.discovered(N1, "AA:02", 1.0, 1);
    h.sync().await;

    // both are waiting on the registrar at the same time
    assert_eq!(h.registrar.calls(), 2);

    h.registrar.gate.add_permits(2);
    let mut seen = vec![h.expect().await, h.expect().await];
    seen.sort_by_key(|(_, msg)| format!("{msg:?}"));
    assert_eq!(seen, vec![(N1, connect("AA:01")), (N1, connect("AA:02"))]);
}

#[tokio::test(start_paused = true)]
async fn release_is_published_after_queued_telemetry_and_stops_presence() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (cloud_tx, mut cloud_rx) = unbounded_channel();
    let (tx, mut outbound) = unbounded_channel();
    let (coordinator, _task) = spawn_coordinator(
        Arc::new(LocalRegistrar::new(cloud_tx, Duration::from_secs(5))),
        Arc::new(RecordingChannel(tx)),
        CoordinatorSettings::default(),
    );
    let send = |message| coordinator.dispatch(N1, message).unwrap();
    let a = addr("AA:BB");

    send(NodeMessage::Register {
        node_id: Some(NodeId::new("N1")),
        config_data: NodeConfig::default(),
    });
    send(NodeMessage::Discovered {
        device_address: a.clone(),
        distance: 1.0,
        timestamp: 1,
    });
    assert_eq!(outbound.recv().await, Some((N1, connect("AA:BB"))));
    send(NodeMessage::DeviceConnected {
        device_address: a.clone(),
        timestamp: 2,
    });

    // status and out-of-range back to back
    send(NodeMessage::DeviceStatus {
        device_address: a.clone(),
        distance: 1.0,
        timestamp: 3,
        data: DeviceData::default(),
    });
    send(NodeMessage::DeviceOutOfRange {
        device_address: a.clone(),
        timestamp: 4,
    });
    assert_eq!(outbound.recv().await, Some((N1, disconnect("AA:BB"))));

    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut events = vec![];
    while let Ok(event) = cloud_rx.try_recv() {
        events.push(event);
    }
    assert!(
        !events.iter().any(|e| matches!(e, CloudEvent::Presence { .. })),
        "heartbeat outlived the release: {events:?}"
    );
    assert_eq!(events.len(), 3, "{events:?}");
    assert_eq!(events[0], CloudEvent::Registered { address: a.clone() });
    assert!(matches!(&events[1], CloudEvent::Telemetry(t) if t.timestamp == 3));
    assert_eq!(events[2], CloudEvent::Released { address: a });
}
