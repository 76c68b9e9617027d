use std::{
    convert::Infallible,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use yolo_common::{
    config::{CloudConfig, NetworkConfig},
    control::{FanWorker, LightStripWorker, MotionWorker},
    display::{DigitBuffer, ShiftRegisterDisplay},
    hal::{
        format_mac, AnalogInput, CharacterDisplay, ClimateReading, ClimateSensor, HalError,
        LedPin, MotionSensor, NetworkDiagnostics, PixelStrip, PwmOutput, Rgb,
    },
    lcd::LcdWorker,
    session::{LinkSupervisor, SessionCheck, SessionSupervisor},
    telemetry::{AttributeReporter, ChangeReporter, TelemetryWorker},
    roster, CloudClient, CloudSession, Dispatcher, Link, LinkError, RuntimeConfig, SessionError,
    SharedState, TaskId, TaskSpec,
};

const MQTT_CHANNEL_CAPACITY: usize = 64;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_CONNECT_POLL: Duration = Duration::from_millis(20);
const RENDER_FRAME_PAUSE: Duration = Duration::from_millis(1);

struct HostStore {
    runtime_path: PathBuf,
}

/// rumqttc session. Every `connect` builds a fresh client/event loop pair;
/// the pump polls the event loop until its generation is superseded or the
/// connection fails.
struct MqttSession {
    client: Mutex<Option<AsyncClient>>,
    eventloop: Mutex<Option<(u64, EventLoop)>>,
    generation: watch::Sender<u64>,
    connected: AtomicBool,
    lost: Mutex<Option<(u64, String)>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = HostStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.apply_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();

    let state = Arc::new(SharedState::new());
    let led = Arc::new(SimLed::default());
    let link = Arc::new(HostLink::new(&runtime.network));
    let cloud = Arc::new(CloudClient::new(MqttSession::new()));
    let dispatcher = Arc::new(Dispatcher::new(
        state.clone(),
        led.clone(),
        runtime.cloud.max_message_size,
    ));
    let digits = Arc::new(DigitBuffer::new());

    for spec in roster(&runtime.tasks) {
        debug!("starting task {}", spec.name());
        match spec.id {
            TaskId::LinkCheck => {
                let mut supervisor = LinkSupervisor::new(link.clone(), runtime.network.clone());
                let timings = runtime.tasks.clone();
                tokio::spawn(async move {
                    loop {
                        let check = tokio::task::block_in_place(|| supervisor.check());
                        let delay = check.next_delay_ms(&timings);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                });
            }
            TaskId::SessionCheck => {
                let mut supervisor = SessionSupervisor::new(
                    cloud.clone(),
                    link.clone(),
                    runtime.cloud.clone(),
                    &runtime.session,
                );
                let mut interval = interval_for(&spec);
                tokio::spawn(async move {
                    loop {
                        interval.tick().await;
                        let check =
                            tokio::task::block_in_place(|| supervisor.check(monotonic_ms()));
                        if let SessionCheck::Abandoned { step } = check {
                            warn!("session worker stopped after {step:?} failed");
                            break;
                        }
                    }
                });
            }
            TaskId::Telemetry => {
                let mut worker = TelemetryWorker::new(
                    state.clone(),
                    cloud.clone(),
                    SimClimate::default(),
                    SimLight::default(),
                );
                spawn_periodic(&spec, move || {
                    worker.tick();
                });
            }
            TaskId::Attributes => {
                let reporter = AttributeReporter::new(cloud.clone(), link.clone());
                spawn_periodic(&spec, move || {
                    reporter.tick();
                });
            }
            TaskId::AttributeChanges => {
                let reporter = ChangeReporter::new(state.clone(), cloud.clone());
                spawn_periodic(&spec, move || {
                    reporter.tick();
                });
            }
            TaskId::SessionPump => {
                spawn_session_pump(&spec, cloud.clone(), dispatcher.clone());
            }
            TaskId::LightControl => {
                let strip = SimStrip::new(runtime.control.strip_pixels);
                let mut worker = LightStripWorker::new(state.clone(), strip, &runtime.control);
                spawn_periodic(&spec, move || {
                    worker.tick();
                });
            }
            TaskId::FanControl => {
                let mut worker =
                    FanWorker::new(state.clone(), SimFan::default(), &runtime.control);
                spawn_periodic(&spec, move || {
                    worker.tick();
                });
            }
            TaskId::Motion => {
                let mut worker =
                    MotionWorker::new(state.clone(), SimMotion::default(), led.clone());
                spawn_periodic(&spec, move || {
                    worker.tick();
                });
            }
            TaskId::Lcd => {
                let mut worker =
                    LcdWorker::new(state.clone(), SimLcd::default(), runtime.lcd.banner.clone());
                spawn_periodic(&spec, move || worker.tick());
            }
            TaskId::DisplayCounter => {
                let digits = digits.clone();
                spawn_periodic(&spec, move || digits.tick());
            }
            TaskId::DisplayRender => {
                spawn_render_thread(&spec, digits.clone())?;
            }
        }
    }

    info!(
        "node started, reporting to {}:{}",
        runtime.cloud.server, runtime.cloud.port
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

fn interval_for(spec: &TaskSpec) -> tokio::time::Interval {
    let period = spec.period.unwrap_or(RENDER_FRAME_PAUSE);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn spawn_periodic(spec: &TaskSpec, mut tick: impl FnMut() + Send + 'static) {
    let mut interval = interval_for(spec);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            tick();
        }
    });
}

fn spawn_session_pump(
    spec: &TaskSpec,
    cloud: Arc<CloudClient<MqttSession>>,
    dispatcher: Arc<Dispatcher>,
) {
    let period = spec.period.unwrap_or(RENDER_FRAME_PAUSE);
    tokio::spawn(async move {
        let mut generations = cloud.session().watch_generation();
        loop {
            let Some((generation, mut eventloop)) = cloud.session().take_eventloop() else {
                tokio::time::sleep(period).await;
                continue;
            };

            while cloud.session().is_current(generation) {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("mqtt connected");
                            cloud.session().mark_connected(generation);
                        }
                        Ok(Event::Incoming(Incoming::Publish(message))) => {
                            let reply = dispatcher.handle_inbound(&message.topic, &message.payload);
                            if let Some(reply) = reply {
                                if let Err(err) = cloud.publish_raw(&reply.topic, reply.payload) {
                                    warn!("rpc reply failed: {err}");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("mqtt connection lost: {err}");
                            cloud.session().mark_lost(generation, err.to_string());
                            break;
                        }
                    },
                    changed = generations.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_render_thread(spec: &TaskSpec, digits: Arc<DigitBuffer>) -> anyhow::Result<()> {
    let pause = spec.period.unwrap_or(RENDER_FRAME_PAUSE);
    thread::Builder::new()
        .name(spec.name().to_string())
        .stack_size(spec.stack_size())
        .spawn(move || {
            let mut display = ShiftRegisterDisplay::new(SimPin, SimPin, SimPin);
            loop {
                if let Err(err) = display.render(digits.snapshot()) {
                    warn!("{err}");
                }
                thread::sleep(pause);
            }
        })
        .context("failed to spawn display render thread")?;
    Ok(())
}

impl HostStore {
    fn new() -> Self {
        let data_dir = std::env::var("NODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.yolo-node"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw).with_context(|| {
                format!("invalid runtime config at {}", self.runtime_path.display())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl MqttSession {
    fn new() -> Self {
        Self {
            client: Mutex::new(None),
            eventloop: Mutex::new(None),
            generation: watch::Sender::new(0),
            connected: AtomicBool::new(false),
            lost: Mutex::new(None),
        }
    }

    fn take_eventloop(&self) -> Option<(u64, EventLoop)> {
        self.eventloop.lock().ok()?.take()
    }

    fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn next_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    fn mark_connected(&self, generation: u64) {
        if self.is_current(generation) {
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    fn mark_lost(&self, generation: u64, reason: String) {
        if self.is_current(generation) {
            self.connected.store(false, Ordering::SeqCst);
        }
        if let Ok(mut lost) = self.lost.lock() {
            *lost = Some((generation, reason));
        }
    }

    fn lost_reason(&self, generation: u64) -> Option<String> {
        match self.lost.lock().ok()?.as_ref() {
            Some((lost, reason)) if *lost == generation => Some(reason.clone()),
            _ => None,
        }
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client.lock().ok()?.clone()
    }
}

impl CloudSession for MqttSession {
    /// Blocks until the broker acknowledges the connection; the pump must be
    /// running to drive the handshake.
    fn connect(&self, cloud: &CloudConfig) -> Result<(), SessionError> {
        let connect_error = |reason: String| SessionError::Connect {
            server: cloud.server.clone(),
            port: cloud.port,
            reason,
        };
        self.disconnect();

        let mut options = MqttOptions::new(&cloud.client_id, &cloud.server, cloud.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !cloud.token.is_empty() {
            options.set_credentials(&cloud.token, "");
        }
        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        let generation = self.next_generation();

        *self
            .client
            .lock()
            .map_err(|_| connect_error("session lock poisoned".to_string()))? = Some(client);
        *self
            .eventloop
            .lock()
            .map_err(|_| connect_error("session lock poisoned".to_string()))? =
            Some((generation, eventloop));

        let started = Instant::now();
        let reason = loop {
            if self.is_connected() {
                return Ok(());
            }
            if let Some(reason) = self.lost_reason(generation) {
                break reason;
            }
            if started.elapsed() >= MQTT_CONNECT_TIMEOUT {
                break format!("no CONNACK within {}s", MQTT_CONNECT_TIMEOUT.as_secs());
            }
            thread::sleep(MQTT_CONNECT_POLL);
        };

        self.disconnect();
        Err(connect_error(reason))
    }

    fn disconnect(&self) {
        self.next_generation();
        self.connected.store(false, Ordering::SeqCst);
        let client = self.client.lock().ok().and_then(|mut client| client.take());
        if let Some(client) = client {
            let _ = client.try_disconnect();
        }
        if let Ok(mut eventloop) = self.eventloop.lock() {
            eventloop.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, topic_filter: &str) -> Result<(), SessionError> {
        let client = self.client().ok_or_else(|| SessionError::NotConnected {
            topic: topic_filter.to_string(),
        })?;
        client
            .try_subscribe(topic_filter, QoS::AtMostOnce)
            .map_err(|err| SessionError::Subscribe {
                topic: topic_filter.to_string(),
                reason: err.to_string(),
            })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let client = self.client().ok_or_else(|| SessionError::NotConnected {
            topic: topic.to_string(),
        })?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| SessionError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

/// The host is always on the network; diagnostics describe the outbound
/// interface.
struct HostLink {
    ssid: String,
    mac: [u8; 6],
}

impl HostLink {
    fn new(network: &NetworkConfig) -> Self {
        Self {
            ssid: network.wifi_ssid.clone(),
            mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        }
    }
}

fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

impl Link for HostLink {
    fn is_up(&self) -> bool {
        true
    }

    fn establish(&self, _network: &NetworkConfig) -> Result<(), LinkError> {
        Ok(())
    }

    fn diagnostics(&self) -> NetworkDiagnostics {
        NetworkDiagnostics {
            rssi: -50,
            channel: 1,
            local_ip: outbound_ipv4().unwrap_or(Ipv4Addr::LOCALHOST),
            ssid: self.ssid.clone(),
            ..NetworkDiagnostics::default()
        }
    }

    fn mac_address(&self) -> String {
        format_mac(self.mac)
    }
}

/// Climate readings sweeping across the fan curve, with a periodic failed read.
#[derive(Default)]
struct SimClimate {
    reads: u32,
}

impl ClimateSensor for SimClimate {
    fn read(&mut self) -> ClimateReading {
        self.reads = self.reads.wrapping_add(1);
        if self.reads % 30 == 0 {
            return ClimateReading::FAILED;
        }
        ClimateReading {
            temperature: 27.5 + (self.reads % 40) as f32 * 0.1,
            humidity: 55.0 + (self.reads % 10) as f32,
        }
    }
}

#[derive(Default)]
struct SimLight {
    raw: u16,
}

impl AnalogInput for SimLight {
    fn read_raw(&mut self) -> u16 {
        self.raw = (self.raw + 97) % 4096;
        self.raw
    }
}

#[derive(Default)]
struct SimMotion {
    reads: u32,
}

impl MotionSensor for SimMotion {
    fn motion_detected(&mut self) -> bool {
        self.reads = self.reads.wrapping_add(1);
        (self.reads / 10) % 2 == 0
    }
}

#[derive(Default)]
struct SimLed {
    lit: AtomicBool,
}

impl LedPin for SimLed {
    fn set_level(&self, on: bool) -> Result<(), HalError> {
        if self.lit.swap(on, Ordering::Relaxed) != on {
            debug!("led {}", if on { "on" } else { "off" });
        }
        Ok(())
    }
}

struct SimStrip {
    pixels: Vec<Rgb>,
    shown: Vec<Rgb>,
}

impl SimStrip {
    fn new(len: usize) -> Self {
        Self {
            pixels: vec![Rgb::OFF; len],
            shown: vec![Rgb::OFF; len],
        }
    }
}

impl PixelStrip for SimStrip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    fn show(&mut self) -> Result<(), HalError> {
        if self.pixels != self.shown {
            debug!("strip now {:?}", self.pixels.first());
            self.shown.clone_from(&self.pixels);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SimFan {
    duty: Option<u8>,
}

impl PwmOutput for SimFan {
    fn set_duty(&mut self, duty: u8) -> Result<(), HalError> {
        if self.duty != Some(duty) {
            debug!("fan duty {duty}");
            self.duty = Some(duty);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SimLcd;

impl CharacterDisplay for SimLcd {
    fn clear(&mut self) -> Result<(), HalError> {
        Ok(())
    }

    fn write_row(&mut self, row: u8, text: &str) -> Result<(), HalError> {
        debug!("lcd[{row}] |{text}|");
        Ok(())
    }
}

struct SimPin;

impl embedded_hal::digital::ErrorType for SimPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };
    use yolo_common::{config::SessionConfig, TOPIC_RPC_REQUEST_FILTER};

    use super::*;

    const CONNACK_DELAY: Duration = Duration::from_millis(50);
    const RPC_REQUEST_TOPIC: &str = "v1/devices/me/rpc/request/7";
    const RPC_RESPONSE_TOPIC: &str = "v1/devices/me/rpc/response/7";

    #[derive(Debug)]
    enum BrokerEvent {
        Accepted,
        Subscribed(String),
        Published(String, Vec<u8>),
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0_usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn read_string(body: &[u8], at: usize) -> (String, usize) {
        let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
        let text = String::from_utf8_lossy(&body[at + 2..at + 2 + len]).into_owned();
        (text, at + 2 + len)
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x30, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Minimal MQTT 3.1.1 broker that answers CONNECT late and sends one RPC
    /// request once the RPC filter is subscribed.
    async fn run_broker(
        listener: TcpListener,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> std::io::Result<()> {
        loop {
            let (mut stream, _) = listener.accept().await?;
            let _ = events.send(BrokerEvent::Accepted);
            let (header, _) = read_packet(&mut stream).await?;
            assert_eq!(header >> 4, 1);
            tokio::time::sleep(CONNACK_DELAY).await;
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;

            while let Ok((header, body)) = read_packet(&mut stream).await {
                match header >> 4 {
                    3 => {
                        let (topic, mut at) = read_string(&body, 0);
                        if (header >> 1) & 0x03 > 0 {
                            at += 2;
                        }
                        let _ = events.send(BrokerEvent::Published(topic, body[at..].to_vec()));
                    }
                    8 => {
                        let (filter, _) = read_string(&body, 2);
                        stream.write_all(&[0x90, 0x03, body[0], body[1], 0x00]).await?;
                        if filter == TOPIC_RPC_REQUEST_FILTER {
                            let request = br#"{"method":"setLedSwitchValue","params":true}"#;
                            stream
                                .write_all(&publish_packet(RPC_REQUEST_TOPIC, request))
                                .await?;
                        }
                        let _ = events.send(BrokerEvent::Subscribed(filter));
                    }
                    12 => stream.write_all(&[0xD0, 0x00]).await?,
                    14 => break,
                    _ => {}
                }
            }
        }
    }

    fn pump_spec() -> TaskSpec {
        TaskSpec {
            id: TaskId::SessionPump,
            period: Some(Duration::from_millis(10)),
        }
    }

    fn cloud_config(port: u16) -> CloudConfig {
        CloudConfig {
            server: Ipv4Addr::LOCALHOST.to_string(),
            port,
            ..CloudConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_broker_gets_subscriptions_and_rpc_reply() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        tokio::spawn(run_broker(listener, events_tx));

        let state = Arc::new(SharedState::new());
        let cloud = Arc::new(CloudClient::new(MqttSession::new()));
        let led = Arc::new(SimLed::default());
        let dispatcher = Arc::new(Dispatcher::new(state.clone(), led, 1024));
        spawn_session_pump(&pump_spec(), cloud.clone(), dispatcher);

        let mut supervisor = SessionSupervisor::new(
            cloud.clone(),
            Arc::new(HostLink::new(&NetworkConfig::default())),
            cloud_config(port),
            &SessionConfig::default(),
        );
        let check = tokio::task::spawn_blocking(move || supervisor.check(0))
            .await
            .unwrap();
        assert_eq!(check, SessionCheck::Established);
        assert!(cloud.session().is_connected());

        let mut accepts = 0;
        let mut subscriptions = Vec::new();
        let reply = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("broker saw no rpc reply")
                .expect("broker stopped");
            match event {
                BrokerEvent::Accepted => accepts += 1,
                BrokerEvent::Subscribed(filter) => subscriptions.push(filter),
                BrokerEvent::Published(topic, payload) if topic == RPC_RESPONSE_TOPIC => {
                    break payload;
                }
                BrokerEvent::Published(..) => {}
            }
        };

        assert_eq!(accepts, 1);
        assert!(subscriptions.contains(&TOPIC_RPC_REQUEST_FILTER.to_string()));
        assert_eq!(
            serde_json::from_slice::<Value>(&reply).unwrap(),
            json!({ "setLedSwitchValue": true })
        );
        assert!(state.led_output());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_connection_fails_connect_without_waiting_for_timeout() {
        let port = {
            let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let cloud = Arc::new(CloudClient::new(MqttSession::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SharedState::new()),
            Arc::new(SimLed::default()),
            1024,
        ));
        spawn_session_pump(&pump_spec(), cloud.clone(), dispatcher);

        let started = Instant::now();
        let session = cloud.clone();
        let result = tokio::task::spawn_blocking(move || {
            session.session().connect(&cloud_config(port))
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(SessionError::Connect { .. })));
        assert!(started.elapsed() < MQTT_CONNECT_TIMEOUT);
        assert!(!cloud.session().is_connected());
    }

    #[test]
    fn disconnect_supersedes_the_current_generation() {
        let session = MqttSession::new();
        let generation = session.next_generation();
        session.mark_connected(generation);
        assert!(session.is_connected());

        session.disconnect();
        assert!(!session.is_current(generation));
        session.mark_connected(generation);
        assert!(!session.is_connected());
        assert!(session.take_eventloop().is_none());
    }
}
