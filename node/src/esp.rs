use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::oneshot::AdcDriver,
    gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    task::thread::ThreadSpawnConfiguration,
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi, WifiDeviceId},
};
use log::{debug, info, warn};

use yolo_common::{
    config::{CloudConfig, NetworkConfig},
    control::{FanWorker, LightStripWorker, MotionWorker},
    display::{DigitBuffer, ShiftRegisterDisplay},
    hal::{format_mac, NetworkDiagnostics},
    lcd::LcdWorker,
    session::{LinkSupervisor, SessionCheck, SessionSupervisor},
    telemetry::{AttributeReporter, ChangeReporter, TelemetryWorker},
    roster, CloudClient, CloudSession, Dispatcher, Link, LinkError, RuntimeConfig, SessionError,
    SharedState, TaskId, TaskSpec,
};

use crate::drivers::{Dht20, GpioLed, Hd44780, LedcFan, LightAdc, PirSensor, SharedI2c, Ws2812};

const NVS_NAMESPACE: &str = "yolo-node";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_READ_BUFFER: usize = 4096;

const LCD_ADDRESS: u8 = 0x21;
const FAN_PWM_KHZ: u32 = 25;
const RENDER_TASK_PRIORITY: u8 = 2;
const RENDER_FRAME_PAUSE: Duration = Duration::from_millis(1);

const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_CONNECT_POLL: Duration = Duration::from_millis(100);

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Wi-Fi station. The driver sits behind a mutex because `establish` runs on
/// the link task while diagnostics are read from the attribute reporter.
struct EspLink {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    local_ip: Mutex<Ipv4Addr>,
}

/// ESP-IDF MQTT session. Each `connect` creates a client whose connection is
/// handed to the pump thread tagged with a generation number; events from a
/// superseded generation are ignored.
struct EspCloudSession {
    client: Mutex<Option<EspMqttClient<'static>>>,
    connection: Mutex<Option<(u64, EspMqttConnection)>>,
    generation: AtomicU64,
    connected: AtomicBool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_build_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "config loaded: ssid=`{}`, cloud=`{}:{}`",
        runtime.network.wifi_ssid, runtime.cloud.server, runtime.cloud.port
    );

    let peripherals = Peripherals::take()?;
    let pins = &runtime.pins;

    let link = Arc::new(EspLink::new(peripherals.modem, sys_loop, nvs_partition)?);
    let state = Arc::new(SharedState::new());
    let led = Arc::new(GpioLed(Mutex::new(PinDriver::output(unsafe {
        AnyOutputPin::new(pins.led)
    })?)));
    let cloud = Arc::new(CloudClient::new(EspCloudSession::new()));
    let dispatcher = Arc::new(Dispatcher::new(
        state.clone(),
        led.clone(),
        runtime.cloud.max_message_size,
    ));
    let digits = Arc::new(DigitBuffer::new());

    let i2c: SharedI2c = Arc::new(Mutex::new(
        I2cDriver::new(
            peripherals.i2c0,
            unsafe { AnyIOPin::new(pins.sda) },
            unsafe { AnyIOPin::new(pins.scl) },
            &I2cConfig::new().baudrate(100.kHz().into()),
        )
        .context("failed to init i2c bus")?,
    ));

    if pins.light_sensor != 1 {
        warn!(
            "light sensor is wired to GPIO1 (ADC1 channel 0), ignoring configured pin {}",
            pins.light_sensor
        );
    }
    let mut light = Some(LightAdc::new(
        AdcDriver::new(peripherals.adc1)?,
        peripherals.pins.gpio1,
    )?);
    let mut strip = Some(Ws2812::new(
        peripherals.rmt.channel0,
        unsafe { AnyOutputPin::new(pins.light_strip) },
        runtime.control.strip_pixels,
    )?);
    let fan_timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::new()
            .frequency(FAN_PWM_KHZ.kHz().into())
            .resolution(Resolution::Bits8),
    )?;
    let mut fan = Some(LedcFan(LedcDriver::new(
        peripherals.ledc.channel0,
        fan_timer,
        unsafe { AnyOutputPin::new(pins.fan) },
    )?));
    let mut motion = Some(PirSensor(PinDriver::input(unsafe {
        AnyInputPin::new(pins.motion)
    })?));
    let mut lcd = Some(
        Hd44780::new(i2c.clone(), LCD_ADDRESS)
            .map_err(|err| warn!("lcd unavailable: {err:#}"))
            .ok(),
    );
    let mut display_pins = Some((
        PinDriver::output(unsafe { AnyOutputPin::new(pins.display_data) })?,
        PinDriver::output(unsafe { AnyOutputPin::new(pins.display_clock) })?,
        PinDriver::output(unsafe { AnyOutputPin::new(pins.display_latch) })?,
    ));

    for spec in roster(&runtime.tasks) {
        debug!("starting task {}", spec.name());
        match spec.id {
            TaskId::LinkCheck => {
                let mut supervisor = LinkSupervisor::new(link.clone(), runtime.network.clone());
                let timings = runtime.tasks.clone();
                spawn_task(&spec, move || loop {
                    let delay = supervisor.check().next_delay_ms(&timings);
                    thread::sleep(Duration::from_millis(delay));
                })?;
            }
            TaskId::SessionCheck => {
                let mut supervisor = SessionSupervisor::new(
                    cloud.clone(),
                    link.clone(),
                    runtime.cloud.clone(),
                    &runtime.session,
                );
                let period = period_of(&spec);
                spawn_task(&spec, move || loop {
                    if let SessionCheck::Abandoned { step } = supervisor.check(monotonic_ms()) {
                        warn!("session worker stopped after {step:?} failed");
                        break;
                    }
                    thread::sleep(period);
                })?;
            }
            TaskId::Telemetry => {
                let light = light.take().ok_or_else(|| anyhow!("light sensor taken"))?;
                let climate = Dht20::new(i2c.clone());
                let mut worker = TelemetryWorker::new(state.clone(), cloud.clone(), climate, light);
                spawn_periodic(&spec, move || {
                    worker.tick();
                })?;
            }
            TaskId::Attributes => {
                let reporter = AttributeReporter::new(cloud.clone(), link.clone());
                spawn_periodic(&spec, move || {
                    reporter.tick();
                })?;
            }
            TaskId::AttributeChanges => {
                let reporter = ChangeReporter::new(state.clone(), cloud.clone());
                spawn_periodic(&spec, move || {
                    reporter.tick();
                })?;
            }
            TaskId::SessionPump => {
                spawn_session_pump(&spec, cloud.clone(), dispatcher.clone())?;
            }
            TaskId::LightControl => {
                let strip = strip.take().ok_or_else(|| anyhow!("light strip taken"))?;
                let mut worker = LightStripWorker::new(state.clone(), strip, &runtime.control);
                spawn_periodic(&spec, move || {
                    worker.tick();
                })?;
            }
            TaskId::FanControl => {
                let fan = fan.take().ok_or_else(|| anyhow!("fan taken"))?;
                let mut worker = FanWorker::new(state.clone(), fan, &runtime.control);
                spawn_periodic(&spec, move || {
                    worker.tick();
                })?;
            }
            TaskId::Motion => {
                let sensor = motion.take().ok_or_else(|| anyhow!("motion sensor taken"))?;
                let mut worker = MotionWorker::new(state.clone(), sensor, led.clone());
                spawn_periodic(&spec, move || {
                    worker.tick();
                })?;
            }
            TaskId::Lcd => {
                let Some(display) = lcd.take().flatten() else {
                    continue;
                };
                let mut worker = LcdWorker::new(state.clone(), display, runtime.lcd.banner.clone());
                spawn_periodic(&spec, move || worker.tick())?;
            }
            TaskId::DisplayCounter => {
                let digits = digits.clone();
                spawn_periodic(&spec, move || digits.tick())?;
            }
            TaskId::DisplayRender => {
                let (data, clock, latch) = display_pins
                    .take()
                    .ok_or_else(|| anyhow!("display pins taken"))?;
                let mut display = ShiftRegisterDisplay::new(data, clock, latch);
                let digits = digits.clone();
                spawn_render_task(&spec, move || loop {
                    if let Err(err) = display.render(digits.snapshot()) {
                        warn!("{err}");
                    }
                    thread::sleep(RENDER_FRAME_PAUSE);
                })?;
            }
        }
    }

    info!(
        "node started, reporting to {}:{}",
        runtime.cloud.server, runtime.cloud.port
    );

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_build_defaults(runtime: &mut RuntimeConfig) {
    let defaults = [
        (&mut runtime.network.wifi_ssid, option_env!("WIFI_SSID")),
        (&mut runtime.network.wifi_pass, option_env!("WIFI_PASS")),
        (&mut runtime.cloud.token, option_env!("DEVICE_TOKEN")),
    ];
    for (field, built_in) in defaults {
        if let (true, Some(value)) = (field.is_empty(), built_in) {
            *field = value.to_string();
        }
    }
}

fn period_of(spec: &TaskSpec) -> Duration {
    spec.period.unwrap_or(RENDER_FRAME_PAUSE)
}

fn spawn_task(spec: &TaskSpec, body: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(spec.name().to_string())
        .stack_size(spec.stack_size())
        .spawn(body)
        .with_context(|| format!("failed to spawn task {}", spec.name()))?;
    Ok(())
}

fn spawn_periodic(spec: &TaskSpec, mut tick: impl FnMut() + Send + 'static) -> anyhow::Result<()> {
    let period = period_of(spec);
    spawn_task(spec, move || loop {
        tick();
        thread::sleep(period);
    })
}

/// The render loop runs below the default task priority so it only takes
/// otherwise idle time.
fn spawn_render_task(
    spec: &TaskSpec,
    body: impl FnOnce() + Send + 'static,
) -> anyhow::Result<()> {
    ThreadSpawnConfiguration {
        priority: RENDER_TASK_PRIORITY,
        ..Default::default()
    }
    .set()
    .context("failed to lower render task priority")?;
    let spawned = spawn_task(spec, body);
    ThreadSpawnConfiguration::default()
        .set()
        .context("failed to restore task spawn configuration")?;
    spawned
}

fn spawn_session_pump(
    spec: &TaskSpec,
    cloud: Arc<CloudClient<EspCloudSession>>,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    let period = period_of(spec);
    spawn_task(spec, move || loop {
        let Some((generation, mut connection)) = cloud.session().take_connection() else {
            thread::sleep(period);
            continue;
        };

        // `next` blocks until an event arrives and fails once the client is dropped.
        while let Ok(event) = connection.next() {
            if !cloud.session().is_current(generation) {
                break;
            }
            let reply = match event.payload() {
                EventPayload::Connected(_) => {
                    info!("mqtt connected");
                    cloud.session().mark_connected(generation, true);
                    None
                }
                EventPayload::Disconnected => {
                    warn!("mqtt disconnected");
                    cloud.session().mark_connected(generation, false);
                    None
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => dispatcher.handle_inbound(topic, data),
                EventPayload::Received { .. } => {
                    debug!("ignoring fragmented or topic-less mqtt message");
                    None
                }
                _ => None,
            };
            // The mqtt task holds the client lock until the event is released.
            drop(event);

            if let Some(reply) = reply {
                if let Err(err) = cloud.publish_raw(&reply.topic, reply.payload) {
                    warn!("rpc reply failed: {err}");
                }
            }
        }
        cloud.session().mark_connected(generation, false);
    })
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_READ_BUFFER];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
            local_ip: Mutex::new(Ipv4Addr::UNSPECIFIED),
        })
    }

    fn try_establish(
        wifi: &mut BlockingWifi<EspWifi<'static>>,
        network: &NetworkConfig,
    ) -> anyhow::Result<Ipv4Addr> {
        if !wifi.is_started()? {
            let auth_method = if network.wifi_pass.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            };
            wifi.set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: network
                    .wifi_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: network
                    .wifi_pass
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
            wifi.start()?;
            info!("wifi started");
        }

        wifi.connect()?;
        wifi.wait_netif_up()?;
        Ok(wifi.wifi().sta_netif().get_ip_info()?.ip)
    }
}

fn ap_info() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
}

impl Link for EspLink {
    fn is_up(&self) -> bool {
        ap_info().is_some()
    }

    fn establish(&self, network: &NetworkConfig) -> Result<(), LinkError> {
        if network.wifi_ssid.is_empty() {
            return Err(LinkError("no ssid configured".to_string()));
        }
        let mut wifi = self
            .wifi
            .lock()
            .map_err(|_| LinkError("wifi lock poisoned".to_string()))?;

        match Self::try_establish(&mut wifi, network) {
            Ok(ip) => {
                if let Ok(mut local_ip) = self.local_ip.lock() {
                    *local_ip = ip;
                }
                Ok(())
            }
            Err(err) => {
                let _ = wifi.disconnect();
                Err(LinkError(format!("{err:#}")))
            }
        }
    }

    fn diagnostics(&self) -> NetworkDiagnostics {
        let local_ip = self
            .local_ip
            .lock()
            .map(|ip| *ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let Some(ap) = ap_info() else {
            return NetworkDiagnostics {
                local_ip,
                ..NetworkDiagnostics::default()
            };
        };
        let ssid_len = ap.ssid.iter().position(|byte| *byte == 0).unwrap_or(ap.ssid.len());

        NetworkDiagnostics {
            rssi: ap.rssi,
            channel: ap.primary,
            bssid: format_mac(ap.bssid),
            local_ip,
            ssid: String::from_utf8_lossy(&ap.ssid[..ssid_len]).into_owned(),
        }
    }

    fn mac_address(&self) -> String {
        static MAC: OnceLock<[u8; 6]> = OnceLock::new();
        if let Some(mac) = MAC.get() {
            return format_mac(*mac);
        }
        let mac = self
            .wifi
            .lock()
            .ok()
            .and_then(|wifi| wifi.wifi().get_mac(WifiDeviceId::Sta).ok());
        match mac {
            Some(mac) => format_mac(*MAC.get_or_init(|| mac)),
            None => format_mac([0; 6]),
        }
    }
}

impl EspCloudSession {
    fn new() -> Self {
        Self {
            client: Mutex::new(None),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    fn take_connection(&self) -> Option<(u64, EspMqttConnection)> {
        self.connection.lock().ok()?.take()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn mark_connected(&self, generation: u64, connected: bool) {
        if self.is_current(generation) {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }

    fn drop_client(&self) {
        let client = self.client.lock().ok().and_then(|mut client| client.take());
        drop(client);
        if let Ok(mut connection) = self.connection.lock() {
            connection.take();
        }
    }

    fn with_client<T>(
        &self,
        topic: &str,
        op: impl FnOnce(&mut EspMqttClient<'static>) -> T,
    ) -> Result<T, SessionError> {
        let not_connected = || SessionError::NotConnected {
            topic: topic.to_string(),
        };
        let mut client = self.client.lock().map_err(|_| not_connected())?;
        client.as_mut().map(op).ok_or_else(not_connected)
    }
}

impl CloudSession for EspCloudSession {
    fn connect(&self, cloud: &CloudConfig) -> Result<(), SessionError> {
        let connect_error = |reason: String| SessionError::Connect {
            server: cloud.server.clone(),
            port: cloud.port,
            reason,
        };
        self.disconnect();

        let url = format!("mqtt://{}:{}", cloud.server, cloud.port);
        let conf = MqttClientConfiguration {
            client_id: Some(cloud.client_id.as_str()),
            username: (!cloud.token.is_empty()).then_some(cloud.token.as_str()),
            buffer_size: cloud.max_message_size,
            ..Default::default()
        };
        let (client, connection) =
            EspMqttClient::new(&url, &conf).map_err(|err| connect_error(err.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .client
            .lock()
            .map_err(|_| connect_error("session lock poisoned".to_string()))? = Some(client);
        *self
            .connection
            .lock()
            .map_err(|_| connect_error("session lock poisoned".to_string()))? =
            Some((generation, connection));

        let started = Instant::now();
        while started.elapsed() < MQTT_CONNECT_TIMEOUT {
            if self.is_connected() {
                return Ok(());
            }
            thread::sleep(MQTT_CONNECT_POLL);
        }

        self.disconnect();
        Err(connect_error(format!(
            "no CONNACK within {}s",
            MQTT_CONNECT_TIMEOUT.as_secs()
        )))
    }

    fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.drop_client();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, topic_filter: &str) -> Result<(), SessionError> {
        self.with_client(topic_filter, |client| {
            client.subscribe(topic_filter, QoS::AtMostOnce)
        })?
        .map(drop)
        .map_err(|err| SessionError::Subscribe {
            topic: topic_filter.to_string(),
            reason: err.to_string(),
        })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        self.with_client(topic, |client| {
            client.publish(topic, QoS::AtMostOnce, false, &payload)
        })?
        .map(drop)
        .map_err(|err| SessionError::Publish {
            topic: topic.to_string(),
            reason: err.to_string(),
        })
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
