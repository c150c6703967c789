//! Device Registry and Service Tests
//!
//! Tests the registry lifecycle through the service layer including:
//! - Registration, duplicate addresses and declared capability sets
//! - Resource release on unregister and on failed driver start
//! - Devices stay invisible until their driver has started
//! - Stopping and restarting devices
//! - Drivers that fail to stop
//! - Registry events

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nvos_core::{Configuration, DeviceEvent};
use nvos_devices::{
    BusKind, Capability, CapabilityTable, ControllerSpec, DeviceDriver, DeviceError,
    DeviceRegistry, DeviceService, DeviceSpec, DriverCatalog, DriverContext, DriverFactory,
    DriverInstance, GainValue, SimulatedProvider, SleepInterval, Thermometer,
};

/// TSL2591 answering at 0x29 with chip id and a fixed sample.
fn light_sensor_registers() -> serde_json::Value {
    json!({
        "registers": {
            "0x29": { "0xb2": 80, "0xb4": 232, "0xb5": 3, "0xb6": 200, "0xb7": 0 }
        }
    })
}

fn fast_config() -> Configuration {
    let mut config = Configuration::default();
    config.arbiter.acquire_timeout_ms = 50;
    config.driver.retry_backoff_ms = 1;
    config
}

async fn setup_with(catalog: DriverCatalog) -> (DeviceService, Arc<SimulatedProvider>) {
    let config = fast_config();
    let provider = Arc::new(SimulatedProvider::new());
    let registry = DeviceRegistry::with_catalog(catalog)
        .with_settings(nvos_devices::RegistrySettings::from(&config));
    let service = DeviceService::new(Arc::new(registry), provider.clone());

    service
        .load_controller(ControllerSpec::new("i2c1", BusKind::I2c).with_data(light_sensor_registers()))
        .await
        .unwrap();
    service
        .load_controller(ControllerSpec::new("uart0", BusKind::Uart))
        .await
        .unwrap();
    (service, provider)
}

async fn setup() -> (DeviceService, Arc<SimulatedProvider>) {
    setup_with(DriverCatalog::builtin()).await
}

fn light_spec(address: &str) -> DeviceSpec {
    DeviceSpec::new(address, "tsl2591", "i2c1").with_config(json!({ "auto_gain": false }))
}

#[tokio::test]
async fn test_register_and_lookup() {
    let (service, _) = setup().await;
    let registry = service.registry();

    let info = registry.register(light_spec("i2c1:light")).await.unwrap();
    assert_eq!(info.driver_name, "tsl2591");
    assert_eq!(info.controller, "i2c1");
    assert!(info.is_running);
    assert_eq!(info.capabilities, BTreeSet::from([Capability::LightSensor]));

    let handle = registry
        .lookup("i2c1:light", Capability::LightSensor)
        .await
        .unwrap();
    assert_eq!(handle.capability(), Capability::LightSensor);

    // Not implemented by the driver
    assert!(matches!(
        registry.lookup("i2c1:light", Capability::Gps).await,
        Err(DeviceError::CapabilityNotSupported { .. })
    ));
    assert!(matches!(
        registry.lookup("i2c1:dark", Capability::LightSensor).await,
        Err(DeviceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_address_leaves_state_unchanged() {
    let (service, _) = setup().await;
    let registry = service.registry();

    let first = registry.register(light_spec("sensor")).await.unwrap();
    let err = registry
        .register(DeviceSpec::new("sensor", "gps_uart", "uart0"))
        .await
        .unwrap_err();
    assert_eq!(err, DeviceError::DuplicateAddress("sensor".to_string()));

    let devices = registry.list_devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices.iter().next(), Some(&first));

    // The GPS never took the serial port
    assert!(registry.arbiter().holder("uart:uart0:0").is_none());
    assert!(registry.lookup("sensor", Capability::Gps).await.is_err());
}

#[tokio::test]
async fn test_declared_capabilities_must_be_implemented() {
    let (service, _) = setup().await;
    let registry = service.registry();

    let err = registry
        .register(light_spec("light").with_capabilities([Capability::Barometer]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::CapabilityNotSupported {
            capability: Capability::Barometer,
            ..
        }
    ));
    assert_eq!(registry.device_count().await, 0);
    assert!(registry.arbiter().held_by("light").is_empty());

    // An empty declaration advertises everything the driver implements
    let info = registry
        .register(light_spec("light").with_capabilities(Vec::<Capability>::new()))
        .await
        .unwrap();
    assert_eq!(info.capabilities, BTreeSet::from([Capability::LightSensor]));
}

#[tokio::test]
async fn test_unregister_releases_resources() {
    let (service, provider) = setup().await;
    let registry = service.registry();

    registry.register(light_spec("light")).await.unwrap();
    assert_eq!(registry.arbiter().held_by("light"), vec!["i2c:i2c1:41".to_string()]);

    registry.unregister("light").await.unwrap();
    assert!(registry.arbiter().held_by("light").is_empty());
    assert!(matches!(
        registry.lookup("light", Capability::LightSensor).await,
        Err(DeviceError::NotFound(_))
    ));

    let transport = provider.transport("i2c1").unwrap();
    assert_eq!(transport.release_count(0x29), 1);
    // Powered down on the way out
    assert_eq!(transport.registers(0x29, 0xA0, 1), vec![0x00]);

    // Another owner gets the channel at once
    let token = registry
        .arbiter()
        .acquire("i2c:i2c1:41", "other-owner", Duration::ZERO)
        .await
        .unwrap();
    registry.arbiter().release(token).unwrap();

    // The address and the channel are free again
    registry.register(light_spec("light")).await.unwrap();
    assert!(matches!(
        registry.unregister("nowhere").await,
        Err(DeviceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_contended_channel_reports_busy() {
    let (service, _) = setup().await;
    let registry = service.registry();

    registry.register(light_spec("first")).await.unwrap();
    let err = registry.register(light_spec("second")).await.unwrap_err();
    match &err {
        DeviceError::ResourceBusy { resource, holder } => {
            assert_eq!(resource, "i2c:i2c1:41");
            assert_eq!(holder, "first");
        }
        other => panic!("expected ResourceBusy, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert_eq!(registry.device_count().await, 1);
}

#[tokio::test]
async fn test_failed_start_unwinds() {
    let (service, provider) = setup().await;
    let registry = service.registry();

    // Nothing answers at 0x30
    let err = registry
        .register(
            DeviceSpec::new("ghost", "tsl2591", "i2c1").with_config(json!({ "address": 0x30 })),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, DeviceError::DriverInitFailed { ref address, .. } if address == "ghost"),
        "unexpected error {:?}",
        err
    );
    assert!(registry.arbiter().held_by("ghost").is_empty());
    assert!(registry.list_devices().await.is_empty());

    // Wrong chip id at a live address
    provider
        .transport("i2c1")
        .unwrap()
        .set_registers(0x31, 0xB2, &[0x11]);
    assert!(registry
        .register(DeviceSpec::new("wrong", "tsl2591", "i2c1").with_config(json!({ "address": 0x31 })))
        .await
        .is_err());
    assert!(registry.arbiter().holder("i2c:i2c1:49").is_none());
}

#[tokio::test]
async fn test_wrong_bus_kind_and_unknown_names() {
    let (service, _) = setup().await;
    let registry = service.registry();

    assert!(matches!(
        registry
            .register(DeviceSpec::new("gps", "gps_uart", "i2c1"))
            .await,
        Err(DeviceError::InvalidConfig(_))
    ));
    assert!(matches!(
        registry
            .register(DeviceSpec::new("x", "compass", "i2c1"))
            .await,
        Err(DeviceError::UnknownDriver(_))
    ));
    assert!(matches!(
        service.load_driver("gps_uart", "gps", "uart7", json!(null)).await,
        Err(DeviceError::UnknownBusController(_))
    ));
    assert!(matches!(
        registry
            .register(light_spec("light").with_config(json!({ "gain_id": 9 })))
            .await,
        Err(DeviceError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_stop_and_start_device() {
    let (service, _) = setup().await;
    let registry = service.registry();
    registry.register(light_spec("light")).await.unwrap();

    registry.stop_device("light").await.unwrap();
    assert!(!registry.device("light").await.unwrap().is_running);
    assert!(registry.arbiter().held_by("light").is_empty());
    assert!(matches!(
        registry.lookup("light", Capability::LightSensor).await,
        Err(DeviceError::NotRunning(_))
    ));
    // Stopping twice is a no-op
    registry.stop_device("light").await.unwrap();

    registry.start_device("light").await.unwrap();
    let sensor = registry.light_sensor("light").await.unwrap();
    assert_eq!(sensor.luminosity(0).await.unwrap(), 1000);
}

#[tokio::test]
async fn test_list_devices_snapshot() {
    let (service, _) = setup().await;
    let registry = service.registry();

    registry.register(light_spec("b")).await.unwrap();
    registry
        .register(DeviceSpec::new("a", "gps_uart", "uart0").with_name("Roof GPS"))
        .await
        .unwrap();

    let snapshot = registry.list_devices().await;
    let addresses: Vec<_> = snapshot.iter().map(|d| d.address.as_str()).collect();
    assert_eq!(addresses, vec!["a", "b"]);
    assert_eq!(snapshot.iter().next().unwrap().device_name, "Roof GPS");

    // Later changes do not show up in an existing snapshot
    registry.unregister("b").await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.iter().count(), 2);
    assert_eq!(registry.list_devices().await.len(), 1);

    assert!(service.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_device_hidden_until_started() {
    let (service, provider) = setup().await;
    provider
        .transport("i2c1")
        .unwrap()
        .set_latency(Duration::from_millis(40));

    let registry = service.registry().clone();
    let task = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.register(light_spec("slow")).await })
    };

    let mut observed_in_flight = 0;
    while !task.is_finished() {
        let channel_taken = registry.arbiter().holder("i2c:i2c1:41").is_some();
        assert!(registry.list_devices().await.is_empty());
        assert!(matches!(
            registry.lookup("slow", Capability::LightSensor).await,
            Err(DeviceError::NotFound(_))
        ));
        if channel_taken {
            observed_in_flight += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(observed_in_flight > 0);

    let info = task.await.unwrap().unwrap();
    assert!(info.is_running);
    assert_eq!(registry.list_devices().await.len(), 1);
    assert!(registry.lookup("slow", Capability::LightSensor).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_registration_of_distinct_devices() {
    let (service, provider) = setup().await;
    let transport = provider.transport("i2c1").unwrap();
    for address in 0x40..0x48u32 {
        transport.set_registers(address, 0xB2, &[0x50]);
    }

    let registry = service.registry().clone();
    let mut handles = Vec::new();
    for address in 0x40..0x48u32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .register(
                    DeviceSpec::new(format!("light{:x}", address), "tsl2591", "i2c1")
                        .with_config(json!({ "address": address })),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(registry.device_count().await, 8);
}

#[tokio::test]
async fn test_registry_events() {
    let (service, _) = setup().await;
    let registry = service.registry();
    let mut rx = registry.event_bus().subscribe_device("light");

    registry.register(light_spec("light")).await.unwrap();
    registry.stop_device("light").await.unwrap();
    registry.unregister("light").await.unwrap();

    let (event, _) = rx.recv().await.unwrap();
    assert!(matches!(event, DeviceEvent::DeviceRegistered { ref driver, .. } if driver == "tsl2591"));
    let (event, _) = rx.recv().await.unwrap();
    assert!(matches!(
        event,
        DeviceEvent::DeviceStateChanged { running: false, .. }
    ));
    let (event, _) = rx.recv().await.unwrap();
    assert!(matches!(event, DeviceEvent::DeviceUnregistered { .. }));
}

// ========== A driver that fails to stop ==========

struct FlakyThermometer {
    stop_failures: AtomicU32,
    running: AtomicBool,
}

#[async_trait]
impl DeviceDriver for FlakyThermometer {
    fn driver_name(&self) -> &'static str {
        "flaky"
    }

    fn device_name(&self) -> String {
        "Flaky thermometer".to_string()
    }

    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError> {
        // The grant stays with the arbiter until the registry releases the owner.
        let _lease = ctx.acquire(ctx.controller(), 5).await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::SeqCst);
        let remaining = self.stop_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.stop_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DeviceError::Hardware("bus wedged".to_string()));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Thermometer for FlakyThermometer {
    fn supported_gains(&self) -> Vec<GainValue> {
        Vec::new()
    }

    fn supported_intervals(&self) -> Vec<SleepInterval> {
        Vec::new()
    }

    async fn gain(&self) -> Result<GainValue, DeviceError> {
        Err(DeviceError::Hardware("no gain".to_string()))
    }

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError> {
        Err(DeviceError::UnsupportedOption { option: "gain", id })
    }

    async fn interval(&self) -> Result<SleepInterval, DeviceError> {
        Err(DeviceError::Hardware("no interval".to_string()))
    }

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError> {
        Err(DeviceError::UnsupportedOption {
            option: "interval",
            id,
        })
    }

    async fn temperature_celsius(&self) -> Result<f32, DeviceError> {
        Ok(21.5)
    }
}

struct FlakyFactory;

impl DriverFactory for FlakyFactory {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn description(&self) -> &'static str {
        "Thermometer whose first stop fails"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Thermometer]
    }

    fn supported_buses(&self) -> &'static [BusKind] {
        &[BusKind::I2c]
    }

    fn create(&self, _config: &serde_json::Value) -> Result<DriverInstance, DeviceError> {
        let driver = Arc::new(FlakyThermometer {
            stop_failures: AtomicU32::new(1),
            running: AtomicBool::new(false),
        });
        Ok(DriverInstance {
            driver: driver.clone(),
            capabilities: CapabilityTable::new().with_thermometer(driver),
        })
    }
}

#[tokio::test]
async fn test_stop_failure_keeps_device_for_retry() {
    let mut catalog = DriverCatalog::builtin();
    catalog.register(Arc::new(FlakyFactory)).unwrap();
    let (service, _) = setup_with(catalog).await;
    let registry = service.registry();

    registry
        .register(DeviceSpec::new("flaky", "flaky", "i2c1"))
        .await
        .unwrap();
    let thermometer = registry.thermometer("flaky").await.unwrap();
    let fahrenheit = thermometer.temperature_fahrenheit().await.unwrap();
    assert!((fahrenheit - 70.7).abs() < 0.01);

    let err = registry.unregister("flaky").await.unwrap_err();
    assert_eq!(err, DeviceError::Hardware("bus wedged".to_string()));

    // Resources are gone, the entry stays behind as not running
    assert!(registry.arbiter().held_by("flaky").is_empty());
    let info = registry.device("flaky").await.unwrap();
    assert!(!info.is_running);
    assert!(matches!(
        registry.thermometer("flaky").await,
        Err(DeviceError::NotRunning(_))
    ));

    registry.unregister("flaky").await.unwrap();
    assert_eq!(registry.device_count().await, 0);
}

#[tokio::test]
async fn test_bootstrap_from_configuration() {
    let provider = Arc::new(SimulatedProvider::new());
    let config: Configuration = serde_json::from_value(json!({
        "driver": { "retry_backoff_ms": 1 },
        "controllers": [
            { "name": "i2c1", "kind": "i2c", "data": light_sensor_registers() },
            { "name": "uart0", "kind": "uart", "channels": [0] }
        ],
        "devices": [
            { "address": "light", "driver": "tsl2591", "controller": "i2c1",
              "capabilities": ["LightSensor"], "data": { "auto_gain": false } },
            { "address": "gps", "driver": "gps_uart", "controller": "uart0",
              "data": { "port": 1 } }
        ]
    }))
    .unwrap();

    let service = DeviceService::from_config(&config, provider);
    let report = service.bootstrap(&config).await;
    assert_eq!(report.controllers_loaded, 2);
    assert_eq!(report.devices_loaded, 1);
    // Port 1 is outside the controller's channel list
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].item, "device gps");
    assert!(report.failures[0].error.contains("uart:uart0:1"));
}
