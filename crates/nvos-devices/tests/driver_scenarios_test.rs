//! Built-in Driver Scenario Tests
//!
//! Runs each shipped driver against simulated buses:
//! - GPS receiver on a UART fed with NMEA sentences, across restarts
//! - LED with PWM brightness and a GPIO mode switch
//! - TSL2591 light sensor option handling
//! - BMP280 thermometer and barometer with datasheet calibration

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use nvos_core::Configuration;
use nvos_devices::{
    BusKind, ChannelSetting, ControllerSpec, DeviceError, DeviceService, DeviceSpec, LedMode,
    SimulatedProvider,
};

const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

/// BMP280 datasheet example trimming values, 0x88..0x9F.
const BMP280_CALIBRATION: [u8; 24] = [
    0x70, 0x6B, 0x43, 0x67, 0x18, 0xFC, 0x7D, 0x8E, 0x43, 0xD6, 0xD0, 0x0B, 0x27, 0x0B, 0x8C,
    0x00, 0xF9, 0xFF, 0x8C, 0x3C, 0xF8, 0xC6, 0x70, 0x17,
];

/// Pressure and temperature ADC words giving 25.08 °C and 100653 Pa.
const BMP280_READOUT: [u8; 6] = [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00];

fn service() -> (DeviceService, Arc<SimulatedProvider>) {
    let mut config = Configuration::default();
    config.driver.retry_backoff_ms = 1;
    let provider = Arc::new(SimulatedProvider::new());
    (DeviceService::from_config(&config, provider.clone()), provider)
}

#[tokio::test]
async fn test_gps_fix_after_sentences_arrive() {
    let (service, provider) = service();
    service
        .load_controller(ControllerSpec::new("uart0", BusKind::Uart))
        .await
        .unwrap();
    service
        .load_driver("gps_uart", "uart0:gps", "uart0", json!({ "polling_interval_ms": 10 }))
        .await
        .unwrap();

    let uart = provider.transport("uart0").unwrap();
    assert_eq!(
        uart.setting(0),
        Some(ChannelSetting::Serial {
            baud_rate: 115_200,
            parity: nvos_devices::Parity::None,
            data_bits: 8,
            stop_bits: 1,
        })
    );

    let gps = service.registry().gps("uart0:gps").await.unwrap();
    assert!(!gps.has_fix().await.unwrap());
    assert_eq!(gps.satellite_count().await.unwrap(), 0);
    assert!(matches!(gps.location().await, Err(DeviceError::Hardware(_))));

    uart.push_rx(0, GGA.as_bytes());
    uart.push_rx(0, RMC.as_bytes());

    let report = gps.full_report().await.unwrap();
    assert!(report.has_fix);
    assert_eq!(report.satellite_count, 8);
    assert!((report.latitude - 48.1173).abs() < 1e-4);
    assert!((report.longitude - 11.516_667).abs() < 1e-4);
    assert!((report.altitude - 545.4).abs() < 1e-3);
    assert!((report.speed_over_ground - 22.4).abs() < 1e-3);
    assert!((report.horizontal_accuracy - 2.7).abs() < 1e-3);

    // Heading comes from the course over ground, not the speed
    assert!((gps.heading().await.unwrap() - 84.4).abs() < 1e-3);

    service.registry().unregister("uart0:gps").await.unwrap();
    assert!(service.registry().arbiter().held_by("uart0:gps").is_empty());
}

#[tokio::test]
async fn test_gps_worker_drains_port_in_background() {
    let (service, provider) = service();
    service
        .load_controller(ControllerSpec::new("uart0", BusKind::Uart))
        .await
        .unwrap();
    service
        .load_driver("gps_uart", "gps", "uart0", json!({ "polling_interval_ms": 5 }))
        .await
        .unwrap();

    let uart = provider.transport("uart0").unwrap();
    uart.push_rx(0, GGA.as_bytes());

    // The worker reads the port without any query
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if uart.rx_pending(0) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never drained the port");

    let gps = service.registry().gps("gps").await.unwrap();
    assert!(gps.has_fix().await.unwrap());
}

#[tokio::test]
async fn test_gps_restart_forgets_previous_fix() {
    let (service, provider) = service();
    service
        .load_controller(ControllerSpec::new("uart0", BusKind::Uart))
        .await
        .unwrap();
    service
        .load_driver("gps_uart", "gps", "uart0", json!(null))
        .await
        .unwrap();

    let uart = provider.transport("uart0").unwrap();
    uart.push_rx(0, GGA.as_bytes());
    let registry = service.registry();
    assert!(registry.gps("gps").await.unwrap().has_fix().await.unwrap());

    registry.stop_device("gps").await.unwrap();
    registry.start_device("gps").await.unwrap();

    let gps = registry.gps("gps").await.unwrap();
    assert!(!gps.has_fix().await.unwrap());
    assert_eq!(gps.satellite_count().await.unwrap(), 0);
    assert!(!gps.full_report().await.unwrap().has_fix);
}

#[tokio::test]
async fn test_led_brightness_and_mode() {
    let (service, provider) = service();
    service
        .load_controller(ControllerSpec::new("pwm0", BusKind::Pwm))
        .await
        .unwrap();
    service
        .load_controller(ControllerSpec::new("gpio0", BusKind::Raw))
        .await
        .unwrap();
    service
        .load_driver("generic_led", "led", "pwm0", json!({ "mode_switch_line": 4 }))
        .await
        .unwrap();

    let pwm = provider.transport("pwm0").unwrap();
    let gpio = provider.transport("gpio0").unwrap();
    let pwm_setting = |duty_ns, enabled| ChannelSetting::Pwm {
        period_ns: 100,
        duty_ns,
        enabled,
    };

    // Defaults: visible light, half brightness, on
    assert_eq!(gpio.level(4), Some(false));
    assert_eq!(pwm.setting(0), Some(pwm_setting(50, true)));

    let led = service.registry().led("led").await.unwrap();
    led.set_mode(LedMode::Infrared).await.unwrap();
    assert_eq!(gpio.level(4), Some(true));

    led.set_brightness(1.0).await.unwrap();
    assert_eq!(pwm.setting(0), Some(pwm_setting(100, true)));

    led.set_power(false).await.unwrap();
    assert_eq!(pwm.setting(0), Some(pwm_setting(0, true)));

    let state = led.state().await.unwrap();
    assert!(!state.powered_on);
    assert_eq!(state.brightness, 1.0);
    assert_eq!(state.mode, LedMode::Infrared);

    // Rejected values leave the state alone
    assert!(matches!(
        led.set_brightness(1.5).await,
        Err(DeviceError::InvalidArgument(_))
    ));
    assert_eq!(led.state().await.unwrap(), state);

    service.registry().unregister("led").await.unwrap();
    assert_eq!(pwm.setting(0), Some(pwm_setting(0, false)));
    assert_eq!(gpio.release_count(4), 1);
    assert_eq!(pwm.release_count(0), 1);
}

#[tokio::test]
async fn test_led_needs_gpio_controller() {
    let (service, _) = service();
    service
        .load_controller(ControllerSpec::new("pwm0", BusKind::PwmSysfs))
        .await
        .unwrap();

    let err = service
        .load_driver("generic_led", "led", "pwm0", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::DriverInitFailed { .. }));
    assert!(err.to_string().contains("gpio0"));
    assert!(service.registry().arbiter().held_by("led").is_empty());
}

async fn light_sensor(service: &DeviceService) {
    service
        .load_controller(ControllerSpec::new("i2c1", BusKind::I2c).with_data(json!({
            "registers": {
                "0x29": { "0xb2": 80, "0xb4": 232, "0xb5": 3, "0xb6": 200, "0xb7": 0 }
            }
        })))
        .await
        .unwrap();
    service
        .load_device(
            DeviceSpec::new("light", "tsl2591", "i2c1").with_config(json!({ "auto_gain": false })),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_light_sensor_options() {
    let (service, provider) = service();
    light_sensor(&service).await;
    let sensor = service.registry().light_sensor("light").await.unwrap();

    assert_eq!(sensor.supported_gains().len(), 4);
    assert_eq!(sensor.supported_intervals().len(), 6);
    assert_eq!(sensor.supported_channels().len(), 3);

    // Unsupported ids are rejected and the gain is unchanged
    let err = sensor.set_gain(7).await.unwrap_err();
    assert_eq!(
        err,
        DeviceError::UnsupportedOption {
            option: "gain",
            id: 7
        }
    );
    assert_eq!(sensor.gain().await.unwrap().id, 0);

    sensor.set_gain(2).await.unwrap();
    assert_eq!(sensor.gain().await.unwrap().multiplier, 428);
    let i2c = provider.transport("i2c1").unwrap();
    assert_eq!(i2c.registers(0x29, 0xA1, 1), vec![0x20]);

    sensor.set_interval(3).await.unwrap();
    assert_eq!(sensor.interval().await.unwrap().time_ms, 400);
    assert_eq!(i2c.registers(0x29, 0xA1, 1), vec![0x23]);

    assert_eq!(sensor.luminosity(0).await.unwrap(), 1000);
    assert_eq!(sensor.luminosity(1).await.unwrap(), 200);
    assert_eq!(sensor.luminosity(2).await.unwrap(), 800);
    assert!(matches!(
        sensor.luminosity(9).await,
        Err(DeviceError::UnsupportedOption { .. })
    ));
}

#[tokio::test]
async fn test_light_sensor_retries_transient_faults() {
    let (service, provider) = service();
    light_sensor(&service).await;
    let sensor = service.registry().light_sensor("light").await.unwrap();

    let i2c = provider.transport("i2c1").unwrap();
    i2c.fail_next(0x29, 2);
    let lux = sensor.illuminance().await.unwrap();
    assert!((lux - 4704.0).abs() < 0.5, "lux was {}", lux);

    // More faults than attempts surface as a hardware error
    i2c.fail_next(0x29, 5);
    assert!(matches!(
        sensor.illuminance().await,
        Err(DeviceError::Hardware(_))
    ));
}

#[tokio::test]
async fn test_bmp280_thermometer_and_barometer() {
    let (service, provider) = service();
    service
        .load_controller(ControllerSpec::new("i2c1", BusKind::I2cSysfs))
        .await
        .unwrap();
    let i2c = provider.transport("i2c1").unwrap();
    i2c.set_registers(0x76, 0xD0, &[0x58]);
    i2c.set_registers(0x76, 0x88, &BMP280_CALIBRATION);
    i2c.set_registers(0x76, 0xF7, &BMP280_READOUT);

    let info = service
        .load_driver("bmp280", "env", "i2c1", json!(null))
        .await
        .unwrap();
    assert_eq!(info.capabilities.len(), 2);

    let registry = service.registry();
    let thermometer = registry.thermometer("env").await.unwrap();
    let barometer = registry.barometer("env").await.unwrap();

    let celsius = thermometer.temperature_celsius().await.unwrap();
    assert!((celsius - 25.08).abs() < 0.01, "temperature was {}", celsius);
    let fahrenheit = thermometer.temperature_fahrenheit().await.unwrap();
    assert!((fahrenheit - (celsius * 9.0 / 5.0 + 32.0)).abs() < 1e-3);

    let pascal = barometer.pressure().await.unwrap();
    assert!((pascal - 100_653.27).abs() < 1.0, "pressure was {}", pascal);
    let altitude = barometer.altitude().await.unwrap();
    assert!(altitude > 50.0 && altitude < 65.0, "altitude was {}", altitude);

    // Oversampling: temperature x1, pressure x4, normal mode
    assert_eq!(i2c.registers(0x76, 0xF4, 1), vec![(1 << 5) | (3 << 2) | 0x03]);

    assert!(matches!(
        thermometer.set_gain(0).await,
        Err(DeviceError::UnsupportedOption { .. })
    ));
    barometer.set_gain(5).await.unwrap();
    assert_eq!(barometer.gain().await.unwrap().multiplier, 16);
    assert_eq!(thermometer.gain().await.unwrap().multiplier, 1);
}
