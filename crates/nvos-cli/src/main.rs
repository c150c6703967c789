//! Command-line entry point for the NVOS root controller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use nvos_core::{Configuration, LoggingSettings};
use nvos_devices::{ControllerSpec, DeviceService, DeviceSpec, DriverCatalog, SimulatedProvider};
use nvos_rpc::RpcDispatcher;

/// NVOS root controller - device registry and capability services.
#[derive(Parser, Debug)]
#[command(name = "nvos")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (JSON, or TOML by extension).
    #[arg(short, long, global = true, default_value = nvos_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration, bring up every device and serve calls until Ctrl-C.
    ///
    /// Calls are read from stdin, one per line: `<Service> <Method> [json]`.
    Run,
    /// Bring up the configured devices, make one call and shut down.
    Call {
        /// Service name, e.g. `Thermometer`.
        service: String,
        /// Method name, e.g. `GetTemperatureCelsius`.
        method: String,
        /// JSON request body.
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// Validate the configuration file and print a summary.
    CheckConfig,
    /// List the built-in drivers.
    ListDrivers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run => {
            let config = Configuration::load_or_create(&args.config)
                .with_context(|| format!("loading {}", args.config.display()))?;
            init_logging(&config.logging, args.json_logs, args.verbose);
            run_controller(&args.config, config).await
        }
        Command::Call {
            service,
            method,
            payload,
        } => {
            let config = Configuration::load(&args.config)
                .with_context(|| format!("loading {}", args.config.display()))?;
            init_logging(&config.logging, args.json_logs, args.verbose);
            let payload: Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            call_once(&config, &service, &method, payload).await
        }
        Command::CheckConfig => check_config(&args.config),
        Command::ListDrivers => {
            list_drivers();
            Ok(())
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(settings: &LoggingSettings, json_flag: bool, verbose: bool) {
    let json_logging = json_flag
        || settings.json
        || std::env::var("NVOS_LOG_JSON")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

    let level = if verbose { "debug" } else { settings.level.as_str() };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

/// Build the device service on the simulated transport and load `config` into it.
async fn start(config: &Configuration) -> (DeviceService, RpcDispatcher) {
    let provider = std::sync::Arc::new(SimulatedProvider::new());
    let service = DeviceService::from_config(config, provider);
    let report = service.bootstrap(config).await;
    for failure in &report.failures {
        eprintln!("skipped {}: {}", failure.item, failure.error);
    }

    let rpc = RpcDispatcher::with_device_services(service.registry().clone());
    (service, rpc)
}

async fn stop(service: &DeviceService) {
    for (address, error) in service.shutdown().await {
        eprintln!("device {} did not stop cleanly: {}", address, error);
    }
}

async fn run_controller(path: &Path, config: Configuration) -> Result<()> {
    let (service, rpc) = start(&config).await;

    // Writes defaults filled in by serde back to disk; the old file becomes `.bak`.
    config
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;

    for (name, methods) in rpc.services() {
        tracing::debug!(service = name, methods = methods.len(), "service available");
    }
    tracing::info!(
        devices = service.registry().device_count().await,
        "root controller running, Ctrl-C to stop"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = handle_line(&rpc, &line).await {
                        println!("{}", reply);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    tracing::info!("shutting down");
    stop(&service).await;
    Ok(())
}

async fn call_once(
    config: &Configuration,
    service_name: &str,
    method: &str,
    payload: Value,
) -> Result<()> {
    let (service, rpc) = start(config).await;
    let result = rpc.call(service_name, method, payload).await;
    stop(&service).await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Split `<Service> <Method> [json]`.
fn parse_request_line(line: &str) -> Result<Option<(&str, &str, Value)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let service = parts.next().unwrap_or_default();
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .context("expected `<Service> <Method> [json]`")?;
    let payload = match parts.next().map(str::trim) {
        Some(body) if !body.is_empty() => {
            serde_json::from_str(body).context("payload is not valid JSON")?
        }
        _ => Value::Null,
    };
    Ok(Some((service, method, payload)))
}

/// Dispatch one stdin line and render the reply or the failure as JSON.
async fn handle_line(rpc: &RpcDispatcher, line: &str) -> Option<String> {
    let (service, method, payload) = match parse_request_line(line) {
        Ok(Some(request)) => request,
        Ok(None) => return None,
        Err(e) => return Some(serde_json::json!({ "error": format!("{:#}", e) }).to_string()),
    };

    let reply = match rpc.call(service, method, payload).await {
        Ok(value) => serde_json::json!({ "ok": value }),
        Err(status) => serde_json::json!({ "error": status }),
    };
    Some(reply.to_string())
}

/// Problems `bootstrap` would report, found without touching any transport.
fn config_problems(config: &Configuration) -> Vec<String> {
    let catalog = DriverCatalog::builtin();
    let mut problems = Vec::new();

    for controller in &config.controllers {
        if let Err(e) = ControllerSpec::try_from(controller) {
            problems.push(format!("controller {}: {}", controller.name, e));
        }
    }
    for device in &config.devices {
        if let Err(e) = DeviceSpec::try_from(device) {
            problems.push(format!("device {}: {}", device.address, e));
            continue;
        }
        if let Err(e) = catalog.get(&device.driver) {
            problems.push(format!("device {}: {}", device.address, e));
        }
        if !config.controllers.iter().any(|c| c.name == device.controller) {
            problems.push(format!(
                "device {}: unknown controller '{}'",
                device.address, device.controller
            ));
        }
    }
    problems
}

fn check_config(path: &Path) -> Result<()> {
    let config =
        Configuration::load(path).with_context(|| format!("loading {}", path.display()))?;

    println!("Configuration: {}", path.display());
    println!("  acquire timeout: {:?}", config.arbiter.acquire_timeout());
    println!(
        "  driver retries:  {} (backoff {} ms), io timeout {:?}",
        config.driver.retry_attempts,
        config.driver.retry_backoff_ms,
        config.driver.io_timeout()
    );
    println!("  controllers:     {}", config.controllers.len());
    for controller in &config.controllers {
        println!("    {:<12} {}", controller.name, controller.kind);
    }
    println!("  devices:         {}", config.devices.len());
    for device in &config.devices {
        println!(
            "    {:<12} {} on {}",
            device.address, device.driver, device.controller
        );
    }

    let problems = config_problems(&config);
    if problems.is_empty() {
        println!("OK");
        return Ok(());
    }
    for problem in &problems {
        println!("  ! {}", problem);
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}

fn list_drivers() {
    let catalog = DriverCatalog::builtin();
    println!("Built-in drivers:\n");
    for factory in catalog.iter() {
        let capabilities: Vec<String> = factory
            .capabilities()
            .iter()
            .map(ToString::to_string)
            .collect();
        let buses: Vec<String> = factory
            .supported_buses()
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  {}", factory.name());
        println!("    {}", factory.description());
        println!("    capabilities: {}", capabilities.join(", "));
        println!("    buses:        {}", buses.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvos_core::{ControllerConfig, DeviceConfig};

    #[test]
    fn test_parse_request_line() {
        let line = r#"Thermometer GetTemperatureCelsius {"Address":"t0"}"#;
        let (service, method, payload) = parse_request_line(line).unwrap().unwrap();
        assert_eq!(service, "Thermometer");
        assert_eq!(method, "GetTemperatureCelsius");
        assert_eq!(payload["Address"], "t0");

        let (_, _, payload) = parse_request_line("Heartbeat Ping").unwrap().unwrap();
        assert!(payload.is_null());

        assert!(parse_request_line("   ").unwrap().is_none());
        assert!(parse_request_line("# comment").unwrap().is_none());
        assert!(parse_request_line("Heartbeat").is_err());
        assert!(parse_request_line("GPS HasFix {not json").is_err());
    }

    #[tokio::test]
    async fn test_handle_line_renders_status() {
        let rpc = RpcDispatcher::with_device_services(std::sync::Arc::new(
            nvos_devices::DeviceRegistry::new(),
        ));

        let reply = handle_line(&rpc, "Heartbeat Ping").await.unwrap();
        assert_eq!(reply, r#"{"ok":{}}"#);

        let reply = handle_line(&rpc, "GPS HasFix {\"Address\":\"nope\"}").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn test_config_problems() {
        let mut config = Configuration::default();
        config.controllers.push(ControllerConfig::new("i2c1", "i2c"));
        config.controllers.push(ControllerConfig::new("can0", "can"));
        config
            .devices
            .push(DeviceConfig::new("light", "tsl2591", "i2c1"));
        config
            .devices
            .push(DeviceConfig::new("radio", "lora", "i2c1"));
        config
            .devices
            .push(DeviceConfig::new("gps", "gps_uart", "uart0"));

        let problems = config_problems(&config);
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems[0].starts_with("controller can0"));
        assert!(problems[1].starts_with("device radio"));
        assert!(problems[2].contains("uart0"));
    }

    #[test]
    fn test_check_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvos.json");
        let mut config = Configuration::default();
        config.controllers.push(ControllerConfig::new("i2c1", "i2c"));
        config
            .devices
            .push(DeviceConfig::new("light", "tsl2591", "i2c1"));
        config.save(&path).unwrap();

        check_config(&path).unwrap();
        assert!(check_config(&dir.path().join("missing.json")).is_err());
    }
}
