use clap::{App, Arg};
use colored::*;
use pulsebus::actor::{Actor, StopOutcome};
use pulsebus::bus::Bus;
use pulsebus::config::{ActorConfig, ConfigError, DEFAULT_GATEWAY_ADDR};
use pulsebus::discovery::{DeviceDiscovery, SerialPortDiscovery};
use pulsebus::gateway;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pulsebus-actor")
        .version("0.1.0")
        .about("⚡ Trigger board actor - owns the serial port and serves the bus gateway")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON actor configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .value_name("NAME")
                .help("Actor name on the bus")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("DEVICE")
                .help("Serial device of the trigger board (discovered when omitted)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("serial-number")
                .short("s")
                .long("serial-number")
                .value_name("SERIAL")
                .help("Only accept a board with this serial number during discovery")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Gateway listen address")
                .takes_value(true)
                .default_value(DEFAULT_GATEWAY_ADDR),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("{}", "⚡ Pulse Bus trigger actor".bright_blue().bold());
    println!("{}", "==========================".bright_blue());

    let mut config = match matches.value_of("config") {
        Some(path) => ActorConfig::from_json_file(path)?,
        None => ActorConfig::default(),
    };
    if let Some(name) = matches.value_of("name") {
        config.name = name.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.device.port = port.to_string();
    }
    if let Some(serial) = matches.value_of("serial-number") {
        config.device.serial_number = serial.to_string();
    }

    if config.device.port.is_empty() {
        let mut discovery = SerialPortDiscovery::default();
        if !config.device.serial_number.is_empty() {
            discovery = discovery.with_allowed_serials(vec![config.device.serial_number.clone()]);
        }
        let found = discovery.discover()?;
        let (port, serial) = found.first().ok_or(ConfigError::NoPort)?;
        info!("🔍 discovered board on {} (serial {})", port, serial);
        config.device.port = port.to_string();
        config.device.serial_number = serial.to_string();
    }

    let bus = Bus::with_reply_ttl(config.bus.reply_ttl());
    let mut actor = Actor::new(config, bus.clone());
    actor.start()?;

    let listener = gateway::bind(matches.value_of("listen").unwrap_or(DEFAULT_GATEWAY_ADDR)).await?;
    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway::serve(listener, bus).await {
            error!("Gateway error: {}", e);
        }
    });

    println!(
        "{} actor {} listening on {} (Press Ctrl+C to stop)",
        "🚀".bright_green(),
        actor.name().bright_cyan(),
        actor.device_port().bright_white()
    );

    tokio::signal::ctrl_c().await?;
    println!();

    match actor.stop().await? {
        StopOutcome::Joined(report) => {
            info!("actor loop joined after {} call(s)", report.calls_handled);
        }
        StopOutcome::Abandoned => {
            warn!("actor loop did not exit in time and was left detached");
        }
        StopOutcome::Failed(reason) => {
            error!("actor loop failed: {}", reason);
        }
    }

    gateway_task.abort();
    println!("{}", "🔌 Trigger actor stopped".bright_green());

    Ok(())
}
