use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use pulsebus::bus::{CorrelationId, Reply};
use pulsebus::config::DEFAULT_ACTOR_NAME;
use pulsebus::dispatch::{ops, PARAM_DEVICE_PORT, PARAM_PINS};
use pulsebus::events::{Event, EventSequence, TimingSpec};
use pulsebus::gateway::{GatewayClient, GatewayRequest, GatewayResponse};
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "12300";
const DEFAULT_WAIT_MS: &str = "2000";

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Session {
    client: GatewayClient,
    actor: String,
    format: String,
    wait_ms: u64,
    verbose: bool,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("pulsebus")
        .version("0.1.0")
        .about("⚡ Pulse Bus director - drive a trigger board actor through its gateway")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Gateway host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("actor")
                .short("a")
                .long("actor")
                .value_name("NAME")
                .help("Target actor name")
                .takes_value(true)
                .default_value(DEFAULT_ACTOR_NAME)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("wait")
                .short("w")
                .long("wait")
                .value_name("MS")
                .help("How long to wait for the reply (0 prints the call id and returns)")
                .takes_value(true)
                .default_value(DEFAULT_WAIT_MS)
                .global(true)
                .validator(validate_number),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .arg(
            Arg::with_name("at")
                .long("at")
                .value_name("TIMESTAMP")
                .help("Schedule relative to an absolute time (Unix timestamp in nanoseconds)")
                .takes_value(true)
                .global(true)
                .validator(validate_number),
        )
        .subcommand(SubCommand::with_name("actors").about("📋 List actors registered on the bus"))
        .subcommand(
            SubCommand::with_name("params")
                .about("🔧 Read actor parameters")
                .arg(
                    Arg::with_name("names")
                        .help("Parameter names")
                        .multiple(true)
                        .possible_values(&[PARAM_DEVICE_PORT, PARAM_PINS]),
                ),
        )
        .subcommand(SubCommand::with_name("stop").about("🛑 Cancel everything scheduled on the board"))
        .subcommand(
            SubCommand::with_name("rising")
                .about("⬆️  Send a rising edge")
                .arg(pin_arg())
                .arg(delay_arg()),
        )
        .subcommand(
            SubCommand::with_name("falling")
                .about("⬇️  Send a falling edge")
                .arg(pin_arg())
                .arg(delay_arg()),
        )
        .subcommand(
            SubCommand::with_name("pulse")
                .about("⚡ Send a pulse")
                .arg(pin_arg())
                .arg(
                    Arg::with_name("width")
                        .help("Pulse width in milliseconds")
                        .required(true)
                        .validator(validate_number),
                )
                .arg(delay_arg()),
        )
        .subcommand(
            SubCommand::with_name("sequence")
                .about("🎹 Send a pulse sequence")
                .long_about("Each pulse is PIN:DELAY:WIDTH in milliseconds. With --at the first pulse is anchored at the timestamp and later delays count from it.")
                .arg(
                    Arg::with_name("pulses")
                        .help("Pulses as PIN:DELAY:WIDTH")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("reprogram")
                .about("💾 Compile and upload firmware to the board")
                .arg(
                    Arg::with_name("firmware")
                        .help("Path to the sketch file")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("result")
                .about("📬 Fetch the reply of an earlier call")
                .arg(
                    Arg::with_name("id")
                        .help("Call id printed by an earlier command")
                        .required(true)
                        .validator(validate_number),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("📈 Monitor live trigger telemetry"))
        .get_matches();

    if matches.subcommand_name().is_none() {
        print_quick_start();
        return Ok(());
    }

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let at = matches.value_of("at").map(str::parse::<u64>).transpose()?;

    let mut session = Session {
        client: connect(host, port).await?,
        actor: matches.value_of("actor").unwrap_or(DEFAULT_ACTOR_NAME).to_string(),
        format: matches.value_of("format").unwrap_or("table").to_string(),
        wait_ms: matches.value_of("wait").unwrap_or(DEFAULT_WAIT_MS).parse()?,
        verbose: matches.is_present("verbose"),
    };

    if session.verbose {
        println!("{}", "⚡ Pulse Bus director".bright_blue().bold());
        println!("{} {}:{} ({})", "Connected to".dimmed(), host, port, session.actor);
    }

    match matches.subcommand() {
        ("actors", _) => handle_actors(&mut session).await?,
        ("params", Some(sub_matches)) => handle_params(&mut session, sub_matches).await?,
        ("stop", _) => {
            call(&mut session, "Stop", ops::STOP, json!({})).await?;
        }
        ("rising", Some(sub_matches)) => {
            let event = Event::rising_edge(timing(sub_matches, at)?);
            call(&mut session, "Rising edge", ops::SEND_RISING_EDGE, json!({ "event": event.command() })).await?;
        }
        ("falling", Some(sub_matches)) => {
            let event = Event::falling_edge(timing(sub_matches, at)?);
            call(&mut session, "Falling edge", ops::SEND_FALLING_EDGE, json!({ "event": event.command() })).await?;
        }
        ("pulse", Some(sub_matches)) => {
            let width = sub_matches.value_of("width").unwrap_or("0").parse()?;
            let event = Event::pulse(timing(sub_matches, at)?, width)?;
            call(&mut session, "Pulse", ops::SEND_PULSE, json!({ "pulse": event.command() })).await?;
        }
        ("sequence", Some(sub_matches)) => {
            let sequence = build_sequence(sub_matches.values_of("pulses").into_iter().flatten(), at)?;
            if session.verbose {
                println!("{} {}", "Command:".dimmed(), sequence.command());
            }
            call(&mut session, "Pulse sequence", ops::SEND_PULSE_SEQUENCE, json!({ "sequence": sequence.command() })).await?;
        }
        ("reprogram", Some(sub_matches)) => {
            let firmware = sub_matches.value_of("firmware").unwrap_or_default();
            // Compiling and uploading takes far longer than a trigger exchange.
            session.wait_ms = session.wait_ms.max(120_000);
            call(&mut session, "Reprogram", ops::REPROGRAM, json!({ "firmware_path": firmware })).await?;
        }
        ("result", Some(sub_matches)) => {
            let id = sub_matches.value_of("id").unwrap_or("0").parse()?;
            let wait_ms = session.wait_ms;
            wait_for_reply(&mut session, "Call", id, wait_ms).await?;
        }
        ("monitor", _) => handle_monitor(&mut session).await?,
        _ => print_quick_start(),
    }

    Ok(())
}

fn print_quick_start() {
    println!("{}", "No command specified. Use --help for usage information.".yellow());
    println!("{}", "Quick start:".bright_green());
    println!("  {} Start an actor", "pulsebus-actor --port /dev/ttyACM0".bright_cyan());
    println!("  {} Send a 100 ms pulse on pin 0", "pulsebus pulse 0 100".bright_cyan());
    println!("  {} Monitor telemetry", "pulsebus monitor".bright_cyan());
}

fn pin_arg() -> Arg<'static, 'static> {
    Arg::with_name("pin")
        .help("Output pin index")
        .required(true)
        .validator(validate_number)
}

fn delay_arg() -> Arg<'static, 'static> {
    Arg::with_name("delay")
        .short("d")
        .long("delay")
        .value_name("MS")
        .help("Delay in milliseconds (added on top of --at)")
        .takes_value(true)
        .validator(validate_number)
}

fn validate_number(value: String) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(_) => Ok(()),
        Err(_) => Err("Value must be a non-negative integer".into()),
    }
}

fn timing(matches: &ArgMatches<'_>, at: Option<u64>) -> CliResult<TimingSpec> {
    let pin = matches.value_of("pin").unwrap_or("0").parse()?;
    let delay = matches.value_of("delay").map(str::parse::<u64>).transpose()?;
    // Neither given means "now".
    let delay = if delay.is_none() && at.is_none() { Some(0) } else { delay };
    Ok(TimingSpec::new(pin, delay, at)?)
}

fn build_sequence<'a>(pulses: impl Iterator<Item = &'a str>, at: Option<u64>) -> CliResult<EventSequence> {
    let mut events = Vec::new();
    for (index, spec) in pulses.enumerate() {
        let fields = spec
            .split(':')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid pulse {:?}: {}", spec, e))?;
        let &[pin, delay, width] = fields.as_slice() else {
            return Err(format!("invalid pulse {:?}: expected PIN:DELAY:WIDTH", spec).into());
        };
        let pin = u32::try_from(pin)?;
        let timing = match (index, at) {
            (0, Some(timestamp)) => TimingSpec::new(pin, Some(delay), Some(timestamp))?,
            _ => TimingSpec::new(pin, Some(delay), None)?,
        };
        events.push(Event::pulse(timing, width)?);
    }
    Ok(EventSequence::new(events)?)
}

async fn connect(host: &str, port: u16) -> CliResult<GatewayClient> {
    let addr = format!("{}:{}", host, port);
    match GatewayClient::connect(&addr).await {
        Ok(client) => Ok(client),
        Err(e) => {
            eprintln!("{} Failed to connect to gateway at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} No actor is running. Start one with:", "💡".yellow());
                eprintln!("   {}", "pulsebus-actor --port /dev/ttyACM0".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

async fn request(session: &mut Session, request: GatewayRequest) -> CliResult<GatewayResponse> {
    match tokio::time::timeout(Duration::from_secs(5), session.client.request(&request)).await {
        Ok(response) => Ok(response?),
        Err(_) => {
            eprintln!("{} Gateway did not answer within 5 seconds", "⏰".yellow());
            Err("Gateway timeout".into())
        }
    }
}

async fn call(session: &mut Session, action: &str, operation: &str, args: Value) -> CliResult<()> {
    let call_request = GatewayRequest::Call {
        actor: session.actor.clone(),
        operation: operation.to_string(),
        args,
    };
    let response = request(session, call_request).await?;

    let id = match response {
        GatewayResponse::Accepted { id } => id,
        other => {
            print_response(action, &other, &session.format);
            return Ok(());
        }
    };

    if session.wait_ms == 0 {
        match session.format.as_str() {
            "json" => println!("{}", json!({ "id": id })),
            "compact" => println!("{}", id),
            _ => println!(
                "{} {} queued as call {} (fetch with {})",
                "📨".bright_blue(),
                action.bright_white(),
                id.to_string().bright_cyan(),
                format!("pulsebus result {}", id).bright_cyan()
            ),
        }
        return Ok(());
    }

    let wait_ms = session.wait_ms;
    wait_for_reply(session, action, id, wait_ms).await
}

async fn wait_for_reply(session: &mut Session, action: &str, id: CorrelationId, wait_ms: u64) -> CliResult<()> {
    let response = request_with_wait(session, GatewayRequest::Response { id, timeout_ms: wait_ms }, wait_ms).await?;
    print_response(action, &response, &session.format);
    Ok(())
}

async fn request_with_wait(session: &mut Session, request: GatewayRequest, wait_ms: u64) -> CliResult<GatewayResponse> {
    let deadline = Duration::from_millis(wait_ms) + Duration::from_secs(5);
    match tokio::time::timeout(deadline, session.client.request(&request)).await {
        Ok(response) => Ok(response?),
        Err(_) => Err("Gateway timeout".into()),
    }
}

async fn handle_actors(session: &mut Session) -> CliResult<()> {
    let response = request(session, GatewayRequest::Actors).await?;
    match (&response, session.format.as_str()) {
        (_, "json") => println!("{}", serde_json::to_string(&response)?),
        (GatewayResponse::Actors { names }, _) if names.is_empty() => {
            println!("{} {}", "⚠️".yellow(), "No actors registered".yellow());
        }
        (GatewayResponse::Actors { names }, _) => {
            for name in names {
                println!("{} {}", "•".bright_blue(), name.bright_white());
            }
        }
        (other, _) => print_response("Actors", other, &session.format),
    }
    Ok(())
}

async fn handle_params(session: &mut Session, matches: &ArgMatches<'_>) -> CliResult<()> {
    let mut names: Vec<String> = matches
        .values_of("names")
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        names = vec![PARAM_DEVICE_PORT.to_string(), PARAM_PINS.to_string()];
    }

    let parameters_request = GatewayRequest::Parameters {
        actor: session.actor.clone(),
        names,
    };
    let response = request(session, parameters_request).await?;

    match (&response, session.format.as_str()) {
        (_, "json") => println!("{}", serde_json::to_string(&response)?),
        (GatewayResponse::Parameters { values }, _) => {
            println!("{} {}", "🔧".bright_blue(), session.actor.bright_blue().bold());
            for (name, value) in values {
                match value {
                    Value::Object(map) => {
                        println!("{}", format!("{}:", name).bright_white());
                        for (key, entry) in map {
                            println!("  {:<12} {}", key, entry.to_string().bright_cyan());
                        }
                    }
                    other => println!("{} {}", format!("{}:", name).bright_white(), other.to_string().bright_cyan()),
                }
            }
        }
        (other, _) => print_response("Parameters", other, &session.format),
    }
    Ok(())
}

async fn handle_monitor(session: &mut Session) -> CliResult<()> {
    println!("{}", "📡 Monitoring trigger telemetry (Press Ctrl+C to stop)...".bright_blue().bold());
    session.client.send(&GatewayRequest::Subscribe).await?;

    while let Some(response) = session.client.next_response().await? {
        let GatewayResponse::Telemetry { record } = response else {
            continue;
        };
        match session.format.as_str() {
            "json" => println!("{}", serde_json::to_string(&record)?),
            "compact" => println!(
                "[{}] {} {}",
                record.actor_name,
                record.metadata.message_type.as_str(),
                record.metadata.trigger_command
            ),
            _ => {
                println!(
                    "{} {} {}",
                    "📡".bright_blue(),
                    record.actor_name.bright_white(),
                    record.metadata.message_type.as_str().bright_cyan()
                );
                println!("   {}", record.metadata.description);
                println!("   {} {}", "command:".dimmed(), record.metadata.trigger_command);
                println!("   {} {}", "response:".dimmed(), record.metadata.response);
            }
        }
    }

    Ok(())
}

fn print_response(action: &str, response: &GatewayResponse, format: &str) {
    if format == "json" {
        match serde_json::to_string(response) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{} {}", "❌".red(), e),
        }
        return;
    }

    match response {
        GatewayResponse::Reply { reply: Some(Reply::Ok(value)), .. } => {
            let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            if format == "compact" {
                println!("{}", text);
            } else {
                println!("{} {} {}", "✅".green(), action.bright_white(), "succeeded".bright_green());
                if !text.is_empty() {
                    println!("   {}", text.bright_cyan());
                }
            }
        }
        GatewayResponse::Reply { reply: Some(Reply::Err(message)), .. } => {
            println!("{} {} failed: {}", "❌".red(), action.bright_white(), message.bright_red());
        }
        GatewayResponse::Reply { id, reply: None } => {
            println!("{} {} still pending", "⏰".yellow(), action.bright_white());
            println!("{} Try again with: {}", "💡".yellow(), format!("pulsebus result {}", id).bright_cyan());
        }
        GatewayResponse::Error { message } => {
            println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
        }
        other => println!("{} {:?}", "❓".blue(), other),
    }
}
