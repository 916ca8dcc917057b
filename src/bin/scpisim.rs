use clap::{App, Arg, ArgMatches};
use scpisim::{ExperimentSetup, MagnetSetup, OhmSetup, Server, ServerConfig};
use tracing::{error, info, Level};

const DEFAULT_RESISTANCE: &str = "1000";
const DEFAULT_COIL_CONSTANT: &str = "0.1";
const DEFAULT_INDUCTANCE: &str = "10";

fn parse_number(value: String) -> Result<(), String> {
    value
        .parse::<f64>()
        .map(|_| ())
        .map_err(|_| format!("{value} is not a number"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("scpisim")
        .version("0.1.0")
        .author("Instrument Simulation Team")
        .about("🔬 Virtual SCPI instruments served as TCPIP::<host>::<port>::SOCKET resources")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Address to bind the instrument ports to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON server configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("experiment")
                .short("e")
                .long("experiment")
                .value_name("EXPERIMENT")
                .help("Instrument set served to every client")
                .takes_value(true)
                .possible_values(&["ohm", "magnet"])
                .default_value("ohm"),
        )
        .arg(
            Arg::with_name("resistance")
                .long("resistance")
                .value_name("OHMS")
                .help("Resistor between current source and voltmeter (ohm experiment)")
                .takes_value(true)
                .default_value(DEFAULT_RESISTANCE)
                .validator(parse_number),
        )
        .arg(
            Arg::with_name("coil-constant")
                .long("coil-constant")
                .value_name("T/A")
                .help("Magnet coil constant (magnet experiment)")
                .takes_value(true)
                .default_value(DEFAULT_COIL_CONSTANT)
                .validator(parse_number),
        )
        .arg(
            Arg::with_name("inductance")
                .long("inductance")
                .value_name("HENRY")
                .help("Magnet inductance (magnet experiment)")
                .takes_value(true)
                .default_value(DEFAULT_INDUCTANCE)
                .validator(parse_number),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every dispatch failure and state transition"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.host = host.to_string();
    }

    match matches.value_of("experiment") {
        Some("magnet") => {
            let setup = MagnetSetup::new(
                number(&matches, "coil-constant")?,
                number(&matches, "inductance")?,
            );
            serve(config, setup).await
        }
        _ => {
            let setup = OhmSetup::new(number(&matches, "resistance")?);
            serve(config, setup).await
        }
    }
}

fn number(matches: &ArgMatches, name: &str) -> Result<f64, Box<dyn std::error::Error>> {
    let value = matches.value_of(name).ok_or_else(|| format!("missing --{name}"))?;
    Ok(value.parse()?)
}

async fn serve<S: ExperimentSetup>(config: ServerConfig, setup: S) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 Starting {} experiment on {}", setup.name(), config.host);
    let server = Server::bind(config, setup).await?;

    let end = server.end_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("🛑 Shutdown requested"),
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
        end.trigger();
    });

    server.run().await?;
    Ok(())
}
