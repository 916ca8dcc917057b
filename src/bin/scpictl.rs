use clap::{App, Arg};
use colored::*;
use scpisim::config::DEFAULT_HOST;
use scpisim::OhmSetup;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_port = OhmSetup::SOURCE_PORT.to_string();
    let matches = App::new("scpictl")
        .version("0.1.0")
        .author("Instrument Simulation Team")
        .about("🔧 Send one SCPI program message to a simulated instrument")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Simulator host")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Instrument port")
                .takes_value(true)
                .default_value(&default_port),
        )
        .arg(
            Arg::with_name("crlf")
                .long("crlf")
                .help("Terminate the message with CR LF instead of LF"),
        )
        .arg(
            Arg::with_name("message")
                .help("Program message, e.g. \":SOUR:CURR 1 A;:CURR?\"")
                .required(true)
                .index(1),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(&default_port).parse()?;
    let message = matches.value_of("message").unwrap_or_default();
    let ending = if matches.is_present("crlf") { "\r\n" } else { "\n" };

    let stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            println!("{} {}", "❌".red(), format!("Cannot reach {host}:{port}: {e}").bright_red());
            return Err(e.into());
        }
    };
    let (reader, mut writer) = stream.into_split();

    writer.write_all(format!("{message}{ending}").as_bytes()).await?;
    println!("{} {}", "📤".blue(), message.bright_blue());

    if !message.contains('?') {
        println!("{} {}", "✅".green(), "Sent".bright_green());
        return Ok(());
    }

    let mut lines = BufReader::new(reader).lines();
    match timeout(RESPONSE_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => println!("{} {}", "📥".green(), line.trim_end().bright_green()),
        Ok(Ok(None)) => println!("{} {}", "⚠️".yellow(), "Connection closed without a response".yellow()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => println!(
            "{} {}",
            "⏱️".yellow(),
            "No response; check the error queue with *ERR?".yellow()
        ),
    }
    Ok(())
}
