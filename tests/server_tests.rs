use scpisim::config::ServerConfig;
use scpisim::experiment::{EndSignal, MagnetSetup, OhmSetup};
use scpisim::instruments::{current_source, magnet};
use scpisim::Server;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("No response in time")
            .unwrap()
            .expect("Connection closed")
    }

    async fn query(&mut self, line: &str) -> String {
        self.write(format!("{line}\n").as_bytes()).await;
        self.read_line().await
    }
}

async fn start_ohm() -> (Server<OhmSetup>, SocketAddr, SocketAddr) {
    start_ohm_with(ServerConfig::default()).await
}

async fn start_ohm_with(config: ServerConfig) -> (Server<OhmSetup>, SocketAddr, SocketAddr) {
    let server = Server::bind_ephemeral(config, OhmSetup::new(1e3))
        .await
        .unwrap();
    let source = server.local_addr(OhmSetup::SOURCE_PORT).unwrap();
    let meter = server.local_addr(OhmSetup::VOLTMETER_PORT).unwrap();
    (server, source, meter)
}

fn run(server: Server<OhmSetup>) -> (EndSignal, JoinHandle<()>) {
    let end = server.end_signal();
    let task = tokio::spawn(async move { server.run().await.unwrap() });
    (end, task)
}

async fn stop(end: EndSignal, task: JoinHandle<()>) {
    end.trigger();
    timeout(TIMEOUT, task)
        .await
        .expect("Server did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identity_round_trip() {
    let (server, source, _) = start_ohm().await;
    assert!(server.local_addr(1234).is_none());
    let (end, task) = run(server);

    let mut connection = Connection::open(source).await;
    assert_eq!(connection.query("*IDN?").await, current_source::IDENTITY);
    assert_eq!(connection.query("*OPC?").await, "1");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_line_split_across_writes() {
    let (server, source, _) = start_ohm().await;
    let (end, task) = run(server);

    let mut connection = Connection::open(source).await;
    connection.write(b":CURR 1.5;:CU").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.write(b"RR?\n*OPC?\n").await;
    assert_eq!(connection.read_line().await, "1.50");
    assert_eq!(connection.read_line().await, "1");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connections_share_a_session() {
    let (server, source_addr, meter_addr) = start_ohm().await;
    let (end, task) = run(server);

    let mut source = Connection::open(source_addr).await;
    let mut meter = Connection::open(meter_addr).await;
    source.write(b":OUTP ON;:CURR 2 A\n").await;
    assert_eq!(source.query("*OPC?").await, "1");
    assert_eq!(meter.query(":VOLT?").await, "2000.00");
    assert_eq!(source.query(":CURR?").await, "2.00");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_errors_do_not_close_the_connection() {
    let (server, source, _) = start_ohm().await;
    let (end, task) = run(server);

    let mut connection = Connection::open(source).await;
    connection.write(b":BOGUS\n:CURR 99\n").await;
    assert_eq!(
        connection.query("*ERR?").await,
        "-113,\"Undefined header; :BOGUS\""
    );
    assert_eq!(
        connection.query(":SYST:ERR?").await,
        "-222,\"Data out of range; 99 not within [-10, 10]\""
    );
    assert_eq!(connection.query("*ERR?").await, "0,\"No error\"");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlong_line_is_discarded_up_to_its_ending() {
    let config = ServerConfig {
        max_line_length: 32,
        ..ServerConfig::default()
    };
    let (server, source, _) = start_ohm_with(config).await;
    let (end, task) = run(server);

    let mut connection = Connection::open(source).await;
    connection.write(&[b'X'; 40]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.write(b";:SOUR:CURR 7\n").await;

    assert_eq!(connection.query(":CURR?").await, "0.00");
    let entry = connection.query("*ERR?").await;
    assert!(entry.starts_with("-223,"), "{entry}");
    assert_eq!(connection.query("*ERR?").await, "0,\"No error\"");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_magnet_server() {
    let server = Server::bind_ephemeral(ServerConfig::default(), MagnetSetup::new(1.5, 7.0))
        .await
        .unwrap();
    let addr = server.local_addr(MagnetSetup::PORT).unwrap();
    let end = server.end_signal();
    let task = tokio::spawn(async move { server.run().await.unwrap() });

    let mut connection = Connection::open(addr).await;
    assert_eq!(connection.query("*IDN?").await, magnet::IDENTITY);
    assert_eq!(connection.query(":STATE?").await, "9");

    stop(end, task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_signal_stops_idle_server() {
    let (server, _, _) = start_ohm().await;
    let (end, task) = run(server);
    stop(end, task).await;
}
