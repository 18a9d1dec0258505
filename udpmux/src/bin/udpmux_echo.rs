//! UDP echo daemon and client built on the multiplex engine.
//!
//! # Usage
//!
//! ```sh
//! udpmux-echo server 0.0.0.0:5051
//! udpmux-echo client 127.0.0.1:5051 "hello"
//! ```
//!
//! The server answers every datagram with the same bytes, sent back to the
//! source. The client sends one message and prints the reply. Ctrl+C ends the
//! server.

use std::time::Duration;

use udpmux::engine::{EngineConfig, EngineError, SocketMultiplexEngine};
use udpmux::net::Datagram;
use udpmux::pipe::{PipeEnd, PipeError, UdpPipe};
use udpmux::sync::Timeout;

/// How long the client waits for the echo.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the server wakes up when idle.
const SERVER_WAKEUP: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
enum EchoError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

enum Command {
    Server { host: String, port: u16 },
    Client { host: String, port: u16, message: String },
}

fn main() {
    udpmux::init_tracing_with("udpmux=info");

    if let Err(e) = run() {
        eprintln!("udpmux-echo: {e}");
        if matches!(e, EchoError::Usage(_)) {
            print_usage();
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), EchoError> {
    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;

    let engine = SocketMultiplexEngine::new(EngineConfig::default())?;
    engine.start_up(Timeout::Infinite)?;

    match command {
        Command::Server { host, port } => serve(&engine, &host, port)?,
        Command::Client {
            host,
            port,
            message,
        } => ask(&engine, &host, port, &message)?,
    }

    engine.tear_down(Timeout::Infinite)?;
    Ok(())
}

fn serve(engine: &SocketMultiplexEngine, host: &str, port: u16) -> Result<(), EchoError> {
    let pipe = UdpPipe::open(engine, PipeEnd::Read, host, port)?;
    eprintln!("udpmux-echo: listening on {host}:{port}");

    loop {
        let dgram = match pipe.read_datagram(SERVER_WAKEUP.into()) {
            Ok(dgram) => dgram,
            Err(PipeError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(source) = dgram.endpoint() {
            eprintln!("udpmux-echo: {} bytes from {source}", dgram.len());
        }
        pipe.write_datagram(dgram, Timeout::Infinite)?;
    }
}

fn ask(
    engine: &SocketMultiplexEngine,
    host: &str,
    port: u16,
    message: &str,
) -> Result<(), EchoError> {
    let pipe = UdpPipe::open(engine, PipeEnd::Write, host, port)?;
    pipe.write_datagram(Datagram::from_bytes(message.as_bytes()), Timeout::Infinite)?;

    let reply = pipe.read_datagram(REPLY_TIMEOUT.into())?;
    println!("{}", String::from_utf8_lossy(reply.bytes()));
    pipe.close()?;
    Ok(())
}

/// Parses `<mode> <host:port> [message]`.
fn parse_args(args: &[String]) -> Result<Command, EchoError> {
    let mode = args
        .get(1)
        .ok_or_else(|| EchoError::Usage("missing mode".into()))?;
    if mode == "--help" || mode == "-h" {
        print_usage();
        std::process::exit(0);
    }

    let address = args
        .get(2)
        .ok_or_else(|| EchoError::Usage("missing address".into()))?;
    let (host, port) = split_address(address)?;

    match mode.as_str() {
        "server" if args.len() == 3 => Ok(Command::Server { host, port }),
        "client" if args.len() == 4 => Ok(Command::Client {
            host,
            port,
            message: args[3].clone(),
        }),
        "server" | "client" => Err(EchoError::Usage("wrong number of arguments".into())),
        other => Err(EchoError::Usage(format!("unknown mode: {other}"))),
    }
}

/// Splits `host:port`, accepting `[v6]:port`.
fn split_address(address: &str) -> Result<(String, u16), EchoError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| EchoError::Usage(format!("expected host:port, got {address}")))?;
    let port = port
        .parse()
        .map_err(|e| EchoError::Usage(format!("invalid port {port}: {e}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_owned(), port))
}

fn print_usage() {
    eprintln!(
        r#"udpmux-echo - UDP echo over the multiplex engine

USAGE:
    udpmux-echo server <HOST:PORT>
    udpmux-echo client <HOST:PORT> <MESSAGE>

EXAMPLE:
    udpmux-echo server 0.0.0.0:5051
    udpmux-echo client 127.0.0.1:5051 hello
"#
    );
}
