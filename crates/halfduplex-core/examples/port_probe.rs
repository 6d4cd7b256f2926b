//! Serial Port Probe Tool
//!
//! A standalone tool to find a device, send one command and print the answer.
//! With `--virtual` it talks to an in-memory echo device instead of hardware.
//!
//! Usage:
//!   cargo run --example port_probe -- [OPTIONS]
//!
//! Options:
//!   --list            Print every detected port as JSON and exit
//!   --port PORT       Serial port (default: first Silicon Labs device)
//!   --baud RATE       Baud rate (default: 9600)
//!   --send CMD        Command to send, `\r`, `\n` and `\xNN` escapes allowed
//!                     (default: EN\rV100\r)
//!   --lines N         Number of answer lines to wait for (default: 1)
//!   --timeout MS      Answer timeout in ms (default: 20)
//!   --listen MS       Keep printing unsolicited lines for MS after the answer
//!   --virtual         Use an in-memory echo device

use anyhow::{bail, Context, Result};
use halfduplex_core::prelude::*;
use halfduplex_core::protocol::escape_for_log;
use std::sync::Arc;
use std::time::Duration;

struct Options {
    list: bool,
    port: Option<String>,
    baud_rate: u32,
    command: Vec<u8>,
    lines: usize,
    timeout: Duration,
    listen: Duration,
    virtual_device: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            list: false,
            port: None,
            baud_rate: 9600,
            command: b"EN\rV100\r".to_vec(),
            lines: 1,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            listen: Duration::ZERO,
            virtual_device: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(options) = parse_args(std::env::args().skip(1))? else {
        print_help();
        return Ok(());
    };

    if options.list {
        for port in list_ports() {
            println!("{}", serde_json::to_string(&port)?);
        }
        return Ok(());
    }

    let engine = if options.virtual_device {
        let (port, device) = VirtualPort::pair();
        tokio::spawn(device.serve(Duration::from_millis(5), |command| {
            let mut reply = command.to_vec();
            reply.extend_from_slice(b"\r\n");
            Some(reply)
        }));
        println!("Using virtual echo device");
        connect(port)?
    } else {
        let port = match &options.port {
            Some(name) => name.clone(),
            None => find_suitable_port()?.name,
        };
        let transport = open_port(&port, &SerialSettings::with_baud_rate(options.baud_rate))
            .with_context(|| format!("opening {}", port))?;
        println!("Opened {} @ {} baud", port, options.baud_rate);
        connect(transport)?
    };

    engine.on_message(|line| println!("UART data received: {}", line));

    println!("→ {}", escape_for_log(&options.command));
    match engine
        .send_and_receive_many(&options.command, options.timeout, options.lines)
        .await
    {
        Ok(lines) => {
            for line in &lines {
                println!("← {}", line);
            }
            if lines.len() < options.lines {
                println!("(partial answer: {} of {} lines)", lines.len(), options.lines);
            }
        }
        Err(e) if e.is_timeout() => eprintln!("✗ {}", e),
        Err(e) => return Err(e.into()),
    }

    if !options.listen.is_zero() {
        tokio::time::sleep(options.listen).await;
    }

    engine.close().await?;
    Ok(())
}

fn connect<T: Transport>(transport: T) -> Result<HalfDuplex> {
    let config = EngineConfig::default().with_logger(Arc::new(TracingLogger));
    Ok(HalfDuplex::new(transport, config)?)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Options>> {
    let mut options = Options::default();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("{} needs a value", flag))
        };
        match arg.as_str() {
            "--list" | "-l" => options.list = true,
            "--port" | "-p" => options.port = Some(value("--port")?),
            "--baud" | "-b" => options.baud_rate = value("--baud")?.parse()?,
            "--send" | "-s" => options.command = unescape(&value("--send")?)?,
            "--lines" | "-n" => options.lines = value("--lines")?.parse()?,
            "--timeout" | "-t" => {
                options.timeout = Duration::from_millis(value("--timeout")?.parse()?)
            }
            "--listen" => options.listen = Duration::from_millis(value("--listen")?.parse()?),
            "--virtual" => options.virtual_device = true,
            "--help" | "-h" => return Ok(None),
            other => bail!("Unknown option: {}", other),
        }
    }
    Ok(Some(options))
}

/// Expand `\r`, `\n`, `\t`, `\\` and `\xNN` into raw bytes
fn unescape(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hex: Vec<u8> = bytes.by_ref().take(2).collect();
                let hex = std::str::from_utf8(&hex)?;
                out.push(
                    u8::from_str_radix(hex, 16)
                        .with_context(|| format!("bad hex escape \\x{}", hex))?,
                );
            }
            Some(other) => bail!("Unknown escape \\{}", other as char),
            None => bail!("Trailing backslash"),
        }
    }
    Ok(out)
}

fn print_help() {
    println!("Serial Port Probe Tool");
    println!();
    println!("Usage: port_probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --list, -l          Print every detected port as JSON and exit");
    println!("  --port, -p PORT     Serial port (default: first Silicon Labs device)");
    println!("  --baud, -b RATE     Baud rate (default: 9600)");
    println!("  --send, -s CMD      Command to send (default: EN\\rV100\\r)");
    println!("  --lines, -n N       Answer lines to wait for (default: 1)");
    println!("  --timeout, -t MS    Answer timeout in ms (default: 20)");
    println!("  --listen MS         Print unsolicited lines for MS after the answer");
    println!("  --virtual           Use an in-memory echo device");
    println!("  --help, -h          Show this help");
}
