//! Net-Light host tool entry point.
//!
//! Starts the WebSocket control listener, then runs an interactive menu on
//! stdin for discovery, uploads, and stream control.
//!
//! # Environment variable overrides
//!
//! | Variable                  | Default              | Description            |
//! |---------------------------|----------------------|------------------------|
//! | `NETLIGHT_HOST_CONFIG`    | `netlight-host.toml` | Config file path       |
//! | `NETLIGHT_WS_PORT`        | `8000`               | Control listener port  |
//! | `NETLIGHT_DISCOVERY_PORT` | `9000`               | Device discovery port  |

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netlight_core::{CommandSchema, StreamMode};
use netlight_host::config::{load_host_config, HostConfig};
use netlight_host::discovery::{control_url, discover, local_ip, Announcement};
use netlight_host::endpoint::Endpoint;
use netlight_host::server::{endpoints, ControlServer, Registry};
use netlight_host::stream;
use netlight_host::upload::{TransferError, TransferPeer, UploadPlan, UploadReport, Uploader};

#[derive(Debug, Parser)]
#[command(name = "netlight-host", version, about = "Net-Light host tool")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "NETLIGHT_HOST_CONFIG", default_value = "netlight-host.toml")]
    config: PathBuf,

    #[arg(long, env = "NETLIGHT_WS_PORT")]
    ws_port: Option<u16>,

    #[arg(long, env = "NETLIGHT_DISCOVERY_PORT")]
    discovery_port: Option<u16>,
}

struct Shell {
    config: HostConfig,
    schema: Arc<CommandSchema>,
    registry: Registry,
    uploader: Uploader,
    server_ip: IpAddr,
    announced: Vec<Announcement>,
    frame_id: u32,
    lines: Lines<BufReader<Stdin>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_host_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.ws_port {
        config.network.ws_port = port;
    }
    if let Some(port) = cli.discovery_port {
        config.network.discovery_port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let schema = Arc::new(
        CommandSchema::load(config.schema_dir.as_deref()).context("loading command schema")?,
    );
    info!("{} commands in schema", schema.len());

    let bind = SocketAddr::new(config.network.bind, config.network.ws_port);
    let server = ControlServer::bind(bind, Arc::clone(&schema), config.transfer.ack_queue).await?;
    let registry = server.registry();
    let running = Arc::new(AtomicBool::new(true));
    let server_task = tokio::spawn(server.run(Arc::clone(&running)));

    let server_ip = config.network.advertise_ip.unwrap_or_else(local_ip);
    info!("advertising {server_ip}");

    let mut shell = Shell {
        uploader: Uploader::new(Arc::clone(&schema), &config.transfer),
        config,
        schema,
        registry,
        server_ip,
        announced: Vec::new(),
        frame_id: 0,
        lines: BufReader::new(tokio::io::stdin()).lines(),
    };

    loop {
        print_menu();
        let Some(choice) = shell.prompt("> ").await? else {
            break;
        };
        let result = match choice.as_str() {
            "1" => shell.discover().await,
            "2" => shell.upload_one().await,
            "3" => shell.upload_all().await,
            "4" => shell.start_stream().await,
            "5" => shell.send_test_frame().await,
            "6" => shell.stop_stream().await,
            "7" => {
                shell.list().await;
                Ok(())
            }
            "q" | "quit" | "0" => break,
            "" => Ok(()),
            other => {
                println!("unknown choice '{other}'");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("error: {e:#}");
        }
    }

    running.store(false, Ordering::Relaxed);
    server_task.await.context("control listener task")?;
    info!("bye");
    Ok(())
}

fn print_menu() {
    println!();
    println!("1) discover devices");
    println!("2) upload file to one device");
    println!("3) upload file to all devices");
    println!("4) start stream");
    println!("5) send one UDP test frame");
    println!("6) stop stream");
    println!("7) list devices");
    println!("q) quit");
}

impl Shell {
    /// Reads one trimmed line; `None` at end of input.
    async fn prompt(&mut self, label: &str) -> anyhow::Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(label.as_bytes()).await?;
        stdout.flush().await?;
        Ok(self.lines.next_line().await?.map(|l| l.trim().to_string()))
    }

    async fn ask(&mut self, label: &str) -> anyhow::Result<String> {
        self.prompt(label).await?.context("input closed")
    }

    async fn discover(&mut self) -> anyhow::Result<()> {
        let network = &self.config.network;
        let target = SocketAddr::new(network.broadcast, network.discovery_port);
        let ws_base = format!("ws://{}:{}/ws", self.server_ip, network.ws_port);
        let found = discover(
            &self.schema,
            target,
            self.server_ip,
            &ws_base,
            network.discovery_window(),
        )
        .await?;
        println!("{} device(s) answered", found.len());
        for a in &found {
            println!(
                "  {} fw {} at {} (stream port {}) -> {}",
                a.device_id,
                a.firmware,
                a.addr,
                a.stream_port,
                control_url(self.server_ip, network.ws_port, &a.device_id)
            );
        }
        self.announced = found;
        Ok(())
    }

    async fn list(&self) {
        let connected = endpoints(&self.registry).await;
        if connected.is_empty() {
            println!("no devices connected");
        }
        for (i, endpoint) in connected.iter().enumerate() {
            println!(
                "  [{i}] {} at {} (last acked offset {})",
                endpoint.label(),
                endpoint.peer(),
                endpoint.last_acked_offset()
            );
        }
    }

    async fn pick(&mut self) -> anyhow::Result<Arc<Endpoint>> {
        let mut connected = endpoints(&self.registry).await;
        if connected.is_empty() {
            bail!("no devices connected");
        }
        if connected.len() == 1 {
            return Ok(connected.remove(0));
        }
        self.list().await;
        let index: usize = self.ask("device #: ").await?.parse().context("not a number")?;
        if index >= connected.len() {
            bail!("no device #{index}");
        }
        Ok(connected.swap_remove(index))
    }

    async fn plan(&mut self) -> anyhow::Result<UploadPlan> {
        let local = PathBuf::from(self.ask("local file: ").await?);
        let default_remote = local
            .file_name()
            .map(|n| format!("/{}", n.to_string_lossy()))
            .unwrap_or_else(|| "/upload.bin".to_string());
        let remote = self.ask(&format!("remote path [{default_remote}]: ")).await?;
        let remote = if remote.is_empty() { default_remote } else { remote };
        let file_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs() & 0xFFFF) as u16)
            .unwrap_or(1);
        UploadPlan::from_file(&local, file_id, remote, &self.config.transfer)
            .with_context(|| format!("reading {}", local.display()))
    }

    async fn upload_one(&mut self) -> anyhow::Result<()> {
        let target = self.pick().await?;
        let plan = self.plan().await?;
        let report = self.uploader.upload(&[target as Arc<dyn TransferPeer>], &plan).await;
        print_report(&report);
        Ok(())
    }

    async fn upload_all(&mut self) -> anyhow::Result<()> {
        let targets: Vec<Arc<dyn TransferPeer>> = endpoints(&self.registry)
            .await
            .into_iter()
            .map(|e| e as Arc<dyn TransferPeer>)
            .collect();
        if targets.is_empty() {
            bail!("no devices connected");
        }
        let plan = self.plan().await?;
        let report = self.uploader.upload(&targets, &plan).await;
        print_report(&report);
        Ok(())
    }

    async fn start_stream(&mut self) -> anyhow::Result<()> {
        let target = self.pick().await?;
        let fps: u16 = match self.ask("fps [40]: ").await?.as_str() {
            "" => 40,
            text => text.parse().context("not a number")?,
        };
        let mode = match self.ask("mode (0 local / 1 direct) [0]: ").await?.as_str() {
            "" | "0" => StreamMode::Local,
            "1" => StreamMode::Direct,
            other => bail!("unknown mode '{other}'"),
        };
        stream::start(&target, &self.schema, fps, mode).await?;
        println!("stream started on {} ({fps} fps, {mode:?})", target.label());
        Ok(())
    }

    async fn stop_stream(&mut self) -> anyhow::Result<()> {
        let target = self.pick().await?;
        stream::stop(&target, &self.schema).await?;
        println!("stream stopped on {}", target.label());
        Ok(())
    }

    async fn send_test_frame(&mut self) -> anyhow::Result<()> {
        let announced = self.announced.clone();
        let target = match announced.as_slice() {
            [] => {
                let text = self.ask("device address (ip): ").await?;
                let ip: IpAddr = text.parse().context("not an IP address")?;
                SocketAddr::new(ip, self.config.network.stream_port)
            }
            [only] => SocketAddr::new(only.addr.ip(), only.stream_port),
            many => {
                for (i, a) in many.iter().enumerate() {
                    println!("  [{i}] {} at {}", a.device_id, a.addr.ip());
                }
                let index: usize = self.ask("device #: ").await?.parse().context("not a number")?;
                let a = many.get(index).context("no such device")?;
                SocketAddr::new(a.addr.ip(), a.stream_port)
            }
        };
        let pixels: usize = match self.ask("pixels [60]: ").await?.as_str() {
            "" => 60,
            text => text.parse().context("not a number")?,
        };
        self.frame_id = self.frame_id.wrapping_add(1);
        stream::send_stream_frame(&self.schema, target, self.frame_id, &stream::test_pattern(pixels))
            .await?;
        println!("frame {} sent to {target}", self.frame_id);
        Ok(())
    }
}

fn print_report(report: &UploadReport) {
    let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} bytes in {:.2?} ({:.1} KiB/s)",
        report.bytes,
        report.elapsed,
        report.bytes as f64 / 1024.0 / secs
    );
    for target in &report.targets {
        match &target.result {
            Ok(digest) => println!("  {}: OK sha256 {digest}", target.label),
            Err(TransferError::DigestMismatch { expected, actual }) => {
                warn!("[{}] digest mismatch", target.label);
                println!("  {}: DIGEST MISMATCH", target.label);
                println!("     expected {expected}");
                println!("     actual   {actual}");
            }
            Err(e) => println!("  {}: FAILED {e}", target.label),
        }
    }
}
