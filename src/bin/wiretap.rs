//! Wiretap launcher
//!
//! Listens for clients, relays them to a fixed server or through a SOCKS
//! handshake, and writes every dissected message to the log.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiretap::{
    config::{generate_example_config, Config},
    output::LogSink,
    protocol::Registry,
    sniffer::{Shutdown, Target},
    transport::listen_at,
    Sniffer,
};

/// Wiretap - transparent TCP interception proxy with protocol dissection
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(about = "Wiretap - transparent TCP interception proxy with protocol dissection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dissector plugin (see --list-protocols)
    #[arg(short, long)]
    protocol: Option<String>,

    /// Plugin options, key=value,key=value
    #[arg(short = 'O', long)]
    options: Option<String>,

    /// Dissection log file (standard output by default)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Append to the log file instead of truncating it
    #[arg(short, long)]
    append: bool,

    /// Local port to listen at
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Reuse the local address
    #[arg(short, long)]
    reuse_address: bool,

    /// Run as a SOCKS4/SOCKS5 server
    #[arg(short, long)]
    socks_server: bool,

    /// Forward every client to this server
    #[arg(short, long, value_name = "HOST:PORT")]
    tcp_server: Option<String>,

    /// Do not dump the raw bytes of each message
    #[arg(long)]
    no_raw_dump: bool,

    /// Detach from the terminal
    #[arg(short, long)]
    daemon: bool,

    /// Write an example configuration file and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,

    /// List available protocols and exit
    #[arg(short, long)]
    list_protocols: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(&self, config: &mut Config) {
        if let Some(protocol) = &self.protocol {
            config.protocol = protocol.clone();
        }
        if let Some(options) = &self.options {
            config.options = options.clone();
        }
        if let Some(output) = &self.output {
            config.output.file = Some(output.clone());
        }
        if let Some(port) = self.port {
            config.listen.port = Some(port);
        }
        if let Some(target) = &self.tcp_server {
            config.target = Some(target.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.output.append |= self.append;
        config.output.raw_dump &= !self.no_raw_dump;
        config.listen.reuse_address |= self.reuse_address;
        config.socks |= self.socks_server;
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wiretap: {:#}", e);
            match e.downcast_ref::<wiretap::Error>() {
                Some(wiretap::Error::PluginNotFound(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    let registry = Registry::builtin().install()?;

    if let Some(path) = &args.generate_config {
        generate_example_config()
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    args.apply(&mut config);

    // Diagnostics go to stderr; stdout may carry the dissection log
    let filter = EnvFilter::try_new(&config.logging.level).context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.list_protocols {
        list_protocols(registry);
        return Ok(());
    }

    let plugin = *registry.find(&config.protocol)?;
    let target = config.target()?;
    let port = config.listen_port()?;

    let log = match &config.output.file {
        Some(path) => LogSink::open(path, config.output.append, config.output.raw_dump)
            .with_context(|| format!("Failed to open log file {}", path.display()))?,
        None => LogSink::stdout(config.output.raw_dump),
    };
    let listener = listen_at(port, config.listen.reuse_address)
        .with_context(|| format!("Failed to listen at port {}", port))?;

    match &target {
        Target::Forward(remote) => info!("Forwarding port {} to {} ({})", port, remote, plugin.name),
        Target::Socks => info!("SOCKS server listening at port {} ({})", port, plugin.name),
    }

    // Must happen before any thread is started
    if args.daemon {
        daemonize().context("Failed to detach")?;
    }

    let mut sniffer = Sniffer::new(plugin, config.plugin_options(), Arc::new(log))?
        .with_handshake_timeout(Duration::from_secs(config.listen.handshake_timeout_secs));

    let shutdown = Shutdown::new()?;
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger()).context("Failed to install signal handler")?;
    }

    sniffer.serve(&listener, &target, &shutdown)?;
    sniffer.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn list_protocols(registry: &Registry) {
    println!("Available protocols:");
    for plugin in registry.iter() {
        println!(
            "  {:<10} v{:<3} {:<16} {}",
            plugin.name,
            plugin.version,
            plugin.capabilities.to_string(),
            plugin.description
        );
    }
}

fn daemonize() -> std::io::Result<()> {
    // SAFETY: called while the process is still single-threaded; keeps the
    // working directory and the standard descriptors.
    if unsafe { libc::daemon(1, 1) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
