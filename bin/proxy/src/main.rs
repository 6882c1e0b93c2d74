use std::{fs::OpenOptions, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use buffering_proxy::{parse_net_buffer_size, parse_open_conns, parse_queued_conns, parse_switch_max_time, spawn_switch_hook, RcContext, RemoteControl};
use buffering_proxy_core::{describe_metrics, BufferingProxy, ProxyConfig, DEFAULT_LISTEN_BACKLOG, DEFAULT_NET_BUFFER_SIZE, DEFAULT_QUEUE_CAPACITY};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Buffering TCP proxy which switches between two backends without refusing clients
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port clients connect to
    #[arg(env, long, short = 'p')]
    port: u16,

    /// Backend relayed to at startup, as IP:PORT
    #[arg(env, long, short = 'a')]
    active: SocketAddr,

    /// Backend taken over on switch, as IP:PORT
    #[arg(env, long, short = 's')]
    standby: SocketAddr,

    /// TCP port for the remote control, disabled when not set
    #[arg(env, long, short = 'r')]
    rc_port: Option<u16>,

    /// Seconds a switch may wait for connections to drain before it is abandoned, 0 waits forever
    #[arg(env, long, short = 't', value_parser = parse_switch_max_time)]
    switch_max_time: Duration,

    /// Queued connections after which a pending switch is abandoned
    #[arg(env, long, short = 'c', value_parser = parse_queued_conns)]
    max_queued_conns: usize,

    /// Hard capacity of the connection queue
    #[arg(env, long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Relayed connections allowed at once, 0 for no limit
    #[arg(env, long, short = 'o', value_parser = parse_open_conns)]
    max_open_conns: usize,

    /// Backlog of the client listener
    #[arg(env, long, short = 'b', default_value_t = DEFAULT_LISTEN_BACKLOG)]
    listen_backlog: i32,

    /// Bytes read from a socket at once
    #[arg(env, long, short = 'n', default_value_t = DEFAULT_NET_BUFFER_SIZE, value_parser = parse_net_buffer_size)]
    net_buffer_size: usize,

    /// Seconds to wait after flipping backends before relaying again
    #[arg(env, long, default_value = "0", value_parser = parse_seconds)]
    switch_delay: Duration,

    /// Shell command executed after every completed switch
    #[arg(env, long, short = 'x')]
    switch_script: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(env, long, short = 'f')]
    log_file: Option<PathBuf>,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|_| format!("invalid seconds {value}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    let args: Args = Args::parse();
    let file_layer = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
        }
        None => None,
    };
    let stderr_layer = args.log_file.is_none().then(fmt::layer);
    tracing_subscriber::registry().with(stderr_layer).with(file_layer).with(EnvFilter::from_default_env()).init();
    describe_metrics();

    let cfg = ProxyConfig {
        listen: SocketAddr::from(([0, 0, 0, 0], args.port)),
        active: args.active,
        standby: args.standby,
        queue_capacity: args.queue_capacity,
        queue_soft_limit: args.max_queued_conns,
        max_open_connections: args.max_open_conns,
        net_buffer_size: args.net_buffer_size,
        listen_backlog: args.listen_backlog,
        switch_delay: args.switch_delay,
        ..Default::default()
    };
    let proxy = Arc::new(BufferingProxy::start(cfg)?);

    if let Some(script) = args.switch_script {
        spawn_switch_hook(script, proxy.switchover().subscribe())?;
    }

    if let Some(rc_port) = args.rc_port {
        let ctx = RcContext::new(proxy.clone(), args.switch_max_time);
        let rc = RemoteControl::bind(SocketAddr::from(([0, 0, 0, 0], rc_port)), ctx).await?;
        tokio::spawn(async move {
            if let Err(e) = rc.run().await {
                log::error!("[Main] remote control stopped {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    log::info!("[Main] interrupted, shutting down");
    tokio::task::spawn_blocking(move || proxy.shutdown()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use clap::Parser;

    use super::Args;

    const REQUIRED: [&str; 11] = [
        "buffering-proxy",
        "--port",
        "7000",
        "--active",
        "127.0.0.1:8000",
        "--standby",
        "127.0.0.1:8001",
        "--switch-max-time",
        "1.5",
        "--max-queued-conns",
        "100",
    ];

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(REQUIRED.iter().chain(["--max-open-conns", "0"].iter()).chain(extra.iter()))
    }

    #[test]
    fn defaults_log_to_stderr() {
        let args = parse(&[]).expect("should parse");
        assert_eq!(args.log_file, None);
        assert_eq!(args.net_buffer_size, 2048);
        assert_eq!(args.switch_max_time, Duration::from_millis(1500));
        assert_eq!(args.switch_delay, Duration::ZERO);
    }

    #[test]
    fn log_file_and_buffer_size() {
        let args = parse(&["-f", "/tmp/buffering-proxy.log", "--net-buffer-size", "4096"]).expect("should parse");
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/buffering-proxy.log")));
        assert_eq!(args.net_buffer_size, 4096);
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(parse(&["--net-buffer-size", "100"]).is_err());
        assert!(parse(&["--switch-delay", "-1"]).is_err());
        assert!(Args::try_parse_from(REQUIRED.iter().chain(["--max-open-conns", "5"].iter())).is_err());
    }
}
