use std::{
    fmt,
    net::SocketAddr,
    ops::RangeInclusive,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use buffering_proxy_core::{BufferingProxy, SwitchEvent, REASON_SWITCH_TIMEOUT};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

pub const QUEUED_CONNS_RANGE: RangeInclusive<usize> = 10..=10_000;
pub const OPEN_CONNS_RANGE: RangeInclusive<usize> = 10..=65_536;
pub const NET_BUFFER_SIZE_RANGE: RangeInclusive<usize> = 1024..=65_536;
pub const MAX_SWITCH_TIME: Duration = Duration::from_secs(10);

const HELP: &str = "commands: switch, stats, get <name>, set <name> <value>, help, quit; names: max_queued_conns, max_open_conns, net_buffer_size, switch_max_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    MaxQueuedConns,
    MaxOpenConns,
    NetBufferSize,
    SwitchMaxTime,
}

impl FromStr for Setting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_queued_conns" => Ok(Self::MaxQueuedConns),
            "max_open_conns" => Ok(Self::MaxOpenConns),
            "net_buffer_size" => Ok(Self::NetBufferSize),
            "switch_max_time" => Ok(Self::SwitchMaxTime),
            _ => Err(anyhow!("unknown setting {s}")),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxQueuedConns => f.write_str("max_queued_conns"),
            Self::MaxOpenConns => f.write_str("max_open_conns"),
            Self::NetBufferSize => f.write_str("net_buffer_size"),
            Self::SwitchMaxTime => f.write_str("switch_max_time"),
        }
    }
}

/// One line of the remote control protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Switch,
    Stats,
    Get(Setting),
    Set(Setting, String),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts = line.split_whitespace().collect::<Vec<_>>();
        match parts.as_slice() {
            ["switch"] => Ok(Self::Switch),
            ["stats"] => Ok(Self::Stats),
            ["help"] => Ok(Self::Help),
            ["quit"] => Ok(Self::Quit),
            ["get", name] => Ok(Self::Get(name.parse()?)),
            ["set", name, value] => Ok(Self::Set(name.parse()?, (*value).to_owned())),
            _ => Err(anyhow!("unknown command")),
        }
    }
}

/// Shared state behind every remote control session.
#[derive(Clone)]
pub struct RcContext {
    proxy: Arc<BufferingProxy>,
    switch_max_time: Arc<Mutex<Duration>>,
}

impl RcContext {
    pub fn new(proxy: Arc<BufferingProxy>, switch_max_time: Duration) -> Self {
        Self {
            proxy,
            switch_max_time: Arc::new(Mutex::new(switch_max_time)),
        }
    }

    pub fn switch_max_time(&self) -> Duration {
        *self.switch_max_time.lock()
    }

    /// Runs a command and returns the reply line. `Quit` is left to the session.
    pub async fn execute(&self, cmd: Command) -> anyhow::Result<String> {
        match cmd {
            Command::Switch => self.switch().await,
            Command::Stats => Ok(self.proxy.snapshot().to_string()),
            Command::Get(setting) => Ok(format!("{setting} {}", self.get(setting))),
            Command::Set(setting, value) => {
                self.set(setting, &value)?;
                Ok(format!("OK {setting} {}", self.get(setting)))
            }
            Command::Help => Ok(HELP.to_owned()),
            Command::Quit => Ok("OK bye".to_owned()),
        }
    }

    async fn switch(&self) -> anyhow::Result<String> {
        // subscribe first so the watchdog cannot miss a fast completion
        let events = self.proxy.switchover().subscribe();
        // the switch lock may be held for a whole dial or settle delay
        let proxy = self.proxy.clone();
        if !tokio::task::spawn_blocking(move || proxy.trigger_switch()).await? {
            bail!("already switching");
        }
        let max = self.switch_max_time();
        if !max.is_zero() {
            tokio::spawn(watch_switch(self.proxy.clone(), events, max));
        }
        Ok("OK switching".to_owned())
    }

    fn get(&self, setting: Setting) -> String {
        let tunables = self.proxy.tunables();
        match setting {
            Setting::MaxQueuedConns => tunables.queue_soft_limit().to_string(),
            Setting::MaxOpenConns => tunables.max_open_connections().to_string(),
            Setting::NetBufferSize => tunables.net_buffer_size().to_string(),
            Setting::SwitchMaxTime => self.switch_max_time().as_secs_f64().to_string(),
        }
    }

    fn set(&self, setting: Setting, value: &str) -> anyhow::Result<()> {
        let tunables = self.proxy.tunables();
        match setting {
            Setting::MaxQueuedConns => tunables.set_queue_soft_limit(parse_queued_conns(value).map_err(|e| anyhow!(e))?),
            Setting::MaxOpenConns => tunables.set_max_open_connections(parse_open_conns(value).map_err(|e| anyhow!(e))?),
            Setting::NetBufferSize => tunables.set_net_buffer_size(parse_net_buffer_size(value).map_err(|e| anyhow!(e))?),
            Setting::SwitchMaxTime => {
                let value = parse_switch_max_time(value).map_err(|e| anyhow!(e))?;
                log::info!("[RemoteControl] switch max time => {value:?}");
                *self.switch_max_time.lock() = value;
            }
        }
        Ok(())
    }
}

pub fn parse_queued_conns(value: &str) -> Result<usize, String> {
    let value: usize = value.parse().map_err(|_| format!("invalid value {value}"))?;
    if !QUEUED_CONNS_RANGE.contains(&value) {
        return Err(format!("max_queued_conns must be in {}..={}", QUEUED_CONNS_RANGE.start(), QUEUED_CONNS_RANGE.end()));
    }
    Ok(value)
}

/// Like [`parse_queued_conns`] but 0 is accepted and disables throttling.
pub fn parse_open_conns(value: &str) -> Result<usize, String> {
    let value: usize = value.parse().map_err(|_| format!("invalid value {value}"))?;
    if value != 0 && !OPEN_CONNS_RANGE.contains(&value) {
        return Err(format!("max_open_conns must be 0 or in {}..={}", OPEN_CONNS_RANGE.start(), OPEN_CONNS_RANGE.end()));
    }
    Ok(value)
}

pub fn parse_net_buffer_size(value: &str) -> Result<usize, String> {
    let value: usize = value.parse().map_err(|_| format!("invalid value {value}"))?;
    if !NET_BUFFER_SIZE_RANGE.contains(&value) {
        return Err(format!("net_buffer_size must be in {}..={}", NET_BUFFER_SIZE_RANGE.start(), NET_BUFFER_SIZE_RANGE.end()));
    }
    Ok(value)
}

/// Parses seconds in `0..=10`, fractions allowed.
pub fn parse_switch_max_time(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|_| format!("invalid value {value}"))?;
    if !(0.0..=MAX_SWITCH_TIME.as_secs_f64()).contains(&secs) {
        return Err(format!("switch_max_time must be in 0..={} seconds", MAX_SWITCH_TIME.as_secs()));
    }
    Ok(Duration::from_secs_f64(secs))
}

async fn watch_switch(proxy: Arc<BufferingProxy>, events: Receiver<SwitchEvent>, max: Duration) {
    let watched = tokio::task::spawn_blocking(move || match wait_switch_outcome(&events, max) {
        Some(SwitchEvent::Completed { active }) => log::info!("[RemoteControl] switch completed, active backend {active}"),
        Some(SwitchEvent::Aborted { reason }) => log::warn!("[RemoteControl] switch aborted: {reason}"),
        Some(SwitchEvent::Draining) | None => {
            if proxy.switchover().abort_switch(REASON_SWITCH_TIMEOUT) {
                log::warn!("[RemoteControl] switch not completed after {max:?} => aborted");
            }
        }
    });
    if let Err(e) = watched.await {
        log::error!("[RemoteControl] switch watchdog failed {e}");
    }
}

/// Waits for the first `Completed` or `Aborted` event, `None` once `max` elapsed.
fn wait_switch_outcome(events: &Receiver<SwitchEvent>, max: Duration) -> Option<SwitchEvent> {
    let deadline = Instant::now() + max;
    loop {
        match events.recv_deadline(deadline) {
            Ok(SwitchEvent::Draining) => continue,
            Ok(event) => return Some(event),
            Err(_) => return None,
        }
    }
}

/// Line oriented control listener.
pub struct RemoteControl {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: RcContext,
}

impl RemoteControl {
    pub async fn bind(addr: SocketAddr, ctx: RcContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("[RemoteControl] listening on {local_addr}");
        Ok(Self { listener, local_addr, ctx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            log::info!("[RemoteControl] new session from {remote}");
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, ctx).await {
                    log::warn!("[RemoteControl] session {remote} error {e}");
                }
                log::info!("[RemoteControl] session {remote} closed");
            });
        }
    }
}

async fn run_session(stream: TcpStream, ctx: RcContext) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        log::debug!("[RemoteControl] command {line}");
        let cmd = line.parse::<Command>();
        let quit = matches!(cmd, Ok(Command::Quit));
        let result = match cmd {
            Ok(cmd) => ctx.execute(cmd).await,
            Err(e) => Err(e),
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => format!("ERR {e}"),
        };
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
        if quit {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream},
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use buffering_proxy_core::{BufferingProxy, ProxyConfig, RelayStatus, REASON_SWITCH_COMPLETE, REASON_SWITCH_TIMEOUT};
    use test_log::test;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
        net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
    };

    use super::{parse_switch_max_time, Command, RcContext, RemoteControl, Setting};

    fn spawn_backend(tag: &'static [u8]) -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("should bind backend");
        let addr = listener.local_addr().expect("should have addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    break;
                };
                thread::spawn(move || {
                    let _ = stream.write_all(tag);
                    let mut buf = [0u8; 64];
                    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
                });
            }
        });
        addr
    }

    struct RcClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl RcClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.expect("should connect rc").into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn call(&mut self, line: &str) -> Option<String> {
            self.write.write_all(format!("{line}\n").as_bytes()).await.expect("should send command");
            self.lines.next_line().await.expect("should read reply")
        }
    }

    async fn start(switch_max_time: Duration, switch_delay: Duration) -> (Arc<BufferingProxy>, RcContext, SocketAddr) {
        let proxy = Arc::new(
            BufferingProxy::start(ProxyConfig {
                listen: SocketAddr::from(([127, 0, 0, 1], 0)),
                active: spawn_backend(b"A:"),
                standby: spawn_backend(b"B:"),
                queue_soft_limit: 0,
                connect_timeout: Duration::from_secs(1),
                poll_timeout: Duration::from_millis(50),
                switch_delay,
                ..Default::default()
            })
            .expect("should start proxy"),
        );
        let ctx = RcContext::new(proxy.clone(), switch_max_time);
        let rc = RemoteControl::bind(SocketAddr::from(([127, 0, 0, 1], 0)), ctx.clone()).await.expect("should bind rc");
        let addr = rc.local_addr();
        tokio::spawn(rc.run());
        (proxy, ctx, addr)
    }

    async fn shutdown(proxy: Arc<BufferingProxy>) {
        tokio::task::spawn_blocking(move || proxy.shutdown()).await.expect("should shutdown");
    }

    #[test]
    fn parse_commands() {
        assert_eq!("switch".parse::<Command>().ok(), Some(Command::Switch));
        assert_eq!("  stats ".parse::<Command>().ok(), Some(Command::Stats));
        assert_eq!("get max_open_conns".parse::<Command>().ok(), Some(Command::Get(Setting::MaxOpenConns)));
        assert_eq!("set switch_max_time 2.5".parse::<Command>().ok(), Some(Command::Set(Setting::SwitchMaxTime, "2.5".to_owned())));
        assert_eq!("switch now".parse::<Command>().map_err(|e| e.to_string()), Err("unknown command".to_owned()));
        assert_eq!("reboot".parse::<Command>().map_err(|e| e.to_string()), Err("unknown command".to_owned()));
        assert_eq!("get queue".parse::<Command>().map_err(|e| e.to_string()), Err("unknown setting queue".to_owned()));
    }

    #[test]
    fn switch_max_time_range() {
        assert_eq!(parse_switch_max_time("0"), Ok(Duration::ZERO));
        assert_eq!(parse_switch_max_time("0.5"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_switch_max_time("10"), Ok(Duration::from_secs(10)));
        assert!(parse_switch_max_time("10.5").is_err());
        assert!(parse_switch_max_time("-1").is_err());
        assert!(parse_switch_max_time("soon").is_err());
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn switch_over_rc() {
        let (proxy, _ctx, addr) = start(Duration::from_secs(5), Duration::ZERO).await;
        let mut rc = RcClient::connect(addr).await;

        assert_eq!(rc.call("switch").await.as_deref(), Some("OK switching"));
        for _ in 0..100 {
            let snapshot = proxy.snapshot();
            if snapshot.relay == RelayStatus::Open && snapshot.active_index == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(proxy.snapshot().active_index, 1);
        assert_eq!(proxy.snapshot().reason, REASON_SWITCH_COMPLETE);

        let stats = rc.call("stats").await.expect("should reply stats");
        assert!(stats.starts_with("relay: Open (switch complete)"), "{stats}");
        assert_eq!(rc.call("bogus").await.as_deref(), Some("ERR unknown command"));
        assert_eq!(rc.call("quit").await.as_deref(), Some("OK bye"));
        assert_eq!(rc.lines.next_line().await.expect("should reach eof"), None);

        shutdown(proxy).await;
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn set_and_get_settings() {
        let (proxy, ctx, addr) = start(Duration::from_secs(1), Duration::ZERO).await;
        let mut rc = RcClient::connect(addr).await;

        assert_eq!(rc.call("set max_queued_conns 50").await.as_deref(), Some("OK max_queued_conns 50"));
        assert_eq!(proxy.tunables().queue_soft_limit(), 50);
        assert_eq!(rc.call("set max_queued_conns 5").await.as_deref(), Some("ERR max_queued_conns must be in 10..=10000"));
        assert_eq!(rc.call("get max_queued_conns").await.as_deref(), Some("max_queued_conns 50"));

        assert_eq!(rc.call("set max_open_conns 0").await.as_deref(), Some("OK max_open_conns 0"));
        assert_eq!(rc.call("set max_open_conns 9").await.as_deref(), Some("ERR max_open_conns must be 0 or in 10..=65536"));
        assert_eq!(rc.call("set max_open_conns 100").await.as_deref(), Some("OK max_open_conns 100"));
        assert_eq!(proxy.tunables().max_open_connections(), 100);

        assert_eq!(rc.call("set switch_max_time 2.5").await.as_deref(), Some("OK switch_max_time 2.5"));
        assert_eq!(ctx.switch_max_time(), Duration::from_millis(2500));
        assert_eq!(rc.call("set switch_max_time 11").await.as_deref(), Some("ERR switch_max_time must be in 0..=10 seconds"));
        assert_eq!(rc.call("set max_open_conns many").await.as_deref(), Some("ERR invalid value many"));

        assert_eq!(rc.call("get net_buffer_size").await.as_deref(), Some("net_buffer_size 2048"));
        assert_eq!(rc.call("set net_buffer_size 8192").await.as_deref(), Some("OK net_buffer_size 8192"));
        assert_eq!(proxy.tunables().net_buffer_size(), 8192);
        assert_eq!(rc.call("get net_buffer_size").await.as_deref(), Some("net_buffer_size 8192"));
        assert_eq!(rc.call("set net_buffer_size 512").await.as_deref(), Some("ERR net_buffer_size must be in 1024..=65536"));
        assert_eq!(rc.call("set net_buffer_size 70000").await.as_deref(), Some("ERR net_buffer_size must be in 1024..=65536"));
        assert_eq!(proxy.tunables().net_buffer_size(), 8192);

        shutdown(proxy).await;
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn stats_answer_during_settle_delay() {
        let (proxy, _ctx, addr) = start(Duration::ZERO, Duration::from_secs(2)).await;
        let mut rc = RcClient::connect(addr).await;

        assert_eq!(rc.call("switch").await.as_deref(), Some("OK switching"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        let stats = rc.call("stats").await.expect("should reply stats");
        assert!(started.elapsed() < Duration::from_millis(200), "stats took {:?}", started.elapsed());
        assert!(stats.starts_with("relay: Closed"), "{stats}");
        assert!(stats.contains("[1]"), "{stats}");

        shutdown(proxy).await;
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn watchdog_aborts_stuck_switch() {
        let (proxy, _ctx, addr) = start(Duration::from_millis(300), Duration::ZERO).await;
        let mut rc = RcClient::connect(addr).await;

        // a live relayed connection keeps the drain from completing
        let proxy_addr = proxy.local_addr();
        let client = tokio::task::spawn_blocking(move || {
            let mut client = StdTcpStream::connect(proxy_addr).expect("should connect proxy");
            client.set_read_timeout(Some(Duration::from_secs(5))).expect("should set timeout");
            let mut tag = [0u8; 2];
            client.read_exact(&mut tag).expect("should receive tag");
            assert_eq!(&tag, b"A:");
            client
        })
        .await
        .expect("should relay client");

        assert_eq!(rc.call("switch").await.as_deref(), Some("OK switching"));
        assert_eq!(rc.call("switch").await.as_deref(), Some("ERR already switching"));
        assert_eq!(proxy.snapshot().relay, RelayStatus::Closed);

        for _ in 0..100 {
            if proxy.snapshot().relay == RelayStatus::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snapshot = proxy.snapshot();
        assert_eq!(snapshot.relay, RelayStatus::Open);
        assert_eq!(snapshot.reason, REASON_SWITCH_TIMEOUT);
        assert_eq!(snapshot.active_index, 0);

        drop(client);
        shutdown(proxy).await;
    }
}
