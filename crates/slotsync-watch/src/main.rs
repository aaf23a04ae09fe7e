use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use slotsync_client::config::{env_true, env_value};
use slotsync_client::{
    ChannelClient, ChannelConfig, Deployment, Notice, NoticeLevel, RefreshCoordinator,
    RestAppointmentSource, ScopeState, ViewProfile, ViewRenderer,
};
use slotsync_core::{Appointment, Branch, Scope};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

const BUSY: &str = "busy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ViewKind {
    Calendar,
    Tasks,
}

impl ViewKind {
    fn profile(&self) -> ViewProfile {
        match self {
            ViewKind::Calendar => ViewProfile::calendar(),
            ViewKind::Tasks => ViewProfile::task_list(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "slotsync-watch", about = "Live terminal view of the appointment schedule")]
struct Args {
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, value_enum, default_value_t = ViewKind::Calendar)]
    view: ViewKind,
    #[arg(long, default_value = "all")]
    branch: Branch,
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long, default_value_t = 10)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = 3000)]
    reconnect_interval_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, Clone)]
struct Config {
    hub_url: Url,
    api_url: Url,
    view: ViewKind,
    scope: Scope,
    max_reconnect_attempts: u32,
    reconnect_interval: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Branch(Branch),
    Date(NaiveDate),
    Send { event_type: String, payload: Value },
    Status,
    Connect,
    Disconnect,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (head, rest) = line
        .split_once(char::is_whitespace)
        .map(|(head, rest)| (head, rest.trim()))
        .unwrap_or((line, ""));
    match head {
        "branch" => rest.parse().map(Command::Branch),
        "date" => NaiveDate::parse_from_str(rest, "%Y-%m-%d")
            .map(Command::Date)
            .map_err(|_| format!("expected YYYY-MM-DD, got {rest:?}")),
        "send" => {
            let (event_type, raw) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if event_type.is_empty() {
                return Err("usage: send <type> <json>".to_string());
            }
            let payload = if raw.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(raw.trim()).map_err(|err| format!("invalid json: {err}"))?
            };
            Ok(Command::Send {
                event_type: event_type.to_string(),
                payload,
            })
        }
        "status" => Ok(Command::Status),
        "connect" => Ok(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Appointments grouped by `HH:MM` slot, each entry the staff name.
fn slot_rows(appointments: &[Appointment]) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for appointment in appointments {
        let name = appointment.staff_name().unwrap_or_else(|| BUSY.to_string());
        grouped.entry(appointment.slot_label()).or_default().push(name);
    }
    grouped
}

struct ConsoleRenderer {
    view: ViewKind,
    completed: Mutex<BTreeSet<String>>,
}

impl ConsoleRenderer {
    fn new(view: ViewKind) -> Self {
        Self {
            view,
            completed: Mutex::new(BTreeSet::new()),
        }
    }

    fn task_lines(&self, appointments: &[Appointment]) -> Vec<String> {
        let completed = self
            .completed
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default();
        let mut sorted: Vec<&Appointment> = appointments.iter().collect();
        sorted.sort_by_key(|item| item.date_of_appointment);
        sorted
            .into_iter()
            .map(|item| {
                let done = item.is_finished || completed.contains(&item.id);
                format!(
                    "[{}] {} {} -> {}",
                    if done { "x" } else { " " },
                    item.slot_label(),
                    item.staff_name().unwrap_or_else(|| BUSY.to_string()),
                    item.client_name().unwrap_or_else(|| "-".to_string()),
                )
            })
            .collect()
    }
}

impl ViewRenderer for ConsoleRenderer {
    fn render(&self, scope: &Scope, appointments: &[Appointment]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "== {scope} ({} appointments) ==", appointments.len())?;
        match self.view {
            ViewKind::Calendar => {
                for (slot, names) in slot_rows(appointments) {
                    writeln!(out, "{slot}  {}", names.join(", "))?;
                }
            }
            ViewKind::Tasks => {
                for line in self.task_lines(appointments) {
                    writeln!(out, "{line}")?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        let tag = match notice.level {
            NoticeLevel::Success => "ok",
            NoticeLevel::Warning => "warn",
            NoticeLevel::Error => "error",
        };
        println!("[{tag}] {}", notice.message);
    }

    fn mark_completed(&self, id: &str) -> anyhow::Result<()> {
        let mut completed = self
            .completed
            .lock()
            .map_err(|_| anyhow::anyhow!("completed set poisoned"))?;
        if completed.insert(id.to_string()) {
            println!("[ok] task {id} completed");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);
    if let Err(err) = run(config).await {
        error!(event = "watch_failed", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let channel = ChannelClient::new(
        ChannelConfig::new(config.hub_url.clone())
            .with_max_reconnect_attempts(config.max_reconnect_attempts)
            .with_reconnect_interval(config.reconnect_interval),
    );
    let scope = Arc::new(ScopeState::with_scope(config.scope));
    let source = Arc::new(RestAppointmentSource::new(config.api_url.clone())?);
    let renderer = Arc::new(ConsoleRenderer::new(config.view));
    let coordinator = RefreshCoordinator::attach(
        channel.clone(),
        scope.clone(),
        source,
        renderer,
        config.view.profile(),
    )?;
    info!(
        event = "watch_start",
        hub_url = %config.hub_url,
        api_url = %config.api_url,
        view = coordinator.profile().name(),
        scope = %config.scope
    );
    spawn_connect(&channel);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => execute(command, &channel, &scope, &coordinator),
                    Err(message) => eprintln!("{message} (try `help`)"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.detach();
    channel.disconnect();
    info!(event = "watch_stop");
    Ok(())
}

fn execute(
    command: Command,
    channel: &ChannelClient,
    scope: &ScopeState,
    coordinator: &RefreshCoordinator,
) {
    match command {
        Command::Branch(branch) => {
            scope.set_branch(branch);
        }
        Command::Date(date) => {
            scope.set_date(date);
        }
        Command::Send {
            event_type,
            payload,
        } => {
            let channel = channel.clone();
            tokio::spawn(async move {
                let sent = channel.send(&event_type, payload).await;
                println!("send {event_type}: {}", if sent { "delivered" } else { "dropped" });
            });
        }
        Command::Status => {
            let status = json!({
                "channel": channel.status(),
                "scope": scope.current(),
                "view": coordinator.phase(),
                "stats": coordinator.stats(),
            });
            println!("{status:#}");
        }
        Command::Connect => spawn_connect(channel),
        Command::Disconnect => channel.disconnect(),
        Command::Help => {
            println!("commands: branch <all|baitursynov|gagarina>, date <YYYY-MM-DD>, send <type> <json>, status, connect, disconnect, quit");
        }
        Command::Quit => {}
    }
}

fn spawn_connect(channel: &ChannelClient) {
    let channel = channel.clone();
    tokio::spawn(async move {
        if let Err(err) = channel.connect().await {
            warn!(event = "channel_unavailable", url = %channel.config().url, error = %err);
        }
    });
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let host = env_value("SLOTSYNC_PANEL_HOST").unwrap_or_else(|| "localhost".to_string());
    let deployment = Deployment::from_host(&host);
    let secure = env_true("SLOTSYNC_SECURE");

    let hub_url = match flag_or_env(&args.hub_url, "SLOTSYNC_HUB_URL") {
        Some(raw) => Url::parse(&raw).with_context(|| format!("invalid hub url {raw:?}"))?,
        None => deployment.channel_url(secure)?,
    };
    let api_url = match flag_or_env(&args.api_url, "SLOTSYNC_API_URL") {
        Some(raw) => Url::parse(&raw).with_context(|| format!("invalid api url {raw:?}"))?,
        None => deployment.api_url(secure)?,
    };
    if !matches!(hub_url.scheme(), "ws" | "wss") {
        bail!("hub url must use ws:// or wss://, got {hub_url}");
    }

    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    Ok(Config {
        hub_url,
        api_url,
        view: args.view,
        scope: Scope::new(args.branch, date),
        max_reconnect_attempts: args.max_reconnect_attempts,
        reconnect_interval: Duration::from_millis(args.reconnect_interval_ms),
        debug: args.debug || env_true("SLOTSYNC_WATCH_DEBUG"),
        log_dir: flag_or_env(&args.log_dir, "SLOTSYNC_LOG_DIR").unwrap_or_default(),
    })
}

fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value(key)
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else {
        env_value("SLOTSYNC_LOG_LEVEL").unwrap_or_else(|| "warn".to_string())
    };
    let filter = if config.debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

// stdout carries the rendered view, so log lines go to stderr.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("slotsync-watch.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
