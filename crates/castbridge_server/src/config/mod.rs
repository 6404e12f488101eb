#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use castbridge_domain::Username;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.castbridge/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".castbridge").join("config.toml"))
}

/// Load the relay config from TOML and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<RelayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = RelayConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg)?;

	Ok(cfg)
}

/// Relay config (v1).
#[derive(Debug, Clone)]
pub struct RelayConfig {
	/// Streaming account to ingest from. Mandatory; checked at startup.
	pub username: Option<Username>,

	/// Control listener bind address (host:port).
	pub bind: String,

	/// Cap on simultaneously in-flight commands.
	pub max_in_flight: usize,

	/// Command response deadline.
	pub command_timeout: Duration,

	/// Keepalive probe interval for control sockets.
	pub keepalive: Duration,

	/// Control-protocol event names subscribed per peer.
	pub subscribe_events: Vec<String>,

	/// Behavior modules attached at startup.
	pub behaviors: Vec<String>,

	/// Namespace prefix for forwarded script events.
	pub script_namespace: String,

	/// Ingestion feed selector (`demo` is the only built-in).
	pub feed: String,

	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			username: None,
			bind: "127.0.0.1:19131".to_string(),
			max_in_flight: 100,
			command_timeout: Duration::from_millis(5_000),
			keepalive: Duration::from_secs(30),
			subscribe_events: Vec::new(),
			behaviors: vec!["script_relay".to_string()],
			script_namespace: "bridge".to_string(),
			feed: "demo".to_string(),
			metrics_bind: None,
		}
	}
}

impl RelayConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let mut cfg = Self::default();

		if let Some(username) = file.username {
			cfg.username = Some(Username::new(username).context("config: invalid username")?);
		}
		if let Some(bind) = file.bind {
			cfg.bind = bind;
		}
		if let Some(max_in_flight) = file.max_in_flight {
			cfg.max_in_flight = max_in_flight;
		}
		if let Some(ms) = file.command_timeout_ms {
			cfg.command_timeout = Duration::from_millis(ms);
		}
		if let Some(secs) = file.keepalive_secs {
			cfg.keepalive = Duration::from_secs(secs);
		}
		if let Some(events) = file.subscribe_events {
			cfg.subscribe_events = events;
		}
		if let Some(behaviors) = file.behaviors {
			cfg.behaviors = behaviors;
		}
		if let Some(namespace) = file.script_namespace {
			cfg.script_namespace = namespace;
		}
		if let Some(feed) = file.feed {
			cfg.feed = feed;
		}
		if let Some(bind) = file.metrics_bind {
			cfg.metrics_bind = Some(bind);
		}

		Ok(cfg)
	}

	/// The account to ingest from; missing username is a fatal startup
	/// error.
	pub fn require_username(&self) -> anyhow::Result<&Username> {
		self.username
			.as_ref()
			.ok_or_else(|| anyhow!("no streaming username configured (set `username` in config or CASTBRIDGE_USERNAME)"))
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	username: Option<String>,
	bind: Option<String>,
	max_in_flight: Option<usize>,
	command_timeout_ms: Option<u64>,
	keepalive_secs: Option<u64>,
	subscribe_events: Option<Vec<String>>,
	behaviors: Option<Vec<String>>,
	script_namespace: Option<String>,
	feed: Option<String>,
	metrics_bind: Option<String>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	if !path.exists() {
		return Ok(None);
	}

	let raw = fs::read_to_string(path)?;
	let parsed: FileConfig = toml::from_str(&raw).context("parse config toml")?;
	Ok(Some(parsed))
}

fn apply_env_overrides(cfg: &mut RelayConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("CASTBRIDGE_USERNAME") {
		let v = v.trim();
		if !v.is_empty() {
			cfg.username = Some(Username::new(v).context("CASTBRIDGE_USERNAME: invalid username")?);
			info!("config: username overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bind = v;
			info!("config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_MAX_IN_FLIGHT")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.max_in_flight = max;
		info!(max_in_flight = max, "config: max_in_flight overridden by env");
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_COMMAND_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.command_timeout = Duration::from_millis(ms);
		info!(timeout_ms = ms, "config: command_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_KEEPALIVE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.keepalive = Duration::from_secs(secs);
		info!(keepalive_secs = secs, "config: keepalive overridden by env");
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_BEHAVIORS") {
		let behaviors: Vec<String> = v
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect();
		if !behaviors.is_empty() {
			cfg.behaviors = behaviors;
			info!("config: behaviors overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_SCRIPT_NAMESPACE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.script_namespace = v;
			info!("config: script_namespace overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_FEED") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.feed = v;
			info!("config: feed overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CASTBRIDGE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("config: metrics_bind overridden by env");
		}
	}

	Ok(())
}
