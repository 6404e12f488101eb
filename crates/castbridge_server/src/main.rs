#![forbid(unsafe_code)]

mod behaviors;
mod config;
mod server;

use std::sync::Arc;

use anyhow::Context as _;
use castbridge_platform::{DemoFeed, LiveFeed};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::RelayConfig;
use crate::server::bus::EventBus;
use crate::server::command::{CommandChannel, CommandChannelConfig};
use crate::server::registry::ConnectionRegistry;
use crate::server::relay::{Relay, RelaySettings, run_listener, spawn_feed, spawn_keepalive};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: castbridge_server [--bind host:port] [--user name]\n\
\n\
Options:\n\
\t--bind   Control listener address (default: 127.0.0.1:19131)\n\
\t--user   Streaming account to ingest from (overrides config)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	username: Option<String>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs { bind: None, username: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--user" | "--username" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--user must be non-empty");
					usage_and_exit();
				}
				args.username = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,castbridge_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_feed(cfg: &RelayConfig) -> anyhow::Result<Box<dyn LiveFeed>> {
	match cfg.feed.as_str() {
		"demo" => Ok(Box::new(DemoFeed::new())),
		other => Err(anyhow::anyhow!("unknown feed `{other}` (built-in feeds: demo)")),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = crate::config::default_config_path()?;
	let mut cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");

	if let Some(bind) = args.bind {
		cfg.bind = bind;
	}
	if let Some(username) = args.username {
		cfg.username = Some(castbridge_domain::Username::new(username).context("--user: invalid username")?);
	}

	let username = cfg.require_username()?.clone();

	init_metrics(cfg.metrics_bind.as_deref());

	// Bind before anything else is wired; an occupied port is fatal.
	let listener = TcpListener::bind(&cfg.bind)
		.await
		.with_context(|| format!("bind control listener on {}", cfg.bind))?;
	info!(addr = %listener.local_addr()?, username = %username, "castbridge_server starting");

	let registry = Arc::new(ConnectionRegistry::new());
	let bus = Arc::new(EventBus::new());
	let channel = CommandChannel::new(
		CommandChannelConfig {
			max_in_flight: cfg.max_in_flight,
			command_timeout: cfg.command_timeout,
		},
		Arc::clone(&registry),
		Arc::clone(&bus),
	);

	let mut settings = RelaySettings::new(username);
	settings.keepalive = cfg.keepalive;
	settings.subscribe_events = cfg.subscribe_events.clone();

	let relay = Arc::new(Relay::new(settings, registry, bus, channel));

	// Behaviors attach before the feed starts so the earliest events
	// (feed connected in particular) already have their subscribers.
	behaviors::attach_selected(&relay, &cfg.behaviors, &cfg.script_namespace);

	let feed = build_feed(&cfg)?;
	spawn_feed(&relay, feed);
	spawn_keepalive(Arc::clone(&relay));

	run_listener(relay, listener).await
}
