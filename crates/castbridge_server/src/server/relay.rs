#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use castbridge_domain::{ConnectionId, ScriptEventId, Username};
use castbridge_platform::{
	ChatEvent, FeedControl, FollowEvent, GiftEvent, GiftInfo, JoinEvent, LikeEvent, LiveFeed, PlatformEvent, ShareEvent,
};
use castbridge_protocol::{InboundFrame, SubscribeFrame};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::bus::{BusEvent, EventBus, EventKind};
use crate::server::command::CommandChannel;
use crate::server::registry::{ConnectionHandle, ConnectionRegistry};

/// Relay wiring settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	/// Streaming account the feed ingests from.
	pub username: Username,

	/// Keepalive probe interval for registered control sockets.
	pub keepalive: Duration,

	/// Control-protocol event names subscribed on every new peer.
	pub subscribe_events: Vec<String>,

	/// Command sent to greet each newly connected peer.
	pub greeting_command: Option<String>,
}

impl RelaySettings {
	pub fn new(username: Username) -> Self {
		Self {
			username,
			keepalive: Duration::from_secs(30),
			subscribe_events: Vec::new(),
			greeting_command: Some("playsound random.levelup".to_string()),
		}
	}
}

/// Handle to a spawned ingestion feed.
#[derive(Debug, Clone)]
pub struct FeedHandle {
	control: mpsc::Sender<FeedControl>,
}

impl FeedHandle {
	/// Ask the feed to close its upstream connection (best-effort).
	pub async fn disconnect(&self) {
		let _ = self.control.send(FeedControl::Disconnect).await;
	}

	/// Query the platform's gift catalog. `None` when the feed is gone or
	/// does not answer in time.
	pub async fn available_gifts(&self) -> Option<Vec<GiftInfo>> {
		let (tx, rx) = oneshot::channel();
		if self.control.send(FeedControl::QueryGifts { resp: tx }).await.is_err() {
			return None;
		}
		match tokio::time::timeout(Duration::from_secs(3), rx).await {
			Ok(Ok(gifts)) => Some(gifts),
			_ => None,
		}
	}
}

/// Composition root for the relay: owns the registry, bus, and command
/// channel, and exposes the registration facade behavior modules attach
/// to.
pub struct Relay {
	settings: RelaySettings,
	registry: Arc<ConnectionRegistry>,
	bus: Arc<EventBus>,
	channel: CommandChannel,
	feed: Mutex<Option<FeedHandle>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Relay {
	pub fn new(settings: RelaySettings, registry: Arc<ConnectionRegistry>, bus: Arc<EventBus>, channel: CommandChannel) -> Self {
		let (shutdown_tx, _) = watch::channel(false);
		Self {
			settings,
			registry,
			bus,
			channel,
			feed: Mutex::new(None),
			shutdown_tx,
		}
	}

	pub fn settings(&self) -> &RelaySettings {
		&self.settings
	}

	pub fn username(&self) -> &Username {
		&self.settings.username
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	pub fn bus(&self) -> &Arc<EventBus> {
		&self.bus
	}

	pub fn channel(&self) -> &CommandChannel {
		&self.channel
	}

	pub fn feed(&self) -> Option<FeedHandle> {
		self.feed.lock().clone()
	}

	fn attach_feed(&self, handle: FeedHandle) {
		*self.feed.lock() = Some(handle);
	}

	/// Observe the shutdown flag; flips to `true` exactly once.
	pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
		self.shutdown_tx.subscribe()
	}

	/// Orderly teardown: feed disconnect, awaited-table cleanup (cancels
	/// every pending deadline timer), socket close, listener stop.
	pub async fn begin_shutdown(&self) {
		info!("relay shutdown initiated");

		let feed = self.feed();
		if let Some(feed) = feed {
			feed.disconnect().await;
		}

		self.channel.clear_awaited();
		self.registry.close_all();
		let _ = self.shutdown_tx.send(true);
	}

	// Registration facade consumed by behavior modules.

	pub fn on_chat(&self, f: impl Fn(&ChatEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Chat, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Chat(chat)) = ev {
				f(chat);
			}
		});
	}

	pub fn on_gift(&self, f: impl Fn(&GiftEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Gift, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Gift(gift)) = ev {
				f(gift);
			}
		});
	}

	pub fn on_like(&self, f: impl Fn(&LikeEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Like, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Like(like)) = ev {
				f(like);
			}
		});
	}

	pub fn on_follow(&self, f: impl Fn(&FollowEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Follow, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Follow(follow)) = ev {
				f(follow);
			}
		});
	}

	pub fn on_share(&self, f: impl Fn(&ShareEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Share, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Share(share)) = ev {
				f(share);
			}
		});
	}

	pub fn on_join(&self, f: impl Fn(&JoinEvent) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Join, move |ev| {
			if let BusEvent::Platform(PlatformEvent::Join(join)) = ev {
				f(join);
			}
		});
	}

	pub fn on_stream_end(&self, f: impl Fn() + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::StreamEnd, move |_| f());
	}

	pub fn on_feed_connected(&self, f: impl Fn() + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::FeedConnected, move |_| f());
	}

	pub fn on_feed_disconnected(&self, f: impl Fn() + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::FeedDisconnected, move |_| f());
	}

	pub fn on_peer_connected(&self, f: impl Fn(ConnectionId) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::PeerConnected, move |ev| {
			if let BusEvent::PeerConnected { id } = ev {
				f(*id);
			}
		});
	}

	/// Subscribe to a raw control-channel event by protocol event name.
	pub fn on_control_event(&self, name: impl Into<String>, f: impl Fn(&InboundFrame) + Send + Sync + 'static) {
		self.bus.subscribe(EventKind::Control(name.into()), move |ev| {
			if let BusEvent::Control { frame, .. } = ev {
				f(frame);
			}
		});
	}

	pub fn send_command(&self, command_line: impl Into<String>) {
		self.channel.send_command(command_line);
	}

	pub fn send_script_event(&self, event_id: &ScriptEventId, payload: &str) {
		self.channel.send_script_event(event_id, payload);
	}
}

/// Spawn the ingestion feed and wire its event stream onto the bus.
///
/// `StreamEnd` is delivered to subscribers first, then triggers orderly
/// shutdown.
pub fn spawn_feed(relay: &Arc<Relay>, feed: Box<dyn LiveFeed>) -> FeedHandle {
	let (control_tx, control_rx) = mpsc::channel(16);
	let (events_tx, mut events_rx) = mpsc::channel(1024);

	let feed_name = feed.name();
	tokio::spawn(async move {
		if let Err(e) = feed.run(control_rx, events_tx).await {
			warn!(feed = feed_name, error = %e, "live feed exited with error");
		}
	});

	let relay_for_events = Arc::clone(relay);
	tokio::spawn(async move {
		while let Some(event) = events_rx.recv().await {
			let stream_ended = matches!(event, PlatformEvent::StreamEnd);

			debug!(event = %event, "platform event");
			relay_for_events.bus().publish(BusEvent::Platform(event));

			if stream_ended {
				info!("live stream ended; shutting down");
				relay_for_events.begin_shutdown().await;
				break;
			}
		}
	});

	let handle = FeedHandle { control: control_tx };
	relay.attach_feed(handle.clone());
	handle
}

/// Accept control peers until shutdown.
pub async fn run_listener(relay: Arc<Relay>, listener: TcpListener) -> anyhow::Result<()> {
	let mut shutdown = relay.subscribe_shutdown();
	info!(addr = %listener.local_addr()?, "control listener ready");

	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					break;
				}
			}

			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let relay = Arc::clone(&relay);
						tokio::spawn(async move {
							handle_socket(relay, stream, peer).await;
						});
					}
					Err(e) => warn!(error = %e, "control listener accept failed"),
				}
			}
		}
	}

	info!("control listener stopped");
	Ok(())
}

/// Periodic keepalive probe; sockets that no longer accept a ping are
/// removed from the registry.
pub fn spawn_keepalive(relay: Arc<Relay>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut shutdown = relay.subscribe_shutdown();
		let mut interval = tokio::time::interval(relay.settings().keepalive);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		interval.tick().await;

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}

				_ = interval.tick() => {
					for handle in relay.registry().list() {
						if !handle.ping() {
							warn!(id = %handle.id(), "keepalive ping failed; removing connection");
							relay.registry().remove(handle.id());
						}
					}
				}
			}
		}
	})
}

async fn handle_socket(relay: Arc<Relay>, stream: TcpStream, peer: SocketAddr) {
	let ws = match accept_async(stream).await {
		Ok(ws) => ws,
		Err(e) => {
			warn!(%peer, error = %e, "websocket handshake failed");
			return;
		}
	};

	let id = ConnectionId::new();
	info!(%id, %peer, "control peer connected");

	let (mut sink, mut ws_rx) = ws.split();
	let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
	let handle = ConnectionHandle::new(id, tx);

	// The writer task is the sole owner of the sink half.
	let writer = tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			let is_close = matches!(msg, Message::Close(_));
			if let Err(e) = sink.send(msg).await {
				debug!(error = %e, "control socket write failed");
				break;
			}
			if is_close {
				break;
			}
		}
		let _ = sink.close().await;
	});

	relay.registry().add(handle.clone());

	// Event subscriptions bypass the command queue; they carry no
	// correlated response worth awaiting.
	for event_name in &relay.settings().subscribe_events {
		match SubscribeFrame::new(event_name.clone()).to_json() {
			Ok(json) => {
				if handle.send_text(json).is_err() {
					warn!(%id, event = %event_name, "peer went away before subscription was sent");
					break;
				}
				info!(%id, event = %event_name, "subscribed to control event");
			}
			Err(e) => warn!(event = %event_name, error = %e, "failed to serialize subscribe frame"),
		}
	}

	if let Some(greeting) = &relay.settings().greeting_command {
		relay.channel().send_command(greeting.clone());
	}

	// A new peer frees the queue: flush anything enqueued while offline.
	relay.channel().drain();
	relay.bus().publish(BusEvent::PeerConnected { id });

	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Text(text)) => relay.channel().on_message(text.as_str()),
			Ok(Message::Ping(payload)) => {
				let _ = handle.pong(payload);
			}
			Ok(Message::Pong(_)) => debug!(%id, "keepalive pong received"),
			Ok(Message::Close(_)) => {
				debug!(%id, "close frame from peer");
				break;
			}
			Ok(_) => {}
			Err(e) => {
				warn!(%id, error = %e, "control socket error");
				break;
			}
		}
	}

	relay.registry().remove(id);
	drop(handle);
	let _ = writer.await;
	info!(%id, %peer, "control peer disconnected");
}
