#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use castbridge_domain::ConnectionId;
use castbridge_platform::PlatformEvent;
use castbridge_protocol::InboundFrame;
use core::fmt;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Event kinds the bus dispatches on.
///
/// Platform kinds and control-channel event names form disjoint
/// namespaces; `Control` is keyed by the control protocol's own event
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
	Chat,
	Gift,
	Like,
	Follow,
	Share,
	Join,
	StreamEnd,

	/// Ingestion feed lifecycle.
	FeedConnected,
	FeedDisconnected,

	/// A control peer finished its websocket handshake.
	PeerConnected,

	/// Inbound control-channel event, keyed by protocol event name.
	Control(String),
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EventKind::Chat => f.write_str("chat"),
			EventKind::Gift => f.write_str("gift"),
			EventKind::Like => f.write_str("like"),
			EventKind::Follow => f.write_str("follow"),
			EventKind::Share => f.write_str("share"),
			EventKind::Join => f.write_str("join"),
			EventKind::StreamEnd => f.write_str("streamEnd"),
			EventKind::FeedConnected => f.write_str("feedConnected"),
			EventKind::FeedDisconnected => f.write_str("feedDisconnected"),
			EventKind::PeerConnected => f.write_str("peerConnected"),
			EventKind::Control(name) => write!(f, "control:{name}"),
		}
	}
}

/// Payload delivered to subscribed handlers.
#[derive(Debug, Clone)]
pub enum BusEvent {
	Platform(PlatformEvent),

	/// Raw inbound control-channel event with its full frame.
	Control { name: String, frame: InboundFrame },

	PeerConnected { id: ConnectionId },
}

impl BusEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			BusEvent::Platform(ev) => match ev {
				PlatformEvent::Chat(_) => EventKind::Chat,
				PlatformEvent::Gift(_) => EventKind::Gift,
				PlatformEvent::Like(_) => EventKind::Like,
				PlatformEvent::Follow(_) => EventKind::Follow,
				PlatformEvent::Share(_) => EventKind::Share,
				PlatformEvent::Join(_) => EventKind::Join,
				PlatformEvent::StreamEnd => EventKind::StreamEnd,
				PlatformEvent::Connected => EventKind::FeedConnected,
				PlatformEvent::Disconnected => EventKind::FeedDisconnected,
			},
			BusEvent::Control { name, .. } => EventKind::Control(name.clone()),
			BusEvent::PeerConnected { .. } => EventKind::PeerConnected,
		}
	}
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Publish/subscribe bus over typed event kinds.
///
/// Handlers for one kind run in registration order; a handler that
/// panics is logged and skipped without affecting its siblings or the
/// publisher. The handler list is snapshotted before dispatch, so a
/// handler may subscribe or publish re-entrantly.
#[derive(Default)]
pub struct EventBus {
	handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&BusEvent) + Send + Sync + 'static) {
		let mut handlers = self.handlers.lock();
		handlers.entry(kind).or_default().push(Arc::new(handler));
	}

	pub fn publish(&self, event: BusEvent) {
		let kind = event.kind();
		let snapshot: Vec<Handler> = {
			let handlers = self.handlers.lock();
			match handlers.get(&kind) {
				Some(list) => list.clone(),
				None => {
					debug!(%kind, "no handlers subscribed; dropping event");
					return;
				}
			}
		};

		metrics::counter!("castbridge_events_published_total").increment(1);

		for handler in snapshot {
			if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
				metrics::counter!("castbridge_handler_panics_total").increment(1);
				warn!(%kind, "event handler panicked; skipping it, siblings still run");
			}
		}
	}

	/// Number of handlers registered for a kind.
	pub fn handler_count(&self, kind: &EventKind) -> usize {
		self.handlers.lock().get(kind).map(Vec::len).unwrap_or(0)
	}
}
