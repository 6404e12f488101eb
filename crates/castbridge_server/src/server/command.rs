#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use castbridge_domain::{RequestId, ScriptEventId};
use castbridge_protocol::{CommandRequestFrame, FrameKind, InboundFrame};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::bus::{BusEvent, EventBus};
use crate::server::registry::ConnectionRegistry;

/// Command channel tuning.
#[derive(Debug, Clone)]
pub struct CommandChannelConfig {
	/// Cap on simultaneously awaited (sent, unresolved) requests.
	pub max_in_flight: usize,

	/// Deadline for a command response before the request is abandoned.
	pub command_timeout: Duration,
}

impl Default for CommandChannelConfig {
	fn default() -> Self {
		Self {
			max_in_flight: 100,
			command_timeout: Duration::from_secs(5),
		}
	}
}

/// One in-flight request: the original frame plus its owned deadline
/// timer. Created at send time, destroyed on response receipt or timeout
/// firing, never both.
struct AwaitedEntry {
	frame: CommandRequestFrame,
	deadline: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelState {
	pending: VecDeque<CommandRequestFrame>,
	awaited: HashMap<RequestId, AwaitedEntry>,
}

/// The outbound command queue with request/response correlation.
///
/// Requests move `Queued → Sent-Awaiting-Response → {Resolved | TimedOut}`.
/// All state lives behind one mutex, so `drain` may be invoked
/// concurrently from a response, a timeout firing, and a new enqueue
/// without double-sending or double-removing.
#[derive(Clone)]
pub struct CommandChannel {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: CommandChannelConfig,
	registry: Arc<ConnectionRegistry>,
	bus: Arc<EventBus>,
	state: Mutex<ChannelState>,
}

impl CommandChannel {
	pub fn new(cfg: CommandChannelConfig, registry: Arc<ConnectionRegistry>, bus: Arc<EventBus>) -> Self {
		Self {
			inner: Arc::new(Inner {
				cfg,
				registry,
				bus,
				state: Mutex::new(ChannelState::default()),
			}),
		}
	}

	/// Enqueue a command line for transmission. Fire-and-forget: the
	/// response (or timeout) is observed via logs, not a return value.
	pub fn send_command(&self, command_line: impl Into<String>) {
		let frame = CommandRequestFrame::new(command_line);
		debug!(request_id = %frame.request_id(), command = frame.command_line(), "queueing command");

		self.inner.state.lock().pending.push_back(frame);
		self.drain();
	}

	/// Send a `scriptevent` command embedding `event_id` and a serialized
	/// payload.
	pub fn send_script_event(&self, event_id: &ScriptEventId, payload: &str) {
		self.send_command(format!("scriptevent {event_id} {payload}"));
	}

	/// Transmit queued requests up to the in-flight cap, FIFO.
	///
	/// A no-op while no control peer is connected; queued requests wait
	/// for the next `drain` call (e.g. from a later enqueue or the peer
	/// accept path). A serialization or write failure for one request is
	/// logged and does not abort the rest of the pass.
	pub fn drain(&self) {
		let Some(primary) = self.inner.registry.primary() else {
			return;
		};

		let mut state = self.inner.state.lock();
		while state.awaited.len() < self.inner.cfg.max_in_flight {
			let Some(frame) = state.pending.pop_front() else {
				break;
			};

			let payload = match frame.to_json() {
				Ok(payload) => payload,
				Err(e) => {
					warn!(error = %e, command = frame.command_line(), "failed to serialize command; dropping it");
					continue;
				}
			};

			if let Err(e) = primary.send_text(payload) {
				warn!(error = %e, command = frame.command_line(), "failed to write command; dropping it");
				continue;
			}

			metrics::counter!("castbridge_commands_sent_total").increment(1);

			let request_id = frame.request_id();
			let deadline = self.spawn_deadline(request_id);
			state.awaited.insert(request_id, AwaitedEntry { frame, deadline });
		}
	}

	fn spawn_deadline(&self, request_id: RequestId) -> JoinHandle<()> {
		let channel = self.clone();
		let timeout = self.inner.cfg.command_timeout;
		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			channel.on_deadline(request_id);
		})
	}

	/// Handle a raw inbound control-channel frame.
	///
	/// Malformed or unknown-purpose frames are dropped with a warning and
	/// never close the connection or mutate queue state.
	pub fn on_message(&self, raw: &str) {
		let frame = match InboundFrame::parse(raw) {
			Ok(frame) => frame,
			Err(e) => {
				metrics::counter!("castbridge_frames_dropped_total").increment(1);
				warn!(error = %e, "dropping malformed control frame");
				return;
			}
		};

		match frame.classify() {
			FrameKind::Event { name } => {
				let name = name.to_string();
				debug!(event = %name, "inbound control event");
				self.inner.bus.publish(BusEvent::Control { name, frame });
			}
			FrameKind::CommandResponse { request_id } => self.resolve(request_id, &frame),
			FrameKind::Unknown { purpose } => {
				metrics::counter!("castbridge_frames_dropped_total").increment(1);
				warn!(purpose, "dropping control frame with unhandled purpose");
			}
		}
	}

	/// Resolve an awaited request. A response for an unknown or already
	/// timed-out `requestId` is discarded silently (expected under timeout
	/// races).
	fn resolve(&self, request_id: RequestId, frame: &InboundFrame) {
		let Some(entry) = self.inner.state.lock().awaited.remove(&request_id) else {
			return;
		};
		entry.deadline.abort();

		if let Some(status) = frame.status()
			&& status.is_failure()
		{
			metrics::counter!("castbridge_commands_failed_total").increment(1);
			warn!(
				command = entry.frame.command_line(),
				code = status.code,
				message = status.message.as_deref().unwrap_or("no status message provided"),
				"command rejected by control peer"
			);
		} else {
			metrics::counter!("castbridge_commands_resolved_total").increment(1);
		}

		self.drain();
	}

	/// Deadline elapsed with no matching response: abandon the request and
	/// free one unit of in-flight capacity. The command is not retried.
	fn on_deadline(&self, request_id: RequestId) {
		let Some(entry) = self.inner.state.lock().awaited.remove(&request_id) else {
			// Already resolved; the abort raced the timer firing.
			return;
		};

		metrics::counter!("castbridge_commands_timed_out_total").increment(1);
		warn!(
			%request_id,
			command = entry.frame.command_line(),
			"command timed out waiting for a response"
		);

		self.drain();
	}

	/// Cancel every awaited deadline and empty the table.
	///
	/// The single cancellation path used by teardown so no timer outlives
	/// `close_all` on the registry.
	pub fn clear_awaited(&self) {
		let entries: Vec<AwaitedEntry> = {
			let mut state = self.inner.state.lock();
			state.awaited.drain().map(|(_, entry)| entry).collect()
		};

		for entry in &entries {
			entry.deadline.abort();
		}

		if !entries.is_empty() {
			debug!(count = entries.len(), "cleared awaited command table");
		}
	}

	/// Queued (not yet transmitted) request count.
	pub fn pending_len(&self) -> usize {
		self.inner.state.lock().pending.len()
	}

	/// In-flight request count.
	pub fn awaited_len(&self) -> usize {
		self.inner.state.lock().awaited.len()
	}

	/// Whether `request_id` is currently awaited.
	pub fn is_awaited(&self, request_id: RequestId) -> bool {
		self.inner.state.lock().awaited.contains_key(&request_id)
	}
}
