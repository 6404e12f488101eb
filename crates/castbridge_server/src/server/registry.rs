#![forbid(unsafe_code)]

use castbridge_domain::ConnectionId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, info, warn};

/// The socket's writer task has exited and the handle can no longer send.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("control socket writer closed")]
pub struct SocketClosed;

/// Writer handle for one control-channel socket.
///
/// The sink half of each websocket is owned by a single writer task; all
/// other components only ever hold this sending handle (single
/// writer-owner policy).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
	pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
		Self { id, tx }
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Queue a text frame for transmission.
	pub fn send_text(&self, payload: String) -> Result<(), SocketClosed> {
		self.tx.send(Message::text(payload)).map_err(|_| SocketClosed)
	}

	/// Queue a keepalive ping. Returns false when the writer is gone.
	pub fn ping(&self) -> bool {
		self.tx.send(Message::Ping(Bytes::new())).is_ok()
	}

	/// Answer a peer ping.
	pub fn pong(&self, payload: Bytes) -> bool {
		self.tx.send(Message::Pong(payload)).is_ok()
	}

	/// Queue a close frame. Idempotent: closing an already-closed handle
	/// is a no-op.
	pub fn close(&self) {
		let _ = self.tx.send(Message::Close(None));
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Registry of currently open control-channel sockets.
///
/// Insertion order is preserved so `primary()` is stable across calls
/// while the same peers stay connected.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	inner: Mutex<Vec<ConnectionHandle>>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a socket handle. A reused id displaces the previous entry;
	/// the displaced handle is closed rather than leaked.
	pub fn add(&self, handle: ConnectionHandle) {
		let id = handle.id();
		let displaced = {
			let mut conns = self.inner.lock();
			let displaced = match conns.iter_mut().find(|c| c.id() == id) {
				Some(slot) => Some(std::mem::replace(slot, handle)),
				None => {
					conns.push(handle);
					None
				}
			};
			displaced
		};

		if let Some(old) = displaced {
			warn!(%id, "connection id reused; closing displaced socket");
			old.close();
		}

		metrics::counter!("castbridge_connections_total").increment(1);
		info!(%id, "control connection registered");
	}

	/// Close and deregister a socket. No-op when `id` is absent.
	pub fn remove(&self, id: ConnectionId) {
		let removed = {
			let mut conns = self.inner.lock();
			conns
				.iter()
				.position(|c| c.id() == id)
				.map(|idx| conns.remove(idx))
		};

		match removed {
			Some(handle) => {
				handle.close();
				info!(%id, "control connection removed");
			}
			None => debug!(%id, "remove for unknown connection id"),
		}
	}

	/// Close and deregister every socket. A handle that fails to close is
	/// logged and the loop continues.
	pub fn close_all(&self) {
		let drained: Vec<ConnectionHandle> = {
			let mut conns = self.inner.lock();
			conns.drain(..).collect()
		};

		for handle in drained {
			if handle.is_closed() {
				debug!(id = %handle.id(), "socket already closed during close_all");
			}
			handle.close();
		}

		info!("all control connections closed");
	}

	/// Send a text frame to every registered socket. A write failure is
	/// logged and the loop continues.
	pub fn broadcast(&self, payload: &str) {
		for handle in self.list() {
			if let Err(e) = handle.send_text(payload.to_string()) {
				warn!(id = %handle.id(), error = %e, "broadcast write failed");
			}
		}
	}

	/// Stable snapshot of current entries.
	pub fn list(&self) -> Vec<ConnectionHandle> {
		self.inner.lock().clone()
	}

	/// The relay's single logical control peer: the first registered
	/// handle whose writer is still alive.
	pub fn primary(&self) -> Option<ConnectionHandle> {
		self.inner.lock().iter().find(|c| !c.is_closed()).cloned()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}
