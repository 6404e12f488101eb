#![forbid(unsafe_code)]

use castbridge_domain::ConnectionId;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::server::registry::{ConnectionHandle, ConnectionRegistry};

fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(ConnectionHandle::new(ConnectionId::new(), tx), rx)
}

#[test]
fn primary_is_first_registered_handle() {
	let registry = ConnectionRegistry::new();
	let (first, _rx1) = handle();
	let (second, _rx2) = handle();

	registry.add(first.clone());
	registry.add(second.clone());

	assert_eq!(registry.len(), 2);
	assert_eq!(registry.primary().map(|h| h.id()), Some(first.id()));
}

#[test]
fn primary_skips_dead_handles() {
	let registry = ConnectionRegistry::new();
	let (first, rx1) = handle();
	let (second, _rx2) = handle();

	registry.add(first);
	registry.add(second.clone());

	// Dropping the receiver simulates the writer task exiting.
	drop(rx1);

	assert_eq!(registry.primary().map(|h| h.id()), Some(second.id()));
}

#[test]
fn reused_id_displaces_and_closes_the_old_socket() {
	let registry = ConnectionRegistry::new();
	let (old, mut old_rx) = handle();
	let id = old.id();

	let (tx, _new_rx) = mpsc::unbounded_channel();
	let replacement = ConnectionHandle::new(id, tx);

	registry.add(old);
	registry.add(replacement);

	assert_eq!(registry.len(), 1);
	assert!(matches!(old_rx.try_recv(), Ok(Message::Close(_))));
}

#[test]
fn remove_closes_and_is_noop_for_unknown_ids() {
	let registry = ConnectionRegistry::new();
	let (h, mut rx) = handle();
	let id = h.id();

	registry.add(h);
	registry.remove(id);

	assert!(registry.is_empty());
	assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));

	// Absent id: nothing happens.
	registry.remove(ConnectionId::new());
	registry.remove(id);
}

#[test]
fn close_all_continues_past_dead_handles() {
	let registry = ConnectionRegistry::new();
	let (dead, dead_rx) = handle();
	let (alive, mut alive_rx) = handle();

	registry.add(dead);
	registry.add(alive);
	drop(dead_rx);

	registry.close_all();

	assert!(registry.is_empty());
	// The live handle still got its close frame.
	assert!(matches!(alive_rx.try_recv(), Ok(Message::Close(_))));
}

#[test]
fn broadcast_reaches_live_sockets_and_skips_dead_ones() {
	let registry = ConnectionRegistry::new();
	let (dead, dead_rx) = handle();
	let (alive, mut alive_rx) = handle();

	registry.add(dead);
	registry.add(alive);
	drop(dead_rx);

	registry.broadcast(r#"{"op":"notice"}"#);

	match alive_rx.try_recv() {
		Ok(Message::Text(text)) => assert_eq!(text.as_str(), r#"{"op":"notice"}"#),
		other => panic!("expected broadcast text frame, got {other:?}"),
	}
	// The dead handle did not abort the pass.
	assert_eq!(registry.len(), 2);
}

#[test]
fn send_text_fails_once_the_writer_is_gone() {
	let (h, rx) = handle();
	assert!(h.send_text("hello".to_string()).is_ok());
	drop(rx);
	assert!(h.send_text("hello".to_string()).is_err());
	assert!(h.is_closed());
	assert!(!h.ping());
}
