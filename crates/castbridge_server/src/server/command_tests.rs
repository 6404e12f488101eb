#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use castbridge_domain::{ConnectionId, RequestId, ScriptEventId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::server::bus::{BusEvent, EventBus, EventKind};
use crate::server::command::{CommandChannel, CommandChannelConfig};
use crate::server::registry::{ConnectionHandle, ConnectionRegistry};

fn fixture(max_in_flight: usize, command_timeout: Duration) -> (CommandChannel, Arc<ConnectionRegistry>, Arc<EventBus>) {
	let registry = Arc::new(ConnectionRegistry::new());
	let bus = Arc::new(EventBus::new());
	let channel = CommandChannel::new(
		CommandChannelConfig {
			max_in_flight,
			command_timeout,
		},
		Arc::clone(&registry),
		Arc::clone(&bus),
	);
	(channel, registry, bus)
}

fn connect_peer(registry: &ConnectionRegistry) -> mpsc::UnboundedReceiver<Message> {
	let (tx, rx) = mpsc::unbounded_channel();
	registry.add(ConnectionHandle::new(ConnectionId::new(), tx));
	rx
}

/// Pop the next transmitted text frame, parsed as JSON.
fn sent_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
	match rx.try_recv() {
		Ok(Message::Text(text)) => serde_json::from_str(text.as_str()).expect("sent frame is valid json"),
		other => panic!("expected a transmitted text frame, got {other:?}"),
	}
}

fn frame_request_id(frame: &serde_json::Value) -> RequestId {
	frame["header"]["requestId"]
		.as_str()
		.expect("frame carries a requestId")
		.parse()
		.expect("requestId is well formed")
}

fn response(request_id: RequestId, status_code: i64) -> String {
	serde_json::json!({
		"header": {
			"version": 1,
			"requestId": request_id.to_string(),
			"messagePurpose": "commandResponse",
		},
		"body": { "statusCode": status_code },
	})
	.to_string()
}

/// Let spawned deadline tasks run (paused-clock tests).
async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}

#[tokio::test]
async fn commands_queue_while_no_peer_is_connected() {
	let (channel, registry, _bus) = fixture(100, Duration::from_secs(5));

	channel.send_command("say one");
	channel.send_command("say two");

	assert_eq!(channel.pending_len(), 2);
	assert_eq!(channel.awaited_len(), 0);

	// The backlog flushes as soon as a peer appears.
	let mut rx = connect_peer(&registry);
	channel.drain();

	assert_eq!(channel.pending_len(), 0);
	assert_eq!(channel.awaited_len(), 2);
	assert_eq!(sent_frame(&mut rx)["body"]["commandLine"], "say one");
	assert_eq!(sent_frame(&mut rx)["body"]["commandLine"], "say two");
}

#[tokio::test]
async fn in_flight_cap_holds_back_excess_commands() {
	let (channel, registry, _bus) = fixture(2, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say one");
	channel.send_command("say two");
	channel.send_command("say three");

	assert_eq!(channel.awaited_len(), 2);
	assert_eq!(channel.pending_len(), 1);

	let first = sent_frame(&mut rx);
	let second = sent_frame(&mut rx);
	assert!(rx.try_recv().is_err(), "third command must not be transmitted at the cap");

	// Resolving one in-flight request frees capacity for the third.
	channel.on_message(&response(frame_request_id(&first), 0));

	assert_eq!(channel.awaited_len(), 2);
	assert_eq!(channel.pending_len(), 0);
	assert_eq!(sent_frame(&mut rx)["body"]["commandLine"], "say three");
	assert!(channel.is_awaited(frame_request_id(&second)));
	assert!(!channel.is_awaited(frame_request_id(&first)));
}

// Out-of-order responses: resolution is keyed by requestId, not send order.
#[tokio::test]
async fn responses_resolve_out_of_order() {
	let (channel, registry, _bus) = fixture(3, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say one");
	channel.send_command("say two");
	channel.send_command("say three");

	let ids: Vec<RequestId> = (0..3).map(|_| frame_request_id(&sent_frame(&mut rx))).collect();

	channel.on_message(&response(ids[2], 0));
	assert!(!channel.is_awaited(ids[2]));
	assert!(channel.is_awaited(ids[0]));
	assert!(channel.is_awaited(ids[1]));

	channel.on_message(&response(ids[0], 0));
	channel.on_message(&response(ids[1], 0));
	assert_eq!(channel.awaited_len(), 0);
}

#[tokio::test]
async fn duplicate_response_is_ignored() {
	let (channel, registry, _bus) = fixture(2, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say once");
	let id = frame_request_id(&sent_frame(&mut rx));

	channel.on_message(&response(id, 0));
	assert_eq!(channel.awaited_len(), 0);

	// Second response for the same id: silently discarded.
	channel.on_message(&response(id, 0));
	assert_eq!(channel.awaited_len(), 0);
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn response_for_unknown_request_id_is_discarded() {
	let (channel, registry, _bus) = fixture(2, Duration::from_secs(5));
	let _rx = connect_peer(&registry);

	channel.on_message(&response(RequestId::new(), 0));
	assert_eq!(channel.awaited_len(), 0);
	assert_eq!(channel.pending_len(), 0);
}

#[tokio::test]
async fn failure_status_still_resolves_the_request() {
	let (channel, registry, _bus) = fixture(2, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("sya typo");
	let id = frame_request_id(&sent_frame(&mut rx));

	channel.on_message(&response(id, -2147483648));

	// The failure is logged, not retried; capacity is freed either way.
	assert!(!channel.is_awaited(id));
	assert_eq!(channel.awaited_len(), 0);
}

#[tokio::test]
async fn malformed_frames_leave_state_untouched() {
	let (channel, registry, _bus) = fixture(2, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say hi");
	let _ = sent_frame(&mut rx);

	channel.on_message("not json at all");
	channel.on_message(r#"{"body":{"statusCode":0}}"#);
	channel.on_message(r#"{"header":{"messagePurpose":"telemetry"},"body":{}}"#);

	assert_eq!(channel.awaited_len(), 1);
	assert_eq!(channel.pending_len(), 0);
}

#[tokio::test]
async fn event_frames_reach_the_bus() {
	let (channel, registry, bus) = fixture(2, Duration::from_secs(5));
	let _rx = connect_peer(&registry);

	let seen = Arc::new(Mutex::new(Vec::new()));
	{
		let seen = Arc::clone(&seen);
		bus.subscribe(EventKind::Control("PlayerMessage".to_string()), move |ev| {
			if let BusEvent::Control { frame, .. } = ev {
				seen.lock().push(frame.body()["message"].as_str().unwrap_or_default().to_string());
			}
		});
	}

	channel.on_message(r#"{"header":{"eventName":"PlayerMessage","messagePurpose":"event"},"body":{"message":"hi"}}"#);

	assert_eq!(*seen.lock(), vec!["hi".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn timeout_abandons_the_request_and_frees_capacity() {
	let (channel, registry, _bus) = fixture(1, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say slow");
	channel.send_command("say next");

	let first = frame_request_id(&sent_frame(&mut rx));
	assert_eq!(channel.pending_len(), 1);

	tokio::time::sleep(Duration::from_millis(5_100)).await;
	settle().await;

	// The timed-out slot was handed to the queued command.
	assert!(!channel.is_awaited(first));
	assert_eq!(channel.pending_len(), 0);
	assert_eq!(sent_frame(&mut rx)["body"]["commandLine"], "say next");
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_silent() {
	let (channel, registry, _bus) = fixture(1, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say slow");
	let id = frame_request_id(&sent_frame(&mut rx));

	tokio::time::sleep(Duration::from_millis(5_100)).await;
	settle().await;
	assert!(!channel.is_awaited(id));

	// The peer answers after the deadline already fired; at-most-once
	// terminal transition, so nothing changes.
	channel.on_message(&response(id, 0));
	assert_eq!(channel.awaited_len(), 0);
	assert_eq!(channel.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn resolved_request_never_times_out() {
	let (channel, registry, _bus) = fixture(1, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say fast");
	let id = frame_request_id(&sent_frame(&mut rx));
	channel.on_message(&response(id, 0));

	tokio::time::sleep(Duration::from_secs(10)).await;
	settle().await;

	// The deadline timer was aborted at resolve time; nothing fired.
	assert_eq!(channel.awaited_len(), 0);
	assert_eq!(channel.pending_len(), 0);
}

#[tokio::test]
async fn clear_awaited_empties_the_table() {
	let (channel, registry, _bus) = fixture(4, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	channel.send_command("say one");
	channel.send_command("say two");
	let _ = sent_frame(&mut rx);
	let _ = sent_frame(&mut rx);
	assert_eq!(channel.awaited_len(), 2);

	channel.clear_awaited();
	assert_eq!(channel.awaited_len(), 0);
}

#[tokio::test]
async fn script_events_embed_namespace_and_payload() {
	let (channel, registry, _bus) = fixture(4, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	let event_id = ScriptEventId::new("bridge:chat").unwrap();
	channel.send_script_event(&event_id, r#"{"comment":"hello"}"#);

	let frame = sent_frame(&mut rx);
	assert_eq!(frame["body"]["commandLine"], r#"scriptevent bridge:chat {"comment":"hello"}"#);
	assert_eq!(frame["header"]["messagePurpose"], "commandRequest");
}

#[tokio::test]
async fn each_transmitted_frame_carries_a_unique_request_id() {
	let (channel, registry, _bus) = fixture(8, Duration::from_secs(5));
	let mut rx = connect_peer(&registry);

	for i in 0..5 {
		channel.send_command(format!("say {i}"));
	}

	let mut ids: Vec<RequestId> = (0..5).map(|_| frame_request_id(&sent_frame(&mut rx))).collect();
	ids.sort_by_key(|id| id.to_string());
	ids.dedup();
	assert_eq!(ids.len(), 5);
}
