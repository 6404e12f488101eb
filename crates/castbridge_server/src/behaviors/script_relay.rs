#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use castbridge_domain::ScriptEventId;
use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use crate::behaviors::BehaviorModule;
use crate::server::relay::Relay;

/// Forwards platform events to the control peer as `scriptevent`
/// commands under a configurable namespace.
///
/// Policies carried over from the original addon integration: follows
/// are deduplicated per viewer for the session, and streak gifts only
/// fire on the final (`repeatEnd`) event of a streak.
pub struct ScriptRelay {
	namespace: String,
}

impl ScriptRelay {
	pub fn new(namespace: impl Into<String>) -> Self {
		Self {
			namespace: namespace.into(),
		}
	}

	fn event_id(&self, name: &str) -> Option<ScriptEventId> {
		match ScriptEventId::new(format!("{}:{name}", self.namespace)) {
			Ok(id) => Some(id),
			Err(e) => {
				warn!(namespace = %self.namespace, error = %e, "invalid script event namespace");
				None
			}
		}
	}
}

impl BehaviorModule for ScriptRelay {
	fn name(&self) -> &'static str {
		"script_relay"
	}

	fn attach(&self, relay: &Arc<Relay>) {
		let (
			Some(connected_id),
			Some(join_id),
			Some(follow_id),
			Some(chat_id),
			Some(like_id),
			Some(gift_id),
			Some(share_id),
		) = (
			self.event_id("connected"),
			self.event_id("join"),
			self.event_id("follow"),
			self.event_id("chat"),
			self.event_id("like"),
			self.event_id("gift"),
			self.event_id("share"),
		)
		else {
			return;
		};

		{
			let channel = relay.channel().clone();
			let username = relay.username().clone();
			relay.on_peer_connected(move |_| {
				channel.send_command(r#"tellraw @a {"rawtext":[{"text":"§a§lLive relay connected§r§f!"}]}"#);
				let payload = json!({ "username": username.as_str() }).to_string();
				channel.send_script_event(&connected_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			relay.on_join(move |ev| {
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
				})
				.to_string();
				channel.send_script_event(&join_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			let seen_followers: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
			relay.on_follow(move |ev| {
				if !seen_followers.lock().insert(ev.viewer.unique_id.clone()) {
					return;
				}
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
				})
				.to_string();
				channel.send_script_event(&follow_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			relay.on_chat(move |ev| {
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
					"comment": ev.comment,
				})
				.to_string();
				channel.send_script_event(&chat_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			relay.on_like(move |ev| {
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
					"count": ev.like_count,
					"totalLikes": ev.total_like_count,
				})
				.to_string();
				channel.send_script_event(&like_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			relay.on_gift(move |ev| {
				// Streak ticks are suppressed; only the final event of a
				// streak reaches the peer.
				if ev.is_streak_in_progress() {
					return;
				}
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
					"giftName": ev.gift_name,
					"giftId": ev.gift_id,
					"giftCount": ev.repeat_count,
					"giftType": ev.gift_type,
				})
				.to_string();
				channel.send_script_event(&gift_id, &payload);
			});
		}

		{
			let channel = relay.channel().clone();
			relay.on_share(move |ev| {
				let payload = json!({
					"uniqueId": ev.viewer.unique_id,
					"nickname": ev.viewer.nickname,
				})
				.to_string();
				channel.send_script_event(&share_id, &payload);
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use castbridge_domain::{ConnectionId, Username};
	use castbridge_platform::{FollowEvent, GiftEvent, PlatformEvent, Viewer};
	use tokio::sync::mpsc;
	use tokio_tungstenite::tungstenite::Message;

	use super::*;
	use crate::server::bus::{BusEvent, EventBus};
	use crate::server::command::{CommandChannel, CommandChannelConfig};
	use crate::server::registry::{ConnectionHandle, ConnectionRegistry};
	use crate::server::relay::{Relay, RelaySettings};

	fn relay_with_peer() -> (Arc<Relay>, mpsc::UnboundedReceiver<Message>) {
		let registry = Arc::new(ConnectionRegistry::new());
		let bus = Arc::new(EventBus::new());
		let channel = CommandChannel::new(
			CommandChannelConfig::default(),
			Arc::clone(&registry),
			Arc::clone(&bus),
		);

		let (tx, rx) = mpsc::unbounded_channel();
		registry.add(ConnectionHandle::new(ConnectionId::new(), tx));

		let relay = Arc::new(Relay::new(
			RelaySettings::new(Username::new("demo_streamer").unwrap()),
			registry,
			bus,
			channel,
		));
		(relay, rx)
	}

	fn sent_command_lines(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
		let mut lines = Vec::new();
		while let Ok(Message::Text(text)) = rx.try_recv() {
			let v: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
			lines.push(v["body"]["commandLine"].as_str().unwrap().to_string());
		}
		lines
	}

	fn follow(unique_id: &str) -> BusEvent {
		BusEvent::Platform(PlatformEvent::Follow(FollowEvent {
			viewer: Viewer::new(unique_id, "Viewer"),
		}))
	}

	fn gift(repeat_end: bool) -> BusEvent {
		BusEvent::Platform(PlatformEvent::Gift(GiftEvent {
			viewer: Viewer::new("viewer1", "Viewer One"),
			gift_id: 5655,
			gift_name: "Rose".to_string(),
			gift_type: 1,
			repeat_count: 3,
			repeat_end,
			group_id: Some("streak-1".to_string()),
		}))
	}

	#[tokio::test]
	async fn repeat_follows_from_one_viewer_fire_once() {
		let (relay, mut rx) = relay_with_peer();
		ScriptRelay::new("bridge").attach(&relay);

		relay.bus().publish(follow("viewer1"));
		relay.bus().publish(follow("viewer1"));
		relay.bus().publish(follow("viewer2"));

		let lines = sent_command_lines(&mut rx);
		let follows: Vec<&String> = lines.iter().filter(|l| l.starts_with("scriptevent bridge:follow")).collect();
		assert_eq!(follows.len(), 2);
	}

	#[tokio::test]
	async fn streak_ticks_are_suppressed_until_repeat_end() {
		let (relay, mut rx) = relay_with_peer();
		ScriptRelay::new("bridge").attach(&relay);

		relay.bus().publish(gift(false));
		relay.bus().publish(gift(false));
		relay.bus().publish(gift(true));

		let lines = sent_command_lines(&mut rx);
		let gifts: Vec<&String> = lines.iter().filter(|l| l.starts_with("scriptevent bridge:gift")).collect();
		assert_eq!(gifts.len(), 1);
		assert!(gifts[0].contains(r#""giftCount":3"#));
	}

	#[tokio::test]
	async fn peer_connect_sends_banner_and_connected_event() {
		let (relay, mut rx) = relay_with_peer();
		ScriptRelay::new("bridge").attach(&relay);

		relay.bus().publish(BusEvent::PeerConnected { id: ConnectionId::new() });

		let lines = sent_command_lines(&mut rx);
		assert!(lines[0].starts_with("tellraw @a"));
		assert!(lines[1].starts_with("scriptevent bridge:connected "));
		assert!(lines[1].contains("demo_streamer"));
	}
}
