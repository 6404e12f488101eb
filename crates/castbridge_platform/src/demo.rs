#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::{
	ChatEvent, FeedControl, FeedControlRx, FeedError, FeedEventTx, GiftEvent, GiftInfo, JoinEvent, LikeEvent, LiveFeed,
	PlatformEvent, Viewer,
};

/// Scripted feed used for tests and dev runs without a live upstream.
pub struct DemoFeed {
	script: Vec<PlatformEvent>,
	gifts: Vec<GiftInfo>,
	emit_interval: Duration,
	end_stream_after_script: bool,
}

impl DemoFeed {
	pub fn new() -> Self {
		Self {
			script: Self::default_script(),
			gifts: Self::default_gifts(),
			emit_interval: Duration::from_millis(500),
			end_stream_after_script: false,
		}
	}

	/// Replace the scripted event sequence (useful for tests).
	pub fn with_script(mut self, script: Vec<PlatformEvent>) -> Self {
		self.script = script;
		self
	}

	pub fn with_gifts(mut self, gifts: Vec<GiftInfo>) -> Self {
		self.gifts = gifts;
		self
	}

	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}

	/// Emit `StreamEnd` once the script is exhausted instead of idling.
	pub fn with_stream_end_after_script(mut self) -> Self {
		self.end_stream_after_script = true;
		self
	}

	fn viewer(n: usize) -> Viewer {
		Viewer::new(format!("demo_viewer_{n}"), format!("Demo Viewer {n}"))
	}

	fn default_script() -> Vec<PlatformEvent> {
		vec![
			PlatformEvent::Join(JoinEvent { viewer: Self::viewer(1) }),
			PlatformEvent::Chat(ChatEvent {
				viewer: Self::viewer(1),
				comment: "hello from the demo feed".to_string(),
			}),
			PlatformEvent::Like(LikeEvent {
				viewer: Self::viewer(2),
				like_count: 15,
				total_like_count: 15,
			}),
			PlatformEvent::Gift(GiftEvent {
				viewer: Self::viewer(3),
				gift_id: 5655,
				gift_name: "Rose".to_string(),
				gift_type: 1,
				repeat_count: 2,
				repeat_end: false,
				group_id: Some("demo-streak-1".to_string()),
			}),
			PlatformEvent::Gift(GiftEvent {
				viewer: Self::viewer(3),
				gift_id: 5655,
				gift_name: "Rose".to_string(),
				gift_type: 1,
				repeat_count: 3,
				repeat_end: true,
				group_id: Some("demo-streak-1".to_string()),
			}),
		]
	}

	fn default_gifts() -> Vec<GiftInfo> {
		vec![
			GiftInfo {
				id: 5655,
				name: "Rose".to_string(),
				diamond_count: 1,
			},
			GiftInfo {
				id: 6064,
				name: "GG".to_string(),
				diamond_count: 1,
			},
			GiftInfo {
				id: 5269,
				name: "Galaxy".to_string(),
				diamond_count: 1000,
			},
		]
	}
}

impl Default for DemoFeed {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl LiveFeed for DemoFeed {
	fn name(&self) -> &'static str {
		"demo"
	}

	async fn run(self: Box<Self>, mut control_rx: FeedControlRx, events_tx: FeedEventTx) -> Result<(), FeedError> {
		let DemoFeed {
			script,
			gifts,
			emit_interval,
			end_stream_after_script,
		} = *self;

		let mut interval: Interval = tokio::time::interval(emit_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		let mut script = script.into_iter();
		let mut ended = false;

		info!(feed = "demo", events = script.len(), "demo feed started");

		if events_tx.send(PlatformEvent::Connected).await.is_err() {
			return Ok(());
		}

		loop {
			tokio::select! {
				_ = interval.tick() => {
					if ended {
						continue;
					}

					match script.next() {
						Some(ev) => {
							debug!(event = %ev, "demo feed emitting scripted event");
							if events_tx.send(ev).await.is_err() {
								warn!("demo feed events channel closed; stopping");
								break;
							}
						}
						None => {
							ended = true;
							if end_stream_after_script {
								let _ = events_tx.send(PlatformEvent::StreamEnd).await;
								break;
							}
						}
					}
				}

				ctrl = control_rx.recv() => {
					let Some(ctrl) = ctrl else {
						info!(feed = "demo", "control channel closed; stopping demo feed");
						break;
					};

					match ctrl {
						FeedControl::Disconnect => {
							info!(feed = "demo", "demo feed disconnecting");
							let _ = events_tx.send(PlatformEvent::Disconnected).await;
							break;
						}
						FeedControl::QueryGifts { resp } => {
							let _ = resp.send(gifts.clone());
						}
					}
				}
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::{mpsc, oneshot};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn emits_script_in_order_then_stream_end() {
		let feed = DemoFeed::new()
			.with_script(vec![
				PlatformEvent::Join(JoinEvent {
					viewer: Viewer::new("v", "V"),
				}),
				PlatformEvent::Chat(ChatEvent {
					viewer: Viewer::new("v", "V"),
					comment: "hi".to_string(),
				}),
			])
			.with_emit_interval(Duration::from_millis(10))
			.with_stream_end_after_script();

		let (_control_tx, control_rx) = mpsc::channel(4);
		let (events_tx, mut events_rx) = mpsc::channel(16);

		let task = tokio::spawn(Box::new(feed).run(control_rx, events_tx));

		assert_eq!(events_rx.recv().await, Some(PlatformEvent::Connected));
		assert!(matches!(events_rx.recv().await, Some(PlatformEvent::Join(_))));
		assert!(matches!(events_rx.recv().await, Some(PlatformEvent::Chat(_))));
		assert_eq!(events_rx.recv().await, Some(PlatformEvent::StreamEnd));
		assert_eq!(events_rx.recv().await, None);

		task.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn answers_gift_catalog_queries_and_disconnects() {
		let feed = DemoFeed::new().with_script(Vec::new());

		let (control_tx, control_rx) = mpsc::channel(4);
		let (events_tx, mut events_rx) = mpsc::channel(16);
		let task = tokio::spawn(Box::new(feed).run(control_rx, events_tx));

		assert_eq!(events_rx.recv().await, Some(PlatformEvent::Connected));

		let (resp_tx, resp_rx) = oneshot::channel();
		control_tx.send(FeedControl::QueryGifts { resp: resp_tx }).await.unwrap();
		let gifts = resp_rx.await.unwrap();
		assert!(gifts.iter().any(|g| g.name == "Rose"));

		control_tx.send(FeedControl::Disconnect).await.unwrap();
		assert_eq!(events_rx.recv().await, Some(PlatformEvent::Disconnected));

		task.await.unwrap().unwrap();
	}
}
