#![forbid(unsafe_code)]

pub mod demo;

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use demo::DemoFeed;

/// Viewer identity attached to every user-originated platform event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
	/// Stable platform handle (e.g. the `@name`).
	pub unique_id: String,
	/// Display name.
	pub nickname: String,
}

impl Viewer {
	pub fn new(unique_id: impl Into<String>, nickname: impl Into<String>) -> Self {
		Self {
			unique_id: unique_id.into(),
			nickname: nickname.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
	pub comment: String,
}

/// Gift event. Streak-capable gifts (`gift_type == 1`) are delivered once
/// per streak tick with `repeat_end == false` and a final summary event
/// with `repeat_end == true`; all ticks of one streak share a `group_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
	pub gift_id: u64,
	pub gift_name: String,
	pub gift_type: i32,
	pub repeat_count: u32,
	pub repeat_end: bool,
	#[serde(default)]
	pub group_id: Option<String>,
}

impl GiftEvent {
	/// Whether this event is a non-final tick of a gift streak.
	pub fn is_streak_in_progress(&self) -> bool {
		self.gift_type == 1 && !self.repeat_end
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
	pub like_count: u32,
	pub total_like_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
	#[serde(flatten)]
	pub viewer: Viewer,
}

/// Event emitted by the ingestion feed. Read-only to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlatformEvent {
	Chat(ChatEvent),
	Gift(GiftEvent),
	Like(LikeEvent),
	Follow(FollowEvent),
	Share(ShareEvent),
	Join(JoinEvent),

	/// Feed established its upstream connection.
	Connected,
	/// The live stream ended; the relay shuts down on this.
	StreamEnd,
	/// Feed lost its upstream connection.
	Disconnected,
}

impl PlatformEvent {
	/// Stable name, used in logs.
	pub const fn kind_str(&self) -> &'static str {
		match self {
			PlatformEvent::Chat(_) => "chat",
			PlatformEvent::Gift(_) => "gift",
			PlatformEvent::Like(_) => "like",
			PlatformEvent::Follow(_) => "follow",
			PlatformEvent::Share(_) => "share",
			PlatformEvent::Join(_) => "join",
			PlatformEvent::Connected => "connected",
			PlatformEvent::StreamEnd => "streamEnd",
			PlatformEvent::Disconnected => "disconnected",
		}
	}
}

impl fmt::Display for PlatformEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.kind_str())
	}
}

/// One entry of the platform's gift catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftInfo {
	pub id: u64,
	pub name: String,
	pub diamond_count: u32,
}

/// Relay → feed control message.
#[derive(Debug)]
pub enum FeedControl {
	/// Close the upstream connection and stop the feed task.
	Disconnect,

	/// Look up the platform's gift catalog.
	QueryGifts { resp: oneshot::Sender<Vec<GiftInfo>> },
}

#[derive(Debug, Error)]
pub enum FeedError {
	#[error("account is not live: {0}")]
	NotLive(String),

	#[error("feed transport error: {0}")]
	Transport(String),
}

pub type FeedControlRx = mpsc::Receiver<FeedControl>;
pub type FeedEventTx = mpsc::Sender<PlatformEvent>;

/// Ingestion-library boundary.
///
/// Implementations own the protocol-level connection to the streaming
/// service and emit `PlatformEvent`s until disconnected. The relay never
/// sees the underlying transport.
#[async_trait]
pub trait LiveFeed: Send {
	fn name(&self) -> &'static str;

	/// Connect and run until the stream ends, the control channel closes,
	/// or `FeedControl::Disconnect` arrives.
	async fn run(self: Box<Self>, control_rx: FeedControlRx, events_tx: FeedEventTx) -> Result<(), FeedError>;
}
