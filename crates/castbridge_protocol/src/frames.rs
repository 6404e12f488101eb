#![forbid(unsafe_code)]

use castbridge_domain::RequestId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::PROTOCOL_VERSION;

pub const PURPOSE_COMMAND_REQUEST: &str = "commandRequest";
pub const PURPOSE_SUBSCRIBE: &str = "subscribe";
pub const PURPOSE_COMMAND_RESPONSE: &str = "commandResponse";
pub const PURPOSE_EVENT: &str = "event";

/// Message type shared by both outbound frame shapes (v1 wire quirk: the
/// subscribe frame also carries `messageType: "commandRequest"`).
const MESSAGE_TYPE_COMMAND_REQUEST: &str = "commandRequest";

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("invalid frame json: {0}")]
	Json(#[from] serde_json::Error),

	#[error("frame missing structural header")]
	MissingHeader,

	#[error("frame missing header.messagePurpose")]
	MissingPurpose,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct OutboundHeader {
	version: u32,
	request_id: RequestId,
	message_purpose: &'static str,
	message_type: &'static str,
}

impl OutboundHeader {
	fn new(purpose: &'static str) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			request_id: RequestId::new(),
			message_purpose: purpose,
			message_type: MESSAGE_TYPE_COMMAND_REQUEST,
		}
	}
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct CommandOrigin {
	#[serde(rename = "type")]
	origin_type: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct CommandRequestBody {
	version: u32,
	command_line: String,
	origin: CommandOrigin,
}

/// Outbound command request frame.
///
/// Immutable once built; the embedded `requestId` is the correlation key
/// for the matching command response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandRequestFrame {
	header: OutboundHeader,
	body: CommandRequestBody,
}

impl CommandRequestFrame {
	/// Build a request with a fresh `RequestId`.
	pub fn new(command_line: impl Into<String>) -> Self {
		Self {
			header: OutboundHeader::new(PURPOSE_COMMAND_REQUEST),
			body: CommandRequestBody {
				version: PROTOCOL_VERSION,
				command_line: command_line.into(),
				origin: CommandOrigin { origin_type: "player" },
			},
		}
	}

	pub fn request_id(&self) -> RequestId {
		self.header.request_id
	}

	pub fn command_line(&self) -> &str {
		&self.body.command_line
	}

	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
	event_name: String,
}

/// Outbound subscription request for a control-channel event name.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscribeFrame {
	header: OutboundHeader,
	body: SubscribeBody,
}

impl SubscribeFrame {
	pub fn new(event_name: impl Into<String>) -> Self {
		Self {
			header: OutboundHeader::new(PURPOSE_SUBSCRIBE),
			body: SubscribeBody {
				event_name: event_name.into(),
			},
		}
	}

	pub fn event_name(&self) -> &str {
		&self.body.event_name
	}

	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundHeader {
	#[serde(default)]
	request_id: Option<RequestId>,

	#[serde(default)]
	message_purpose: Option<String>,

	#[serde(default)]
	event_name: Option<String>,
}

/// Parsed inbound control-channel frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
	#[serde(default)]
	header: Option<InboundHeader>,

	#[serde(default)]
	body: serde_json::Value,
}

/// Classification of an inbound frame by `header.messagePurpose`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind<'a> {
	/// Control-protocol event notification.
	Event { name: &'a str },

	/// Response correlated to an earlier command request.
	CommandResponse { request_id: RequestId },

	/// Recognized structure, purpose this relay does not handle (also used
	/// for event/response frames missing their name/id field).
	Unknown { purpose: &'a str },
}

/// Command response status extracted from a frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
	pub code: i64,
	pub message: Option<String>,
}

impl CommandStatus {
	/// Negative status codes signal command failure.
	pub fn is_failure(&self) -> bool {
		self.code < 0
	}
}

impl InboundFrame {
	/// Parse a raw text frame.
	///
	/// Frames that are not JSON, lack a structural header, or lack
	/// `header.messagePurpose` are rejected; the caller drops them with a
	/// warning and keeps the connection open.
	pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
		let frame: InboundFrame = serde_json::from_str(raw)?;

		let Some(header) = frame.header.as_ref() else {
			return Err(ProtocolError::MissingHeader);
		};
		if header.message_purpose.as_deref().map(str::trim).filter(|p| !p.is_empty()).is_none() {
			return Err(ProtocolError::MissingPurpose);
		}

		Ok(frame)
	}

	/// The frame's `messagePurpose`. Present on every frame `parse` accepts.
	pub fn purpose(&self) -> &str {
		self.header
			.as_ref()
			.and_then(|h| h.message_purpose.as_deref())
			.unwrap_or_default()
	}

	/// Event name for `event` frames.
	pub fn event_name(&self) -> Option<&str> {
		self.header.as_ref().and_then(|h| h.event_name.as_deref())
	}

	/// Correlation id for `commandResponse` frames.
	pub fn request_id(&self) -> Option<RequestId> {
		self.header.as_ref().and_then(|h| h.request_id)
	}

	pub fn body(&self) -> &serde_json::Value {
		&self.body
	}

	/// Classify by purpose for relay dispatch.
	pub fn classify(&self) -> FrameKind<'_> {
		let purpose = self.purpose();
		match purpose {
			PURPOSE_EVENT => match self.event_name() {
				Some(name) => FrameKind::Event { name },
				None => FrameKind::Unknown { purpose },
			},
			PURPOSE_COMMAND_RESPONSE => match self.request_id() {
				Some(request_id) => FrameKind::CommandResponse { request_id },
				None => FrameKind::Unknown { purpose },
			},
			other => FrameKind::Unknown { purpose: other },
		}
	}

	/// Status code/message for command responses. `None` when the body
	/// carries no `statusCode`.
	pub fn status(&self) -> Option<CommandStatus> {
		let code = self.body.get("statusCode")?.as_i64()?;
		let message = self
			.body
			.get("statusMessage")
			.and_then(|m| m.as_str())
			.map(str::to_string);
		Some(CommandStatus { code, message })
	}
}
