#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value contains whitespace: {0}")]
	ContainsWhitespace(String),
	#[error("invalid uuid: {0}")]
	InvalidUuid(String),
}

/// Correlation id carried by every outbound command request and echoed
/// back in its command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
	/// Fresh random id (UUID v4).
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub const fn from_uuid(id: Uuid) -> Self {
		Self(id)
	}

	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for RequestId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl FromStr for RequestId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Uuid::parse_str(s).map(Self).map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
	}
}

/// Identifier for one registered control-channel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub const fn from_uuid(id: Uuid) -> Self {
		Self(id)
	}
}

impl Default for ConnectionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Script event identifier (`namespace:name`) embedded in a `scriptevent`
/// command line. Must be non-empty and whitespace-free, otherwise the
/// command line would not parse on the peer side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptEventId(String);

impl ScriptEventId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.chars().any(char::is_whitespace) {
			return Err(ParseIdError::ContainsWhitespace(id));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ScriptEventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ScriptEventId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ScriptEventId::new(s.to_string())
	}
}

/// Streaming-platform account name the relay ingests from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username`. A leading `@` is stripped.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let name = name.trim().trim_start_matches('@');
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_id_parse_roundtrip() {
		let id = RequestId::new();
		let parsed: RequestId = id.to_string().parse().unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn request_id_rejects_garbage() {
		assert_eq!("".parse::<RequestId>(), Err(ParseIdError::Empty));
		assert!(matches!(
			"not-a-uuid".parse::<RequestId>(),
			Err(ParseIdError::InvalidUuid(_))
		));
	}

	#[test]
	fn script_event_id_rejects_whitespace() {
		assert!(ScriptEventId::new("bridge:join").is_ok());
		assert!(ScriptEventId::new("").is_err());
		assert!(matches!(
			ScriptEventId::new("bridge: join"),
			Err(ParseIdError::ContainsWhitespace(_))
		));
	}

	#[test]
	fn username_strips_at_sign() {
		let u = Username::new("@streamer").unwrap();
		assert_eq!(u.as_str(), "streamer");
		assert!(Username::new("  @ ").is_err());
	}
}
