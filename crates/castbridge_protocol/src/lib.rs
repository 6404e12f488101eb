#![forbid(unsafe_code)]

pub mod frames;

pub use frames::{
	CommandRequestFrame, CommandStatus, FrameKind, InboundFrame, ProtocolError, PURPOSE_COMMAND_REQUEST,
	PURPOSE_COMMAND_RESPONSE, PURPOSE_EVENT, PURPOSE_SUBSCRIBE, SubscribeFrame,
};

/// Protocol version constants.
pub mod version {
	/// Header/body version tag carried by v1 command frames.
	pub const PROTOCOL_VERSION: u32 = 1;
}
