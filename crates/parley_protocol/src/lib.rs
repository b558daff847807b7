#![forbid(unsafe_code)]

pub mod frame;

pub use frame::{DEFAULT_MAX_MESSAGE_BYTES, DeliveryFrame, FrameError, InboundChatFrame};

/// WebSocket endpoint constants.
pub mod endpoint {
	/// Path of the real-time chat endpoint.
	pub const CHAT_PATH: &str = "/ws/chat";

	/// Query parameter carrying the bearer token on the upgrade request.
	pub const TOKEN_QUERY_PARAM: &str = "token";
}
