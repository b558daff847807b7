use parley_domain::UserId;
use parley_protocol::{DeliveryFrame, FrameError, InboundChatFrame};
use proptest::prelude::*;

fn frame_json(receiver_id: i64, message: &str) -> String {
	serde_json::json!({ "receiver_id": receiver_id, "message": message }).to_string()
}

#[test]
fn delivery_frame_decodes_back_on_the_client_side() {
	let frame = DeliveryFrame::new(UserId::new(9), "hello there");
	let json = frame.to_json().expect("encode");

	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
	assert_eq!(value["sender_id"], 9);
	assert_eq!(value["content"], "hello there");
}

#[test]
fn empty_object_reports_receiver_first() {
	let err = InboundChatFrame::parse("{}").unwrap_err();
	assert!(matches!(err, FrameError::MissingField("receiver_id")), "unexpected: {err:?}");
}

#[test]
fn receiver_id_beyond_i64_is_rejected() {
	let err = InboundChatFrame::parse(r#"{"receiver_id": 18446744073709551615, "message": "x"}"#).unwrap_err();
	assert!(matches!(err, FrameError::InvalidReceiverId(_)), "unexpected: {err:?}");
}

proptest! {
	#[test]
	fn parse_never_panics_on_arbitrary_text(text in ".{0,256}") {
		let _ = InboundChatFrame::parse(&text);
	}

	#[test]
	fn any_i64_receiver_is_accepted(receiver_id in any::<i64>(), message in "[a-z]{1,16}") {
		let frame = InboundChatFrame::parse(&frame_json(receiver_id, &message)).expect("valid frame");
		prop_assert_eq!(frame.receiver_id, UserId::new(receiver_id));
		prop_assert_eq!(frame.trimmed_content(), Some(message.as_str()));
	}

	#[test]
	fn whitespace_only_messages_have_no_content(ws in "[ \t\r\n]{0,32}") {
		let frame = InboundChatFrame::parse(&frame_json(1, &ws)).expect("valid frame");
		prop_assert!(frame.trimmed_content().is_none());
	}

	#[test]
	fn trimmed_content_strips_only_the_edges(core in "[a-z][a-z ]{0,30}[a-z]", pad in "[ \t]{0,4}") {
		let padded = format!("{pad}{core}{pad}");
		let frame = InboundChatFrame::parse(&frame_json(3, &padded)).expect("valid frame");
		prop_assert_eq!(frame.trimmed_content(), Some(core.as_str()));
	}
}
