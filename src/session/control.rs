// Client frame classification and the few frames the gateway emits itself.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::state::ControlEvent;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const CLOSING_FRAME: &str = "bye";

const ACTION_START: &str = "start";
const ACTION_STOP: &str = "stop";

// -----------------------------------------------------------------------------
// ----- Inbound ---------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlEvent),
    Audio(Bytes),
    Close,
    Ignored,
}

/// Text frames are control frames, binary frames are audio. Empty frames,
/// pings/pongs and malformed or unknown control frames are ignored.
pub fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) if text.is_empty() => Inbound::Ignored,
        Message::Text(text) => parse_control(&text).map_or(Inbound::Ignored, Inbound::Control),
        Message::Binary(data) if data.is_empty() => Inbound::Ignored,
        Message::Binary(data) => Inbound::Audio(Bytes::from(data)),
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Ignored,
    }
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(default)]
    action: String,
}

pub fn parse_control(text: &str) -> Option<ControlEvent> {
    let frame: ControlFrame = serde_json::from_str(text).ok()?;
    match frame.action.as_str() {
        ACTION_START => Some(ControlEvent::Start),
        ACTION_STOP => Some(ControlEvent::Stop),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// ----- Outbound --------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StateNotice {
    err_code: i32,
    state: &'static str,
}

pub fn listening_notice() -> Message {
    let notice = StateNotice {
        err_code: 0,
        state: "listening",
    };
    // Two plain fields; serializing cannot fail.
    Message::Text(serde_json::to_string(&notice).unwrap_or_default())
}

/// Backend replies go out as text when they are UTF-8, binary otherwise.
pub fn reply_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_actions() {
        assert_eq!(parse_control(r#"{"action":"start"}"#), Some(ControlEvent::Start));
        assert_eq!(
            parse_control(r#"{"action":"stop","reason":"eou"}"#),
            Some(ControlEvent::Stop)
        );
    }

    #[test]
    fn ignores_malformed_and_unknown_actions() {
        assert_eq!(parse_control("not json"), None);
        assert_eq!(parse_control(r#"{"action":"pause"}"#), None);
        assert_eq!(parse_control(r#"{"other":1}"#), None);
        assert_eq!(parse_control(r#"[1,2]"#), None);
    }

    #[test]
    fn classifies_frames() {
        assert_eq!(
            classify(Message::Text(r#"{"action":"start"}"#.into())),
            Inbound::Control(ControlEvent::Start)
        );
        assert_eq!(
            classify(Message::Binary(vec![1, 2, 3])),
            Inbound::Audio(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(classify(Message::Binary(Vec::new())), Inbound::Ignored);
        assert_eq!(classify(Message::Ping(vec![9])), Inbound::Ignored);
        assert_eq!(classify(Message::Close(None)), Inbound::Close);
    }

    #[test]
    fn listening_notice_shape() {
        let Message::Text(text) = listening_notice() else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["err_code"], 0);
        assert_eq!(value["state"], "listening");
    }

    #[test]
    fn replies_keep_their_bytes() {
        assert_eq!(
            reply_message(Bytes::from_static(b"{\"state\":\"result\"}")),
            Message::Text("{\"state\":\"result\"}".into())
        );
        assert_eq!(
            reply_message(Bytes::from_static(&[0xff, 0x00])),
            Message::Binary(vec![0xff, 0x00])
        );
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
