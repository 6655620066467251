//! # Duplex Wire Signals
//!
//! JSON text frames exchanged with the telephony media stream.
//!
//! ## Inbound events:
//! - `connected`: stream opened, carries nothing the bridge needs
//! - `start`: call metadata, declared media format and custom parameters
//! - `media`: one 20ms chunk of base64 μ-law audio
//! - `mark` / `dtmf`: acknowledged and ignored
//! - `stop`: the caller side is done
//!
//! Anything else still parses (as [`InboundSignal::Unknown`]) so a new event
//! type from the provider never ends a call.
//!
//! ## Outbound:
//! ```json
//! {"event":"media","streamSid":"MZ...","media":{"payload":"//8A..."}}
//! ```

use crate::audio::frame::{AudioEncoding, WireFormat};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Display name of the participant representing the caller.
pub const CALLER_DISPLAY_NAME: &str = "Phone Caller";

/// One inbound event from the duplex stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundSignal {
    Connected,
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartInfo,
    },
    Media {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<SequenceNumber>,
        media: MediaInfo,
    },
    Mark,
    Dtmf,
    Stop,
    #[serde(other)]
    Unknown,
}

impl InboundSignal {
    /// Event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            InboundSignal::Connected => "connected",
            InboundSignal::Start { .. } => "start",
            InboundSignal::Media { .. } => "media",
            InboundSignal::Mark => "mark",
            InboundSignal::Dtmf => "dtmf",
            InboundSignal::Stop => "stop",
            InboundSignal::Unknown => "unknown",
        }
    }
}

/// Providers send sequence numbers as strings; accept plain numbers too.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SequenceNumber {
    Text(String),
    Number(u64),
}

impl SequenceNumber {
    pub fn value(&self) -> Option<u64> {
        match self {
            SequenceNumber::Text(text) => text.parse().ok(),
            SequenceNumber::Number(number) => Some(*number),
        }
    }
}

/// Body of a `start` event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: CustomParameters,
}

/// Format the provider says it will send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl MediaFormat {
    /// Whether the declared format is the one this bridge decodes.
    pub fn matches(&self, expected: &WireFormat) -> bool {
        AudioEncoding::from_mime(&self.encoding) == Some(expected.encoding)
            && self.sample_rate == expected.sample_rate
            && self.channels == expected.channels
    }
}

/// Parameters attached by the call-setup step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomParameters {
    #[serde(rename = "roomName", default)]
    pub room_name: Option<String>,
    #[serde(rename = "fromNumber", default)]
    pub from_number: Option<String>,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
}

/// Body of a `media` event.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
}

/// Who a call is, where it goes, and the stream to answer on.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMetadata {
    pub call_sid: String,
    pub stream_sid: String,
    pub room_name: String,
    pub identity: String,
    pub display_name: String,
}

/// Resolve call metadata from a `start` event.
///
/// ## Fallbacks:
/// - call id: `start.callSid`, then `customParameters.callSid`
/// - stream id: top-level `streamSid`, then `start.streamSid`
/// - room: `customParameters.roomName`, then `<room_prefix><callSid>`
/// - identity: `<identity_prefix><fromNumber>`, then `<identity_prefix><callSid>`
pub fn resolve_call(
    stream_sid: Option<&str>,
    start: &StartInfo,
    bridge: &BridgeConfig,
) -> BridgeResult<CallMetadata> {
    let params = &start.custom_parameters;

    let call_sid = non_empty(start.call_sid.as_deref())
        .or_else(|| non_empty(params.call_sid.as_deref()))
        .ok_or_else(|| BridgeError::Protocol("start event has no callSid".to_string()))?;

    let stream_sid = non_empty(stream_sid)
        .or_else(|| non_empty(start.stream_sid.as_deref()))
        .ok_or_else(|| BridgeError::Protocol("start event has no streamSid".to_string()))?;

    let room_name = non_empty(params.room_name.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}{}", bridge.room_prefix, call_sid));

    let caller = non_empty(params.from_number.as_deref()).unwrap_or(call_sid);

    Ok(CallMetadata {
        call_sid: call_sid.to_string(),
        stream_sid: stream_sid.to_string(),
        room_name,
        identity: format!("{}{}", bridge.identity_prefix, caller),
        display_name: CALLER_DISPLAY_NAME.to_string(),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Parse one text frame.
pub fn parse_signal(text: &str) -> BridgeResult<InboundSignal> {
    Ok(serde_json::from_str(text)?)
}

/// One outbound event written to the duplex stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundSignal {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundSignal {
    pub fn media(stream_sid: impl Into<String>, payload: String) -> Self {
        OutboundSignal::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia { payload },
        }
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    const START: &str = r#"{
        "event": "start",
        "sequenceNumber": "1",
        "start": {
            "accountSid": "AC123",
            "streamSid": "MZ123",
            "callSid": "CA1",
            "tracks": ["inbound"],
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
            "customParameters": {"roomName": "call-CA1", "fromNumber": "+15550100"}
        },
        "streamSid": "MZ123"
    }"#;

    #[test]
    fn test_parse_start() {
        let signal = parse_signal(START).unwrap();
        let InboundSignal::Start { stream_sid, start } = signal else {
            panic!("expected start");
        };

        let bridge = AppConfig::default().bridge;
        let call = resolve_call(stream_sid.as_deref(), &start, &bridge).unwrap();
        assert_eq!(call.call_sid, "CA1");
        assert_eq!(call.stream_sid, "MZ123");
        assert_eq!(call.room_name, "call-CA1");
        assert_eq!(call.identity, "phone-+15550100");
        assert_eq!(call.display_name, "Phone Caller");

        let format = start.media_format.unwrap();
        assert!(format.matches(&AppConfig::default().wire_format()));
    }

    #[test]
    fn test_resolve_fallbacks() {
        let start = StartInfo {
            stream_sid: Some("MZ9".to_string()),
            custom_parameters: CustomParameters {
                call_sid: Some("CA9".to_string()),
                room_name: Some("  ".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let call = resolve_call(None, &start, &AppConfig::default().bridge).unwrap();
        assert_eq!(call.stream_sid, "MZ9");
        assert_eq!(call.room_name, "call-CA9");
        assert_eq!(call.identity, "phone-CA9");

        let err = resolve_call(Some("MZ9"), &StartInfo::default(), &AppConfig::default().bridge);
        assert!(matches!(err, Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_parse_media_and_control_events() {
        let media = parse_signal(
            r#"{"event":"media","sequenceNumber":"3","streamSid":"MZ123",
                "media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"//8="}}"#,
        )
        .unwrap();
        match media {
            InboundSignal::Media { sequence_number, media } => {
                assert_eq!(sequence_number.and_then(|s| s.value()), Some(3));
                assert_eq!(media.payload, "//8=");
            }
            other => panic!("expected media, got {:?}", other),
        }

        assert!(matches!(
            parse_signal(r#"{"event":"stop","streamSid":"MZ123","stop":{"callSid":"CA1"}}"#),
            Ok(InboundSignal::Stop)
        ));
        assert!(matches!(
            parse_signal(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#),
            Ok(InboundSignal::Connected)
        ));
        assert!(matches!(
            parse_signal(r#"{"event":"mark","mark":{"name":"greeting"}}"#),
            Ok(InboundSignal::Mark)
        ));
        assert!(matches!(
            parse_signal(r#"{"event":"something-new"}"#),
            Ok(InboundSignal::Unknown)
        ));
    }

    #[test]
    fn test_malformed_signals_are_protocol_errors() {
        for text in ["not json", r#"{"event":"media"}"#, r#"{"no_event":1}"#] {
            assert!(matches!(parse_signal(text), Err(BridgeError::Protocol(_))), "{}", text);
        }
    }

    #[test]
    fn test_outbound_media_shape() {
        let json = OutboundSignal::media("MZ123", "//8=".to_string()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"event": "media", "streamSid": "MZ123", "media": {"payload": "//8="}})
        );
    }

    #[test]
    fn test_mismatched_format() {
        let format = MediaFormat {
            encoding: "audio/x-mulaw".to_string(),
            sample_rate: 16000,
            channels: 1,
        };
        assert!(!format.matches(&AppConfig::default().wire_format()));
    }
}
