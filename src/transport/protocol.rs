//! Control-message contract for the duplex speech endpoint.
//!
//! One JSON object per text frame, tagged by `type`. The engine depends only
//! on this generic contract, not on any specific vendor's wire format.

use serde::{Deserialize, Serialize};

/// Server error codes that are logged and ignored: the operation that
/// triggered them is harmlessly redundant and session state is unchanged.
const RECOVERABLE_ERROR_CODES: &[&str] =
    &["input_audio_buffer_commit_empty", "response_already_active"];

/// Client-to-server control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Append a base64 PCM16 audio segment to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    /// Commit the buffered input as one complete utterance.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    /// Heartbeat keeping idle connections alive.
    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Server-to-client control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session established; the client may start sending audio.
    #[serde(rename = "session.ready")]
    SessionReady,

    /// Server-side VAD detected the user's speech starting.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Server-side VAD detected the user's speech stopping.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// Inline transcription of the user's committed utterance.
    #[serde(rename = "input_audio_buffer.transcript")]
    InputTranscript { transcript: String },

    /// One base64 PCM16 segment of assistant audio.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Assistant audio for this turn is complete.
    #[serde(rename = "response.audio.done")]
    AudioDone,

    /// One text segment of the assistant's transcript.
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    /// The assistant's transcript for this turn is complete.
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },

    /// Server-reported error.
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Any event type this engine does not consume. Skipped, never fatal.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// True for server errors that are logged and ignored rather than
    /// surfaced to the host.
    pub fn is_recoverable_error(code: &str) -> bool {
        RECOVERABLE_ERROR_CODES.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ClientEvent tests

    #[test]
    fn test_append_json_roundtrip() {
        let event = ClientEvent::InputAudioAppend {
            audio: "AAECAw==".to_string(),
        };
        let json = event.to_json().expect("should serialize");
        let deserialized = ClientEvent::from_json(&json).expect("should deserialize");
        assert_eq!(event, deserialized);
    }

    #[test]
    fn test_client_event_wire_names() {
        let append = ClientEvent::InputAudioAppend {
            audio: "xx".to_string(),
        }
        .to_json()
        .unwrap();
        assert!(
            append.contains(r#""type":"input_audio_buffer.append""#),
            "got: {}",
            append
        );
        assert!(append.contains(r#""audio":"xx""#));

        let commit = ClientEvent::InputAudioCommit.to_json().unwrap();
        assert_eq!(commit, r#"{"type":"input_audio_buffer.commit"}"#);

        let ping = ClientEvent::Ping.to_json().unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_client_all_variants_roundtrip() {
        let events = vec![
            ClientEvent::InputAudioAppend {
                audio: "abc".to_string(),
            },
            ClientEvent::InputAudioCommit,
            ClientEvent::Ping,
        ];
        for event in events {
            let json = event.to_json().expect("should serialize");
            let deserialized = ClientEvent::from_json(&json).expect("should deserialize");
            assert_eq!(event, deserialized, "roundtrip failed for {:?}", event);
        }
    }

    // ServerEvent tests

    #[test]
    fn test_server_all_variants_roundtrip() {
        let events = vec![
            ServerEvent::SessionReady,
            ServerEvent::SpeechStarted,
            ServerEvent::SpeechStopped,
            ServerEvent::InputTranscript {
                transcript: "hello there".to_string(),
            },
            ServerEvent::AudioDelta {
                delta: "AAEC".to_string(),
            },
            ServerEvent::AudioDone,
            ServerEvent::TranscriptDelta {
                delta: "Hi".to_string(),
            },
            ServerEvent::TranscriptDone {
                transcript: "Hi there".to_string(),
            },
            ServerEvent::Error {
                code: "bad_request".to_string(),
                message: "malformed audio".to_string(),
            },
        ];
        for event in events {
            let json = event.to_json().expect("should serialize");
            let deserialized = ServerEvent::from_json(&json).expect("should deserialize");
            assert_eq!(event, deserialized, "roundtrip failed for {:?}", event);
        }
    }

    #[test]
    fn test_server_event_wire_names() {
        let json = r#"{"type":"session.ready"}"#;
        assert_eq!(ServerEvent::from_json(json).unwrap(), ServerEvent::SessionReady);

        let json = r#"{"type":"input_audio_buffer.speech_started"}"#;
        assert_eq!(ServerEvent::from_json(json).unwrap(), ServerEvent::SpeechStarted);

        let json = r#"{"type":"response.audio.delta","delta":"UENN"}"#;
        assert_eq!(
            ServerEvent::from_json(json).unwrap(),
            ServerEvent::AudioDelta {
                delta: "UENN".to_string()
            }
        );

        let json = r#"{"type":"response.audio_transcript.done","transcript":"done"}"#;
        assert_eq!(
            ServerEvent::from_json(json).unwrap(),
            ServerEvent::TranscriptDone {
                transcript: "done".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_server_event_is_skippable_not_fatal() {
        let json = r#"{"type":"rate_limits.updated","limits":[]}"#;
        assert_eq!(ServerEvent::from_json(json).unwrap(), ServerEvent::Unknown);
    }

    #[test]
    fn test_error_event_parses_code_and_message() {
        let json = r#"{"type":"error","code":"session_expired","message":"token expired"}"#;
        match ServerEvent::from_json(json).unwrap() {
            ServerEvent::Error { code, message } => {
                assert_eq!(code, "session_expired");
                assert_eq!(message, "token expired");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recoverable_error_classification() {
        assert!(ServerEvent::is_recoverable_error(
            "input_audio_buffer_commit_empty"
        ));
        assert!(ServerEvent::is_recoverable_error("response_already_active"));
        assert!(!ServerEvent::is_recoverable_error("session_expired"));
        assert!(!ServerEvent::is_recoverable_error(""));
    }

    #[test]
    fn test_malformed_json_returns_error() {
        assert!(ServerEvent::from_json("not json at all").is_err());
        assert!(ClientEvent::from_json(r#"{"no_type": true}"#).is_err());
    }

    #[test]
    fn test_transcript_with_special_chars_roundtrip() {
        let event = ServerEvent::TranscriptDone {
            transcript: r#"He said "hi" — then left"#.to_string(),
        };
        let json = event.to_json().expect("should serialize");
        assert_eq!(ServerEvent::from_json(&json).unwrap(), event);
    }
}
