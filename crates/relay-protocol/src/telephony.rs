use serde::{Deserialize, Serialize};

/// Lifecycle/media frame on the telephony media-stream websocket.
///
/// Wire shape follows the common "media stream" convention: a JSON envelope
/// with an `event` discriminator; `media` events carry base64 µ-law audio in
/// `media.payload` alongside a monotonic `media.chunk` counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyFrame {
    Connected {
        #[serde(rename = "protocol")]
        protocol: String,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "callSid")]
        call_sid: String,
    },
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub chunk: u64,
    /// Base64-encoded 8kHz µ-law audio.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

impl TelephonyFrame {
    pub fn stream_sid(&self) -> Option<&str> {
        match self {
            TelephonyFrame::Start { stream_sid, .. }
            | TelephonyFrame::Media { stream_sid, .. }
            | TelephonyFrame::Mark { stream_sid, .. }
            | TelephonyFrame::Stop { stream_sid } => Some(stream_sid),
            TelephonyFrame::Connected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_frame() {
        let raw = r#"{"event":"media","streamSid":"MZ1","media":{"chunk":7,"payload":"AAAA"}}"#;
        let frame: TelephonyFrame = serde_json::from_str(raw).unwrap();
        match frame {
            TelephonyFrame::Media { stream_sid, media } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(media.chunk, 7);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
