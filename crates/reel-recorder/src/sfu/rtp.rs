//! Typed RTP parameters, reduced to what the recorder consumes.

use std::collections::BTreeMap;
use std::fmt;

use reel_protocol::MediaKind;
use serde::{Deserialize, Serialize};

/// A codec-specific format parameter value as carried in `fmtp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Number(u32),
    String(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Number(n) => n.fmt(f),
            ParameterValue::String(s) => s.fmt(f),
        }
    }
}

/// One negotiated codec inside a producer's or consumer's RTP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// MIME media type/subtype, e.g. `video/VP8` or `audio/opus`.
    pub mime_type: String,
    pub payload_type: u8,
    /// Clock rate in Hertz.
    pub clock_rate: u32,
    /// Channel count; audio only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific parameters. Kept ordered so the derived `fmtp` string
    /// is deterministic.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl RtpCodecParameters {
    pub fn kind(&self) -> Option<MediaKind> {
        match self.mime_type.split('/').next() {
            Some(t) if t.eq_ignore_ascii_case("audio") => Some(MediaKind::Audio),
            Some(t) if t.eq_ignore_ascii_case("video") => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Codec name as it appears in an `a=rtpmap` line.
    pub fn name(&self) -> &str {
        self.mime_type.split('/').nth(1).unwrap_or(&self.mime_type)
    }

    /// Retransmission streams never feed the muxer.
    pub fn is_rtx(&self) -> bool {
        self.name().eq_ignore_ascii_case("rtx")
    }

    /// The `fmtp` attribute payload, `key=value` pairs joined by `;`.
    pub fn fmtp(&self) -> Option<String> {
        if self.parameters.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(pairs.join(";"))
    }
}

/// RTP parameters assigned to a consumer (or negotiated by a producer).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
}

/// One codec the recorder is able to receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// The codec set a consumer may be restricted to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    pub fn supports_mime(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// The superset of codecs the external muxer can ingest. Advertised to the
/// router when checking consumability and creating recording consumers.
pub fn recorder_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
            },
            RtpCodecCapability {
                mime_type: "audio/PCMU".to_string(),
                clock_rate: 8000,
                channels: Some(1),
            },
            RtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
            },
            RtpCodecCapability {
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: None,
            },
        ],
    }
}

/// The codec a recording input feeds to the muxer, extracted from the
/// consumer-assigned RTP parameters. Discriminated by kind so nothing past
/// the binder deals in stringly-typed media kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingCodec {
    Audio {
        payload_type: u8,
        name: String,
        clock_rate: u32,
        channels: u8,
        fmtp: Option<String>,
    },
    Video {
        payload_type: u8,
        name: String,
        clock_rate: u32,
        fmtp: Option<String>,
    },
}

impl RecordingCodec {
    /// Extract the first non-RTX codec of `kind` from consumer parameters.
    pub fn from_rtp_parameters(kind: MediaKind, params: &RtpParameters) -> Option<Self> {
        let codec = params
            .codecs
            .iter()
            .find(|c| !c.is_rtx() && c.kind() == Some(kind))?;

        Some(match kind {
            MediaKind::Audio => RecordingCodec::Audio {
                payload_type: codec.payload_type,
                name: codec.name().to_string(),
                clock_rate: codec.clock_rate,
                channels: codec.channels.unwrap_or(2),
                fmtp: codec.fmtp(),
            },
            MediaKind::Video => RecordingCodec::Video {
                payload_type: codec.payload_type,
                name: codec.name().to_string(),
                clock_rate: codec.clock_rate,
                fmtp: codec.fmtp(),
            },
        })
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            RecordingCodec::Audio { .. } => MediaKind::Audio,
            RecordingCodec::Video { .. } => MediaKind::Video,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            RecordingCodec::Audio { payload_type, .. }
            | RecordingCodec::Video { payload_type, .. } => *payload_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus(payload_type: u8) -> RtpCodecParameters {
        let mut parameters = BTreeMap::new();
        parameters.insert("minptime".to_string(), ParameterValue::Number(10));
        parameters.insert("useinbandfec".to_string(), ParameterValue::Number(1));
        RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type,
            clock_rate: 48000,
            channels: Some(2),
            parameters,
        }
    }

    #[test]
    fn fmtp_is_deterministic_key_value_list() {
        let codec = opus(100);
        assert_eq!(codec.fmtp().as_deref(), Some("minptime=10;useinbandfec=1"));
    }

    #[test]
    fn extraction_skips_rtx_and_takes_consumer_payload_type() {
        let params = RtpParameters {
            codecs: vec![
                RtpCodecParameters {
                    mime_type: "video/rtx".to_string(),
                    payload_type: 97,
                    clock_rate: 90000,
                    channels: None,
                    parameters: BTreeMap::new(),
                },
                RtpCodecParameters {
                    mime_type: "video/VP8".to_string(),
                    payload_type: 101,
                    clock_rate: 90000,
                    channels: None,
                    parameters: BTreeMap::new(),
                },
            ],
        };

        let codec = RecordingCodec::from_rtp_parameters(MediaKind::Video, &params).unwrap();
        assert_eq!(codec.payload_type(), 101);
        match codec {
            RecordingCodec::Video { name, .. } => assert_eq!(name, "VP8"),
            other => panic!("unexpected codec: {other:?}"),
        }
    }

    #[test]
    fn audio_channels_default_to_stereo() {
        let params = RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48000,
                channels: None,
                parameters: BTreeMap::new(),
            }],
        };

        match RecordingCodec::from_rtp_parameters(MediaKind::Audio, &params).unwrap() {
            RecordingCodec::Audio { channels, .. } => assert_eq!(channels, 2),
            other => panic!("unexpected codec: {other:?}"),
        }
    }

    #[test]
    fn extraction_respects_kind() {
        let params = RtpParameters {
            codecs: vec![opus(100)],
        };
        assert!(RecordingCodec::from_rtp_parameters(MediaKind::Video, &params).is_none());
    }
}
