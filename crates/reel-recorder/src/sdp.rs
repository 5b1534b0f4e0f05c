//! Session-description synthesis for the muxer's SDP inputs.
//!
//! One media section per file, built from the *consumer's* negotiated RTP
//! parameters: the SFU renumbers payload types on the consumer side, so the
//! producer's values would not match what actually arrives on the wire.

use std::fmt::Write;

use crate::sfu::RecordingCodec;

/// Render the session description for one recording input listening on
/// `port` (RTP) and `port + 1` (RTCP) on the loopback interface.
pub fn synthesize(codec: &RecordingCodec, port: u16) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\n");
    sdp.push_str("o=- 0 0 IN IP4 127.0.0.1\n");
    sdp.push_str("s=reel\n");
    sdp.push_str("c=IN IP4 127.0.0.1\n");
    sdp.push_str("t=0 0\n");

    match codec {
        RecordingCodec::Video {
            payload_type,
            name,
            clock_rate,
            fmtp,
        } => {
            let _ = writeln!(sdp, "m=video {port} RTP/AVP {payload_type}");
            let _ = writeln!(sdp, "a=rtpmap:{payload_type} {name}/{clock_rate}");
            let _ = writeln!(sdp, "a=rtcp:{} IN IP4 127.0.0.1", port + 1);
            if let Some(fmtp) = fmtp {
                let _ = writeln!(sdp, "a=fmtp:{payload_type} {fmtp}");
            }
            sdp.push_str("a=recvonly\n");
        }
        RecordingCodec::Audio {
            payload_type,
            name,
            clock_rate,
            channels,
            fmtp,
        } => {
            let _ = writeln!(sdp, "m=audio {port} RTP/AVP {payload_type}");
            let _ = writeln!(
                sdp,
                "a=rtpmap:{payload_type} {name}/{clock_rate}/{channels}"
            );
            let _ = writeln!(sdp, "a=rtcp:{} IN IP4 127.0.0.1", port + 1);
            if let Some(fmtp) = fmtp {
                let _ = writeln!(sdp, "a=fmtp:{payload_type} {fmtp}");
            }
            sdp.push_str("a=recvonly\n");
        }
    }

    sdp
}
