//! Duration probe run on finished output files.

use std::path::Path;

use tokio::process::Command;

/// Ask the external probe for the container duration in seconds. Returns
/// `None` when the probe fails or the file is unreadable; stop replies then
/// report the file without a duration rather than failing the stop.
pub async fn probe_duration(ffprobe: &str, file: &Path) -> Option<f64> {
    let output = Command::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(file)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("failed to run duration probe: {e}");
            return None;
        }
    };

    if !output.status.success() {
        tracing::warn!(
            file = %file.display(),
            "duration probe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    parse_duration(&output.stdout)
}

fn parse_duration(stdout: &[u8]) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    value
        .get("format")?
        .get("duration")?
        .as_str()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_json() {
        let stdout = br#"{ "format": { "duration": "12.483000" } }"#;
        assert_eq!(parse_duration(stdout), Some(12.483));
    }

    #[test]
    fn missing_duration_is_none() {
        assert_eq!(parse_duration(br#"{ "format": {} }"#), None);
        assert_eq!(parse_duration(b"not json"), None);
    }
}
