//! Filter-graph construction for the mixed recording.
//!
//! Pure functions of the input counts and the target frame size, so the
//! exact expressions handed to the muxer can be snapshot-tested.

/// A complete `-filter_complex` expression plus the labels to `-map`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGraph {
    pub expr: String,
    pub video_label: Option<String>,
    pub audio_label: Option<String>,
}

/// Grid geometry: rows and columns for `video_inputs` tiles.
fn grid(video_inputs: usize) -> (u32, u32) {
    match video_inputs {
        1 => (1, 1),
        2 => (1, 2),
        _ => (2, 2),
    }
}

/// Build the tiling/mixing graph for a mixed recording.
///
/// Video inputs occupy muxer input indices `0..video_inputs`, audio inputs
/// the `video_inputs..video_inputs + audio_inputs` that follow; the argument
/// vector lists the SDP files in the same order. Each video stream is scaled
/// into its cell preserving aspect ratio, padded to the exact cell size,
/// normalized to `frame_rate` with square pixels and planar 4:2:0, then
/// stacked at fixed offsets. Audio is drift-compensated, summed when there
/// is more than one stream, and re-based to zero.
pub fn build_filter_graph(
    video_inputs: usize,
    audio_inputs: usize,
    width: u32,
    height: u32,
    frame_rate: u32,
) -> FilterGraph {
    assert!(video_inputs <= 4, "mixed recording tiles at most 4 videos");

    let mut parts: Vec<String> = Vec::new();
    let mut video_label = None;
    let mut audio_label = None;

    if video_inputs > 0 {
        let (rows, cols) = grid(video_inputs);
        let cell_w = width / cols;
        let cell_h = height / rows;

        let normalize = |out: &str, index: usize| {
            format!(
                "[{index}:v]scale={cell_w}:{cell_h}:force_original_aspect_ratio=decrease,\
                 pad={cell_w}:{cell_h}:(ow-iw)/2:(oh-ih)/2:black,\
                 fps={frame_rate},setsar=1,format=yuv420p[{out}]"
            )
        };

        if video_inputs == 1 {
            parts.push(normalize("vout", 0));
        } else {
            for index in 0..video_inputs {
                parts.push(normalize(&format!("v{index}"), index));
            }

            let layout: Vec<String> = (0..video_inputs)
                .map(|index| {
                    let col = index as u32 % cols;
                    let row = index as u32 / cols;
                    format!("{}_{}", col * cell_w, row * cell_h)
                })
                .collect();

            let stack_inputs: String = (0..video_inputs).map(|i| format!("[v{i}]")).collect();
            // A 3-tile layout leaves the fourth cell of the 2x2 grid empty.
            let fill = if video_inputs < (rows * cols) as usize {
                ":fill=black"
            } else {
                ""
            };
            parts.push(format!(
                "{stack_inputs}xstack=inputs={}:layout={}{fill}[vout]",
                video_inputs,
                layout.join("|")
            ));
        }

        video_label = Some("[vout]".to_string());
    }

    if audio_inputs > 0 {
        if audio_inputs == 1 {
            parts.push(format!(
                "[{video_inputs}:a]aresample=async=1,asetpts=PTS-STARTPTS[aout]"
            ));
        } else {
            for j in 0..audio_inputs {
                parts.push(format!("[{}:a]aresample=async=1[a{j}]", video_inputs + j));
            }
            let mix_inputs: String = (0..audio_inputs).map(|j| format!("[a{j}]")).collect();
            parts.push(format!(
                "{mix_inputs}amix=inputs={audio_inputs}:duration=longest,\
                 asetpts=PTS-STARTPTS[aout]"
            ));
        }

        audio_label = Some("[aout]".to_string());
    }

    FilterGraph {
        expr: parts.join(";"),
        video_label,
        audio_label,
    }
}
