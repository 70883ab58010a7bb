use anyhow::{bail, Result};
use facewatch_core::{Detector, Embedder, IdentityRecord};
use facewatch_hw::FrameSource;

/// Frames discarded while the camera's auto exposure settles.
const WARMUP_FRAMES: usize = 4;

/// Capture frames until one shows exactly one face, then embed it.
///
/// Frames with no face or several faces are skipped; gives up after
/// `max_frames` usable frames.
pub fn capture_identity(
    source: &mut dyn FrameSource,
    detector: &mut dyn Detector,
    embedder: &mut dyn Embedder,
    name: &str,
    max_frames: usize,
) -> Result<IdentityRecord> {
    for _ in 0..WARMUP_FRAMES {
        let _ = source.read_frame();
    }

    let (mut empty, mut crowded) = (0usize, 0usize);
    for attempt in 1..=max_frames {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "enroll: capture failed");
                continue;
            }
        };

        let faces = detector.locate_faces(&frame.image)?;
        match faces.len() {
            0 => empty += 1,
            1 => {
                let mut embeddings = embedder.embed_all(&frame.image, &faces)?;
                let Some(embedding) = embeddings.pop() else {
                    bail!("embedder returned no embedding for the detected face");
                };
                tracing::info!(attempt, bbox = ?faces[0], "enroll: face captured");
                return Ok(IdentityRecord::enroll(name, embedding));
            }
            _ => crowded += 1,
        }
    }

    bail!(
        "no single face found in {max_frames} frames ({empty} without a face, {crowded} with several)"
    )
}
