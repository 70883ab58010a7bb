//! Overlay rendering for published frames.

use facewatch_core::{BoundingBox, FaceDetection};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const OUTLINE_WIDTH: u32 = 3;
const LABEL_BAR_HEIGHT: u32 = 18;

/// One face as drawn on a frame. The label text is left to the display
/// layer, anchored at `label_anchor` inside the filled bar.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceOverlay {
    pub bbox: BoundingBox,
    pub label: String,
    pub known: bool,
    /// Top-left corner of the label bar `(x, y)`.
    pub label_anchor: (u32, u32),
}

/// A frame ready for display: boxes drawn, labels attached.
///
/// Only the outlines and label bars are painted into `image`. The label
/// text is not rendered; displays draw `faces[i].label` themselves at
/// `faces[i].label_anchor`.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub faces: Vec<FaceOverlay>,
    pub face_count: usize,
    /// Rolling capture throughput, once the window has filled.
    pub fps: Option<f32>,
    /// 1-based frame index within the session.
    pub sequence: u64,
}

impl AnnotatedFrame {
    /// Status line shown under the video, e.g. `"2 faces | 14.8 fps"`.
    pub fn status_line(&self) -> String {
        let noun = if self.face_count == 1 { "face" } else { "faces" };
        match self.fps {
            Some(fps) => format!("{} {noun} | {fps:.1} fps", self.face_count),
            None => format!("{} {noun}", self.face_count),
        }
    }
}

pub fn annotate(
    mut image: RgbImage,
    faces: &[FaceDetection],
    show_confidence: bool,
    fps: Option<f32>,
    sequence: u64,
) -> AnnotatedFrame {
    let (width, height) = image.dimensions();
    let mut overlays = Vec::with_capacity(faces.len());

    for face in faces {
        let Some(bbox) = face.bbox.clip_to_frame(width, height) else {
            continue;
        };
        let color = if face.is_known() { KNOWN_COLOR } else { UNKNOWN_COLOR };
        draw_outline(&mut image, &bbox, color);
        let label_anchor = draw_label_bar(&mut image, &bbox, color);

        overlays.push(FaceOverlay {
            bbox,
            label: face.label(show_confidence),
            known: face.is_known(),
            label_anchor,
        });
    }

    AnnotatedFrame {
        image,
        face_count: faces.len(),
        faces: overlays,
        fps,
        sequence,
    }
}

fn draw_outline(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (x, y) = (bbox.left as i32, bbox.top as i32);
    let (w, h) = (bbox.width() as u32, bbox.height() as u32);
    for inset in 0..OUTLINE_WIDTH {
        let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
        if iw == 0 || ih == 0 {
            break;
        }
        let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Fill the bar below the box, or inside its bottom edge when the box
/// touches the bottom of the frame. Returns the bar's top-left corner.
fn draw_label_bar(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) -> (u32, u32) {
    let height = image.height();
    let x = bbox.left as u32;
    let width = (bbox.width() as u32).max(1);
    let bottom = bbox.bottom as u32;
    let y = if bottom + LABEL_BAR_HEIGHT <= height {
        bottom
    } else {
        bottom.saturating_sub(LABEL_BAR_HEIGHT)
    };
    let bar_height = LABEL_BAR_HEIGHT.min(height - y).max(1);
    draw_filled_rect_mut(
        image,
        Rect::at(x as i32, y as i32).of_size(width, bar_height),
        color,
    );
    (x, y)
}
