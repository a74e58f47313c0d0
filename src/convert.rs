use crate::capture::{CaptureError, DesktopFrame};
use crate::params::{CaptureParams, ResolutionPolicy};
use image::{imageops, Rgba, RgbaImage};

/// Region of the output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_size((width, height): (u32, u32)) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Round down to a multiple of two. 4:2:0 subsampling downstream needs even sizes.
pub fn align_even(value: u32) -> u32 {
    value & !1
}

/// Largest even-sized rect with the aspect ratio of `source` that fits in
/// `bounds`, centred.
pub fn letterbox_rect(bounds: (u32, u32), source: (u32, u32)) -> Rect {
    let (bw, bh) = (bounds.0 as u64, bounds.1 as u64);
    let (sw, sh) = (source.0.max(1) as u64, source.1.max(1) as u64);

    // Limiting axis decided without floating point
    let (width, height) = if sw * bh >= sh * bw {
        (bw, sh * bw / sw)
    } else {
        (sw * bh / sh, bh)
    };

    let width = align_even(width as u32).clamp(2, bounds.0.max(2));
    let height = align_even(height as u32).clamp(2, bounds.1.max(2));

    Rect {
        x: align_even(bounds.0.saturating_sub(width) / 2),
        y: align_even(bounds.1.saturating_sub(height) / 2),
        width,
        height,
    }
}

/// Turns captured BGRA frames into the RGBA frames consumers receive.
///
/// The output size is recomputed whenever the source size changes:
/// - `Fixed`: output is the requested size, source letterboxed into it
/// - `WithinLimit`: output follows the source, scaled down to the limit
///
/// Frames whose size already matches the output are cropped to even
/// dimensions instead of being rescaled.
pub struct FrameConverter {
    max_size: (u32, u32),
    policy: ResolutionPolicy,
    source_size: Option<(u32, u32)>,
    output_size: (u32, u32),
    content: Rect,
}

impl FrameConverter {
    pub fn new(params: &CaptureParams) -> Self {
        let max_size = (
            align_even(params.max_width).max(2),
            align_even(params.max_height).max(2),
        );
        Self {
            max_size,
            policy: params.resolution_policy,
            source_size: None,
            output_size: max_size,
            content: Rect::from_size(max_size),
        }
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    /// Where the source lands inside the output frame
    pub fn content_rect(&self) -> Rect {
        self.content
    }

    pub fn convert(&mut self, frame: &DesktopFrame) -> Result<RgbaImage, CaptureError> {
        let _span = tracing::debug_span!("convert_frame").entered();

        frame.validate()?;

        let source = frame.dimensions();
        if self.source_size != Some(source) {
            self.refresh_format(source);
        }

        let cropped = (align_even(source.0), align_even(source.1));
        if self.output_size == cropped && self.content == Rect::from_size(cropped) {
            return to_rgba(frame, cropped.0, cropped.1);
        }

        let full = to_rgba(frame, source.0, source.1)?;
        let scaled = imageops::resize(
            &full,
            self.content.width,
            self.content.height,
            imageops::FilterType::Triangle,
        );

        let (width, height) = self.output_size;
        let mut output = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0xff]));
        imageops::overlay(
            &mut output,
            &scaled,
            self.content.x as i64,
            self.content.y as i64,
        );
        Ok(output)
    }

    fn refresh_format(&mut self, source: (u32, u32)) {
        let (output_size, content) = match self.policy {
            ResolutionPolicy::Fixed => (self.max_size, letterbox_rect(self.max_size, source)),
            ResolutionPolicy::WithinLimit => {
                if source.0 <= self.max_size.0 && source.1 <= self.max_size.1 {
                    let size = (align_even(source.0).max(2), align_even(source.1).max(2));
                    (size, Rect::from_size(size))
                } else {
                    let fitted = letterbox_rect(self.max_size, source).size();
                    (fitted, Rect::from_size(fitted))
                }
            }
        };

        tracing::info!(
            "Source resolution {}x{}, delivering {}x{} ({:?})",
            source.0,
            source.1,
            output_size.0,
            output_size.1,
            self.policy
        );

        self.source_size = Some(source);
        self.output_size = output_size;
        self.content = content;
    }
}

/// Copy the top-left `width` x `height` pixels, swapping BGRA to RGBA and
/// forcing alpha opaque
fn to_rgba(frame: &DesktopFrame, width: u32, height: u32) -> Result<RgbaImage, CaptureError> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        let row = &frame.row(y)[..width as usize * DesktopFrame::BYTES_PER_PIXEL];
        for px in row.chunks_exact(4) {
            data.extend_from_slice(&[px[2], px[1], px[0], 0xff]);
        }
    }

    RgbaImage::from_raw(width, height, data).ok_or_else(|| {
        CaptureError::InvalidFrame(format!("cannot build {}x{} image", width, height))
    })
}
