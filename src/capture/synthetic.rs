use super::{
    CaptureError, CaptureTarget, CapturerFactory, DesktopCapturer, DesktopFrame, ScreenId,
    WindowId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A window placed on a synthetic screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticWindow {
    pub screen: ScreenId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// RGB fill colour
    pub color: [u8; 3],
}

#[derive(Debug, Default)]
struct Layout {
    screens: BTreeMap<ScreenId, (u32, u32)>,
    windows: BTreeMap<WindowId, SyntheticWindow>,
}

/// In-memory desktop that renders moving test patterns.
///
/// Clones share the same layout, so a window closed through one handle
/// disappears for every capturer created from another.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDesktop {
    layout: Arc<Mutex<Layout>>,
}

impl SyntheticDesktop {
    pub fn new() -> Self {
        Self::default()
    }

    fn layout(&self) -> MutexGuard<'_, Layout> {
        self.layout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_screen(&self, id: ScreenId, width: u32, height: u32) {
        self.layout().screens.insert(id, (width, height));
    }

    pub fn add_window(&self, id: WindowId, window: SyntheticWindow) {
        self.layout().windows.insert(id, window);
    }

    /// Returns false if the window did not exist
    pub fn close_window(&self, id: WindowId) -> bool {
        let closed = self.layout().windows.remove(&id).is_some();
        if closed {
            tracing::info!("Synthetic window {:#x} closed", id);
        }
        closed
    }

    /// Unplug a screen. Windows placed on it stay open but are no longer drawn.
    pub fn disconnect_screen(&self, id: ScreenId) -> bool {
        self.layout().screens.remove(&id).is_some()
    }

    pub fn screen_ids(&self) -> Vec<ScreenId> {
        self.layout().screens.keys().copied().collect()
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.layout().windows.keys().copied().collect()
    }

    fn exists(&self, target: CaptureTarget) -> bool {
        let layout = self.layout();
        match target {
            CaptureTarget::Screen(id) => layout.screens.contains_key(&id),
            CaptureTarget::Window(id) => layout.windows.contains_key(&id),
        }
    }
}

impl CapturerFactory for SyntheticDesktop {
    fn resolve(&self, target: CaptureTarget) -> Result<(), CaptureError> {
        if self.exists(target) {
            Ok(())
        } else {
            Err(CaptureError::TargetLost(target))
        }
    }

    fn create(&self, target: CaptureTarget) -> Result<Box<dyn DesktopCapturer>, CaptureError> {
        self.resolve(target)?;
        tracing::debug!("Creating synthetic capturer for {}", target);
        Ok(Box::new(SyntheticCapturer {
            desktop: self.clone(),
            target,
            excluded: None,
            frame_index: 0,
        }))
    }
}

struct SyntheticCapturer {
    desktop: SyntheticDesktop,
    target: CaptureTarget,
    excluded: Option<WindowId>,
    frame_index: u32,
}

impl SyntheticCapturer {
    fn render_screen(&self, layout: &Layout, id: ScreenId) -> Option<DesktopFrame> {
        let &(width, height) = layout.screens.get(&id)?;
        let mut frame = DesktopFrame::new(width, height);
        let shift = self.frame_index.wrapping_mul(4);

        for y in 0..height {
            let row = frame.row_mut(y);
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let x = x as u32;
                px[0] = (x.wrapping_add(shift) % 256) as u8;
                px[1] = (y % 256) as u8;
                px[2] = ((x ^ y) % 256) as u8;
                px[3] = 0xff;
            }
        }

        for (window_id, window) in &layout.windows {
            if window.screen != id || Some(*window_id) == self.excluded {
                continue;
            }
            fill_rect(&mut frame, window.x, window.y, window.width, window.height, window.color);
        }

        Some(frame)
    }

    fn render_window(&self, layout: &Layout, id: WindowId) -> Option<DesktopFrame> {
        let window = layout.windows.get(&id)?;
        let mut frame = DesktopFrame::new(window.width, window.height);
        fill_rect(&mut frame, 0, 0, window.width, window.height, window.color);

        // Moving vertical bar so consecutive frames differ
        let bar_width = (window.width / 16).max(1);
        let bar_x = self.frame_index.wrapping_mul(bar_width) % window.width.max(1);
        fill_rect(&mut frame, bar_x, 0, bar_width, window.height, [0xff, 0xff, 0xff]);

        Some(frame)
    }
}

impl DesktopCapturer for SyntheticCapturer {
    fn target(&self) -> CaptureTarget {
        self.target
    }

    fn capture_frame(&mut self) -> Result<DesktopFrame, CaptureError> {
        let frame = {
            let layout = self.desktop.layout();
            match self.target {
                CaptureTarget::Screen(id) => self.render_screen(&layout, id),
                CaptureTarget::Window(id) => self.render_window(&layout, id),
            }
        };

        let frame = frame.ok_or(CaptureError::TargetLost(self.target))?;
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(frame)
    }

    fn set_excluded_window(&mut self, window: WindowId) {
        tracing::debug!("Excluding window {:#x} from {}", window, self.target);
        self.excluded = Some(window);
    }
}

/// Fill a rectangle with an RGB colour, clipped to the frame
fn fill_rect(frame: &mut DesktopFrame, x: u32, y: u32, width: u32, height: u32, rgb: [u8; 3]) {
    let x_end = x.saturating_add(width).min(frame.width);
    let y_end = y.saturating_add(height).min(frame.height);
    if x >= x_end || y >= y_end {
        return;
    }

    for row_y in y..y_end {
        let row = frame.row_mut(row_y);
        for px in row[x as usize * 4..x_end as usize * 4].chunks_exact_mut(4) {
            px[0] = rgb[2];
            px[1] = rgb[1];
            px[2] = rgb[0];
            px[3] = 0xff;
        }
    }
}
