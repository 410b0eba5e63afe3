//! Overlay rendering.
//!
//! Each cycle builds a [`DrawOp`] plan from the cycle report and rasterizes it
//! into a transparent RGBA surface. The surface has its own size; detections
//! are mapped from native-frame coordinates with independent x/y scale factors.
//! The surface is cleared and fully redrawn every cycle.

mod glyphs;
mod raster;

pub use glyphs::{glyph_bits, text_width};

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::frame::FrameHandle;
use crate::process::{Category, CategoryCounts, CycleReport};

pub const DEFAULT_SURFACE_WIDTH: u32 = 640;
pub const DEFAULT_SURFACE_HEIGHT: u32 = 400;

const LABEL_HEIGHT: f32 = 25.0;
const LABEL_MAX_WIDTH: f32 = 150.0;
const TEXT_SCALE: u32 = 2;
const PANEL_X: f32 = 10.0;
const PANEL_Y: f32 = 10.0;
const PANEL_MIN_WIDTH: f32 = 250.0;
const PANEL_LINE_HEIGHT: f32 = 20.0;
const PANEL_PADDING: f32 = 10.0;
const DETECTION_LINE_RATIO: f32 = 0.6;

const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 160]);
const PANEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 178]);
const PANEL_TEXT: Rgba<u8> = Rgba([0, 255, 0, 255]);
const LABEL_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const DETECTION_LINE: Rgba<u8> = Rgba([0, 255, 255, 255]);

/// Box colour for a category. Unclassified detections are green.
pub fn palette(category: Option<Category>) -> Rgba<u8> {
    match category {
        Some(Category::Person) => Rgba([0xff, 0x00, 0x00, 0xff]),
        Some(Category::Car) => Rgba([0x00, 0x80, 0xff, 0xff]),
        Some(Category::Truck) => Rgba([0xff, 0xaa, 0x00, 0xff]),
        Some(Category::Motorcycle) => Rgba([0xff, 0x00, 0xff, 0xff]),
        None => Rgba([0x00, 0xff, 0x00, 0xff]),
    }
}

fn stroke_width(category: Option<Category>) -> u32 {
    match category {
        Some(Category::Person) | Some(Category::Truck) => 3,
        _ => 2,
    }
}

/// Native → surface scale factors. Zero native sizes are treated as 1.
pub fn scale_factors(surface: (u32, u32), native: (u32, u32)) -> (f32, f32) {
    (
        surface.0 as f32 / native.0.max(1) as f32,
        surface.1 as f32 / native.1.max(1) as f32,
    )
}

/// One drawing primitive, in surface pixels.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawOp {
    StrokeRect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Rgba<u8>,
        thickness: u32,
    },
    FillRect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Rgba<u8>,
    },
    Text {
        x: f32,
        y: f32,
        text: String,
        color: Rgba<u8>,
        scale: u32,
    },
    /// Full-width horizontal dashed line.
    DashedLine {
        y: f32,
        color: Rgba<u8>,
        dash: u32,
        gap: u32,
        thickness: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlaySettings {
    pub width: u32,
    pub height: u32,
    pub detection_line: bool,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_SURFACE_WIDTH,
            height: DEFAULT_SURFACE_HEIGHT,
            detection_line: true,
        }
    }
}

/// Transparent RGBA layer the overlay is painted into.
pub struct OverlaySurface {
    canvas: RgbaImage,
}

impl OverlaySurface {
    fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbaImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.canvas.width()
    }

    pub fn height(&self) -> u32 {
        self.canvas.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.canvas
    }

    /// The frame scaled to this surface with the overlay blended on top.
    pub fn composite(&self, frame: &FrameHandle) -> RgbaImage {
        let resized = imageops::resize(
            frame.pixels(),
            self.width(),
            self.height(),
            FilterType::Triangle,
        );
        let mut base = RgbaImage::from_fn(self.width(), self.height(), |x, y| {
            let [r, g, b] = resized.get_pixel(x, y).0;
            Rgba([r, g, b, 255])
        });
        imageops::overlay(&mut base, &self.canvas, 0, 0);
        base
    }

    fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }
}

impl std::fmt::Debug for OverlaySurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlaySurface")
            .field("size", &(self.width(), self.height()))
            .finish()
    }
}

pub struct OverlayRenderer {
    settings: OverlaySettings,
    surface: Option<OverlaySurface>,
    draws: u64,
}

impl OverlayRenderer {
    pub fn new(settings: OverlaySettings) -> Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!(
                "overlay surface must be non-empty, got {}x{}",
                settings.width,
                settings.height
            ));
        }
        Ok(Self {
            settings,
            surface: None,
            draws: 0,
        })
    }

    pub fn settings(&self) -> OverlaySettings {
        self.settings
    }

    /// Allocate the surface if it does not exist yet.
    pub fn allocate(&mut self) -> &OverlaySurface {
        let settings = self.settings;
        self.surface.get_or_insert_with(|| {
            log::debug!(
                "overlay surface allocated ({}x{})",
                settings.width,
                settings.height
            );
            OverlaySurface::new(settings.width, settings.height)
        })
    }

    pub fn release(&mut self) {
        if self.surface.take().is_some() {
            log::debug!("overlay surface released");
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.surface.is_some()
    }

    pub fn surface(&self) -> Option<&OverlaySurface> {
        self.surface.as_ref()
    }

    /// Number of completed renders since construction.
    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Draw plan for one cycle. Pure.
    pub fn plan(
        &self,
        report: &CycleReport,
        totals: &CategoryCounts,
        native: (u32, u32),
    ) -> Vec<DrawOp> {
        let (surface_w, surface_h) = (self.settings.width, self.settings.height);
        let (scale_x, scale_y) = scale_factors((surface_w, surface_h), native);
        let mut ops = Vec::new();

        for classified in &report.retained {
            let bbox = classified.detection.bbox.scaled(scale_x, scale_y);
            let color = palette(classified.category);
            ops.push(DrawOp::StrokeRect {
                x: bbox.x,
                y: bbox.y,
                width: bbox.width,
                height: bbox.height,
                color,
                thickness: stroke_width(classified.category),
            });

            let label_y = if bbox.y > LABEL_HEIGHT {
                bbox.y - LABEL_HEIGHT
            } else {
                bbox.y + bbox.height
            };
            ops.push(DrawOp::FillRect {
                x: bbox.x,
                y: label_y,
                width: bbox.width.min(LABEL_MAX_WIDTH),
                height: LABEL_HEIGHT,
                color: LABEL_BACKGROUND,
            });
            ops.push(DrawOp::Text {
                x: bbox.x + 5.0,
                y: label_y + 5.0,
                text: format!(
                    "{} {}%",
                    classified.detection.label,
                    classified.detection.confidence_percent()
                ),
                color: LABEL_TEXT,
                scale: TEXT_SCALE,
            });
        }

        if self.settings.detection_line {
            let line_y = surface_h as f32 * DETECTION_LINE_RATIO;
            ops.push(DrawOp::DashedLine {
                y: line_y,
                color: DETECTION_LINE,
                dash: 10,
                gap: 5,
                thickness: 2,
            });
            ops.push(DrawOp::Text {
                x: 10.0,
                y: line_y - 10.0 - 7.0 * TEXT_SCALE as f32,
                text: "DETECTION LINE".to_string(),
                color: DETECTION_LINE,
                scale: TEXT_SCALE,
            });
        }

        ops.extend(stats_panel(report.detection_count(), totals));
        ops
    }

    /// Clear the surface and draw this cycle. Fails if the surface has been
    /// released.
    pub fn render(
        &mut self,
        report: &CycleReport,
        totals: &CategoryCounts,
        frame: &FrameHandle,
    ) -> Result<&OverlaySurface> {
        let ops = self.plan(report, totals, frame.native_size());
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| anyhow!("overlay surface is not allocated"))?;
        surface.clear();
        raster::rasterize(&mut surface.canvas, &ops);
        self.draws += 1;
        Ok(surface)
    }

    /// The frame scaled to the surface with the current overlay blended on top.
    pub fn composite(&self, frame: &FrameHandle) -> Result<RgbaImage> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| anyhow!("overlay surface is not allocated"))?;
        Ok(surface.composite(frame))
    }
}

fn stats_panel(live: usize, totals: &CategoryCounts) -> Vec<DrawOp> {
    let lines = [
        "LIVE TRAFFIC DETECTION".to_string(),
        format!("Live Objects: {}", live),
        format!("Total Cars: {}", totals.cars),
        format!("Total People: {}", totals.people),
        format!("Total Trucks: {}", totals.trucks),
        format!("Total Motorcycles: {}", totals.motorcycles),
    ];
    let widest = lines
        .iter()
        .map(|line| text_width(line, TEXT_SCALE))
        .max()
        .unwrap_or(0) as f32;
    let width = PANEL_MIN_WIDTH.max(widest + 2.0 * PANEL_PADDING);
    let height = lines.len() as f32 * PANEL_LINE_HEIGHT + PANEL_PADDING;

    let mut ops = vec![DrawOp::FillRect {
        x: PANEL_X,
        y: PANEL_Y,
        width,
        height,
        color: PANEL_BACKGROUND,
    }];
    for (i, line) in lines.into_iter().enumerate() {
        ops.push(DrawOp::Text {
            x: PANEL_X + PANEL_PADDING,
            y: PANEL_Y + PANEL_PADDING + i as f32 * PANEL_LINE_HEIGHT,
            text: line,
            color: PANEL_TEXT,
            scale: TEXT_SCALE,
        });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::process::ClassifiedDetection;
    use image::RgbImage;

    fn report_with(detection: Detection, category: Option<Category>) -> CycleReport {
        CycleReport {
            retained: vec![ClassifiedDetection {
                detection,
                category,
            }],
            ..Default::default()
        }
    }

    fn first_rect(ops: &[DrawOp]) -> (f32, f32, f32, f32) {
        ops.iter()
            .find_map(|op| match op {
                DrawOp::StrokeRect {
                    x,
                    y,
                    width,
                    height,
                    ..
                } => Some((*x, *y, *width, *height)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn centre_maps_to_centre_for_any_native_size() {
        let renderer = OverlayRenderer::new(OverlaySettings::default()).unwrap();
        for native in [(1920, 1080), (640, 400), (333, 777)] {
            let (w, h) = (40.0, 30.0);
            let bbox = BoundingBox::new(
                native.0 as f32 / 2.0 - w / 2.0,
                native.1 as f32 / 2.0 - h / 2.0,
                w,
                h,
            );
            let report = report_with(Detection::new("car", 0.9, bbox), Some(Category::Car));
            let ops = renderer.plan(&report, &CategoryCounts::default(), native);
            let (x, y, rw, rh) = first_rect(&ops);
            let centre = (x + rw / 2.0, y + rh / 2.0);
            assert!((centre.0 - 320.0).abs() < 1e-3, "{:?}", native);
            assert!((centre.1 - 200.0).abs() < 1e-3, "{:?}", native);
        }
    }

    #[test]
    fn label_goes_below_box_near_top() {
        let renderer = OverlayRenderer::new(OverlaySettings::default()).unwrap();
        let report = report_with(
            Detection::new("person", 0.9, BoundingBox::new(10.0, 10.0, 300.0, 100.0)),
            Some(Category::Person),
        );
        let ops = renderer.plan(&report, &CategoryCounts::default(), (640, 400));
        let label_bg = ops
            .iter()
            .find_map(|op| match op {
                DrawOp::FillRect { y, width, color, .. } if *color == LABEL_BACKGROUND => {
                    Some((*y, *width))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(label_bg, (110.0, LABEL_MAX_WIDTH));
        assert!(ops.iter().any(|op| matches!(
            op,
            DrawOp::Text { text, .. } if text == "person 90%"
        )));
    }

    #[test]
    fn stats_panel_lists_totals() {
        let renderer = OverlayRenderer::new(OverlaySettings {
            detection_line: false,
            ..Default::default()
        })
        .unwrap();
        let totals = CategoryCounts {
            cars: 4,
            people: 2,
            trucks: 1,
            motorcycles: 0,
        };
        let ops = renderer.plan(&CycleReport::default(), &totals, (640, 400));
        let texts: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                "LIVE TRAFFIC DETECTION",
                "Live Objects: 0",
                "Total Cars: 4",
                "Total People: 2",
                "Total Trucks: 1",
                "Total Motorcycles: 0"
            ]
        );
        assert!(!ops.iter().any(|op| matches!(op, DrawOp::DashedLine { .. })));
    }

    #[test]
    fn render_requires_allocated_surface() {
        let mut renderer = OverlayRenderer::new(OverlaySettings::default()).unwrap();
        let frame = FrameHandle::still(RgbImage::new(64, 40), 1);
        assert!(renderer
            .render(&CycleReport::default(), &CategoryCounts::default(), &frame)
            .is_err());

        renderer.allocate();
        renderer
            .render(&CycleReport::default(), &CategoryCounts::default(), &frame)
            .unwrap();
        assert_eq!(renderer.draw_count(), 1);

        let composite = renderer.composite(&frame).unwrap();
        assert_eq!(composite.dimensions(), (640, 400));

        renderer.release();
        assert!(!renderer.is_allocated());
        assert!(renderer.composite(&frame).is_err());
    }

    #[test]
    fn palette_matches_categories() {
        assert_eq!(palette(Some(Category::Person)), Rgba([255, 0, 0, 255]));
        assert_eq!(palette(Some(Category::Car)), Rgba([0, 128, 255, 255]));
        assert_eq!(palette(None), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn zero_sized_surface_rejected() {
        assert!(OverlayRenderer::new(OverlaySettings {
            width: 0,
            ..Default::default()
        })
        .is_err());
    }
}
