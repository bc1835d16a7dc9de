//! Mapping between the pan-zoom view and simulation space

use crate::constants::BBOX_DECIMALS;
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Visible region of simulation space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min_x: -8.0,
            min_y: -8.0,
            max_x: 8.0,
            max_y: 8.0,
        }
    }
}

impl BoundingBox {
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn min(&self) -> Vec2 {
        Vec2::new(self.min_x, self.min_y)
    }

    pub fn max(&self) -> Vec2 {
        Vec2::new(self.max_x, self.max_y)
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Vec2 {
        (self.min() + self.max()) * 0.5
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    /// True when all corners are finite and the box has positive area.
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// Pack as `[min_x, min_y, max_x, max_y]` for uniform blocks.
    pub fn to_array(&self) -> [f32; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

/// Uniform scale + translation applied by the pan-zoom layer, in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub scale: f32,
    pub x: f32,
    pub y: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            x: 0.0,
            y: 0.0,
        }
    }
}

impl Transform {
    pub fn is_valid(&self) -> bool {
        self.scale.is_finite() && self.scale > 0.0 && self.x.is_finite() && self.y.is_finite()
    }
}

/// Canvas rectangle in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl CanvasRect {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width,
            height,
        }
    }

    /// Canvas for a window of `width` x `height` logical pixels, padded by 2% (at least 30px)
    /// on every side so trails leave the screen instead of bunching at the edge.
    pub fn padded(width: f32, height: f32, pixel_ratio: f32) -> Self {
        let dx = (width * 0.02).max(30.0);
        let dy = (height * 0.02).max(30.0);
        Self {
            left: -dx,
            top: -dy,
            width: pixel_ratio * (width + 2.0 * dx),
            height: pixel_ratio * (height + 2.0 * dy),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// Identifies a registered bounding box listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&BoundingBox) + Send>;

/// Converts pan-zoom transforms into simulation-space bounding boxes.
///
/// Canvas coordinates are measured from the canvas center, so the identity transform shows a
/// box symmetric about the origin with one simulation unit per device pixel. The y axis points
/// up in simulation space and down on the canvas.
pub struct BoundingBoxMapper {
    current: BoundingBox,
    transform: Transform,
    canvas: CanvasRect,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl BoundingBoxMapper {
    pub fn new(transform: Transform, canvas: CanvasRect) -> Self {
        let current = if transform.is_valid() && canvas.is_valid() {
            compute_bbox(&transform, &canvas)
        } else {
            BoundingBox::default()
        };

        Self {
            current,
            transform,
            canvas,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Recompute the box and notify every listener exactly once.
    ///
    /// Invalid transforms or canvases leave the previous box in place; listeners still hear
    /// about the call and decide for themselves whether anything changed.
    pub fn update(&mut self, transform: Transform, canvas: CanvasRect) -> BoundingBox {
        if transform.is_valid() && canvas.is_valid() {
            self.transform = transform;
            self.canvas = canvas;
            self.current = compute_bbox(&transform, &canvas);
        } else {
            log::debug!("ignoring degenerate view: {transform:?} {canvas:?}");
        }

        let bbox = self.current;
        for (_, listener) in &mut self.listeners {
            listener(&bbox);
        }
        bbox
    }

    /// Re-run [`update`](Self::update) with a new transform and the last canvas.
    pub fn update_transform(&mut self, transform: Transform) -> BoundingBox {
        self.update(transform, self.canvas)
    }

    /// Re-run [`update`](Self::update) with a new canvas and the last transform.
    pub fn update_canvas(&mut self, canvas: CanvasRect) -> BoundingBox {
        self.update(self.transform, canvas)
    }

    pub fn current(&self) -> BoundingBox {
        self.current
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn canvas(&self) -> CanvasRect {
        self.canvas
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&BoundingBox) + Send + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Simulation-space point under a canvas pixel (measured from the canvas top-left).
    pub fn to_simulation(&self, pixel_x: f32, pixel_y: f32) -> Vec2 {
        canvas_to_simulation(&self.transform, &self.canvas, pixel_x, pixel_y)
    }

    /// Transform that shows `bbox` centered and fully visible on `canvas`.
    pub fn transform_for(bbox: &BoundingBox, canvas: &CanvasRect) -> Option<Transform> {
        if !bbox.is_valid() || !canvas.is_valid() {
            return None;
        }

        let scale = (canvas.width / bbox.width()).min(canvas.height / bbox.height());
        let center = bbox.center();
        Some(Transform {
            scale,
            x: -center.x * scale,
            y: center.y * scale,
        })
    }
}

fn canvas_to_simulation(
    transform: &Transform,
    canvas: &CanvasRect,
    pixel_x: f32,
    pixel_y: f32,
) -> Vec2 {
    let cx = pixel_x - canvas.width * 0.5;
    let cy = pixel_y - canvas.height * 0.5;
    Vec2::new(
        (cx - transform.x) / transform.scale,
        -(cy - transform.y) / transform.scale,
    )
}

fn compute_bbox(transform: &Transform, canvas: &CanvasRect) -> BoundingBox {
    let top_left = canvas_to_simulation(transform, canvas, 0.0, 0.0);
    let bottom_right = canvas_to_simulation(transform, canvas, canvas.width, canvas.height);

    BoundingBox {
        min_x: round_to_precision(top_left.x),
        min_y: round_to_precision(bottom_right.y),
        max_x: round_to_precision(bottom_right.x),
        max_y: round_to_precision(top_left.y),
    }
}

fn round_to_precision(value: f32) -> f32 {
    let factor = 10f64.powi(BBOX_DECIMALS);
    ((value as f64 * factor).round() / factor) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_identity_transform_is_symmetric() {
        let mut mapper = BoundingBoxMapper::new(Transform::default(), CanvasRect::new(800.0, 600.0));
        let bbox = mapper.update(Transform::default(), CanvasRect::new(800.0, 600.0));

        assert_eq!(bbox, BoundingBox::new(-400.0, -300.0, 400.0, 300.0));
        assert_eq!(bbox.min_x, -bbox.max_x);
        assert_eq!(bbox.min_y, -bbox.max_y);
    }

    #[test]
    fn test_update_is_bit_identical_for_same_input() {
        let transform = Transform {
            scale: 37.123,
            x: 12.7,
            y: -4.3,
        };
        let canvas = CanvasRect::new(1917.0, 1033.0);
        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);

        let first = mapper.update(transform, canvas);
        let second = mapper.update(transform, canvas);

        assert_eq!(first.to_array().map(f32::to_bits), second.to_array().map(f32::to_bits));
    }

    #[test]
    fn test_corners_rounded_to_four_decimals() {
        let mut mapper = BoundingBoxMapper::new(Transform::default(), CanvasRect::new(100.0, 100.0));
        let bbox = mapper.update(
            Transform {
                scale: 3.0,
                x: 0.0,
                y: 0.0,
            },
            CanvasRect::new(100.0, 100.0),
        );

        assert_eq!(bbox.max_x, 16.6667);
        assert_eq!(bbox.min_x, -16.6667);
    }

    #[test]
    fn test_y_axis_points_up() {
        let canvas = CanvasRect::new(200.0, 100.0);
        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);

        // Dragging the content down moves the visible window up in simulation space.
        let bbox = mapper.update(
            Transform {
                scale: 1.0,
                x: 0.0,
                y: 20.0,
            },
            canvas,
        );
        assert_eq!(bbox.max_y, 70.0);
        assert_eq!(bbox.min_y, -30.0);

        let top = mapper.to_simulation(100.0, 0.0);
        let bottom = mapper.to_simulation(100.0, 100.0);
        assert!(top.y > bottom.y);
    }

    #[test]
    fn test_notifies_once_per_update_even_when_unchanged() {
        let canvas = CanvasRect::new(640.0, 480.0);
        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mapper.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        mapper.update(Transform::default(), canvas);
        mapper.update(Transform::default(), canvas);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_degenerate_input_keeps_previous_box() {
        let canvas = CanvasRect::new(640.0, 480.0);
        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);
        let before = mapper.current();

        let after = mapper.update(
            Transform {
                scale: 0.0,
                x: 0.0,
                y: 0.0,
            },
            canvas,
        );
        assert_eq!(before, after);

        let after = mapper.update(Transform::default(), CanvasRect::new(f32::NAN, 10.0));
        assert_eq!(before, after);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let canvas = CanvasRect::new(10.0, 10.0);
        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = mapper.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(mapper.unsubscribe(id));
        assert!(!mapper.unsubscribe(id));
        mapper.update(Transform::default(), canvas);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.listener_count(), 0);
    }

    #[test]
    fn test_transform_for_restores_saved_box() {
        let canvas = CanvasRect::new(800.0, 800.0);
        let saved = BoundingBox::new(-2.0, -1.0, 6.0, 7.0);
        let transform = BoundingBoxMapper::transform_for(&saved, &canvas).unwrap();

        let mut mapper = BoundingBoxMapper::new(Transform::default(), canvas);
        let restored = mapper.update(transform, canvas);

        assert_eq!(restored, saved);
    }

    #[test]
    fn test_padded_canvas() {
        let rect = CanvasRect::padded(1000.0, 500.0, 2.0);
        assert_eq!(rect.left, -30.0);
        assert_eq!(rect.top, -30.0);
        assert_eq!(rect.width, 2.0 * 1060.0);
        assert_eq!(rect.height, 2.0 * 560.0);
    }
}
