use crate::error::StampError;
use crate::types::{Point, Size};

pub const DEFAULT_PLACEMENT: Placement = Placement { x: 50, y: 50 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DragState {
    #[default]
    Unlocked,
    Dragging,
    Locked,
}

/// Top-left corner of the stamp in preview-canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
}

impl Default for Placement {
    fn default() -> Self {
        DEFAULT_PLACEMENT
    }
}

impl Placement {
    pub fn as_point(self) -> Point {
        Point::new(self.x as f64, self.y as f64)
    }

    fn centered_on(pointer: Point, stamp: Size) -> Self {
        Self {
            x: round_half_up(pointer.x - stamp.width as f64 / 2.0),
            y: round_half_up(pointer.y - stamp.height as f64 / 2.0),
        }
    }
}

/// Halves round toward +inf, so -0.5 becomes 0.
fn round_half_up(v: f64) -> i32 {
    (v + 0.5).floor() as i32
}

#[derive(Debug, Clone, Default)]
pub struct PlacementController {
    placement: Placement,
    state: DragState,
}

impl PlacementController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn state(&self) -> DragState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == DragState::Locked
    }

    /// Starts a drag and centres the stamp on the pointer. Returns whether
    /// the preview needs compositing.
    pub fn pointer_down(&mut self, pointer: Point, stamp: Option<Size>) -> bool {
        let Some(size) = stamp else {
            return false;
        };
        if self.state == DragState::Locked {
            return false;
        }
        self.state = DragState::Dragging;
        self.placement = Placement::centered_on(pointer, size);
        true
    }

    pub fn pointer_move(&mut self, pointer: Point, stamp: Option<Size>) -> bool {
        let Some(size) = stamp else {
            return false;
        };
        if self.state != DragState::Dragging {
            return false;
        }
        self.placement = Placement::centered_on(pointer, size);
        true
    }

    /// Ends a drag. Safe to call in any state.
    pub fn pointer_up(&mut self) {
        if self.state == DragState::Dragging {
            self.state = DragState::Unlocked;
        }
    }

    pub fn lock(&mut self, stamp_exists: bool) -> Result<(), StampError> {
        if !stamp_exists {
            return Err(StampError::MissingStamp);
        }
        self.state = DragState::Locked;
        Ok(())
    }

    /// Clears a lock without moving the stamp.
    pub fn unlock(&mut self) {
        self.state = DragState::Unlocked;
    }

    pub fn reset(&mut self) {
        self.state = DragState::Unlocked;
        self.placement = DEFAULT_PLACEMENT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAMP: Size = Size {
        width: 160.0,
        height: 90.0,
    };

    #[test]
    fn drag_centres_stamp_on_pointer() {
        let mut ctl = PlacementController::new();
        assert!(ctl.pointer_down(Point::new(10.0, 10.0), Some(STAMP)));
        assert!(ctl.pointer_move(Point::new(200.0, 150.0), Some(STAMP)));
        assert_eq!(ctl.placement(), Placement { x: 120, y: 105 });
        ctl.pointer_up();
        assert_eq!(ctl.state(), DragState::Unlocked);
    }

    #[test]
    fn pointer_down_without_stamp_is_ignored() {
        let mut ctl = PlacementController::new();
        assert!(!ctl.pointer_down(Point::new(200.0, 150.0), None));
        assert_eq!(ctl.state(), DragState::Unlocked);
        assert_eq!(ctl.placement(), DEFAULT_PLACEMENT);
    }

    #[test]
    fn move_without_drag_does_nothing() {
        let mut ctl = PlacementController::new();
        assert!(!ctl.pointer_move(Point::new(300.0, 300.0), Some(STAMP)));
        assert_eq!(ctl.placement(), DEFAULT_PLACEMENT);
    }

    #[test]
    fn locked_stamp_ignores_pointer_events() {
        let mut ctl = PlacementController::new();
        ctl.pointer_down(Point::new(200.0, 150.0), Some(STAMP));
        ctl.pointer_up();
        ctl.lock(true).unwrap();
        let before = ctl.placement();
        assert!(!ctl.pointer_down(Point::new(400.0, 400.0), Some(STAMP)));
        assert!(!ctl.pointer_move(Point::new(500.0, 500.0), Some(STAMP)));
        ctl.pointer_up();
        assert_eq!(ctl.placement(), before);
        assert!(ctl.is_locked());
    }

    #[test]
    fn pointer_up_is_idempotent() {
        let mut ctl = PlacementController::new();
        ctl.pointer_up();
        ctl.pointer_up();
        assert_eq!(ctl.state(), DragState::Unlocked);
    }

    #[test]
    fn lock_without_stamp_fails_without_state_change() {
        let mut ctl = PlacementController::new();
        let err = ctl.lock(false).unwrap_err();
        assert!(matches!(err, StampError::MissingStamp));
        assert_eq!(ctl.state(), DragState::Unlocked);
    }

    #[test]
    fn reset_unlocks_and_restores_default() {
        let mut ctl = PlacementController::new();
        ctl.pointer_down(Point::new(300.0, 300.0), Some(STAMP));
        ctl.pointer_up();
        ctl.lock(true).unwrap();
        ctl.reset();
        assert_eq!(ctl.state(), DragState::Unlocked);
        assert_eq!(ctl.placement(), DEFAULT_PLACEMENT);
    }

    #[test]
    fn centring_rounds_half_pixels() {
        let odd = Size::new(161.0, 91.0);
        let p = Placement::centered_on(Point::new(200.0, 150.0), odd);
        assert_eq!(p, Placement { x: 120, y: 105 });
        assert_eq!(round_half_up(-0.5), 0);
        assert_eq!(round_half_up(-1.5), -1);
    }
}
