//! Coordinate mapping between classifier boxes and PDF page space.
//!
//! The classifier reports boxes as percentages of the rendered page
//! ([`NormBox`], origin top-left). Mutations need absolute page points.
//! Two layers do the conversion:
//!
//! ```text
//! NormBox (0–100 %) ──to_absolute──▶ Rect (points, top-left, y down)
//!                                      │
//!                                      └──PageFrame::to_user_space──▶ PDF user space (y up)
//! ```
//!
//! [`to_absolute`] and [`to_normalized`] are pure and exact inverses up to
//! floating-point rounding. [`PageFrame`] carries the page's visible box and
//! `/Rotate` so the top-left view rect lands on the right spot in the
//! content stream's coordinate system.

use crate::error::AnonError;
use serde::{Deserialize, Serialize};

/// A box expressed as percentages of page width/height, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    fn validate(&self) -> Result<(), AnonError> {
        let all_finite = [self.x, self.y, self.w, self.h]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite || self.w < 0.0 || self.h < 0.0 {
            return Err(AnonError::InvalidInstruction {
                detail: format!("bounding box {self:?} is not a finite non-negative box"),
            });
        }
        Ok(())
    }
}

/// An absolute rectangle in page points, origin top-left, y increasing downward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    /// Build a rect from two corners in any order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

fn check_page(width: f64, height: f64) -> Result<(), AnonError> {
    if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
        return Err(AnonError::DegeneratePage { width, height });
    }
    Ok(())
}

/// Map a normalized box onto an absolute rect for a page of the given size.
pub fn to_absolute(page_width: f64, page_height: f64, b: &NormBox) -> Result<Rect, AnonError> {
    check_page(page_width, page_height)?;
    b.validate()?;
    let x0 = b.x / 100.0 * page_width;
    let y0 = b.y / 100.0 * page_height;
    Ok(Rect {
        x0,
        y0,
        x1: x0 + b.w / 100.0 * page_width,
        y1: y0 + b.h / 100.0 * page_height,
    })
}

/// Inverse of [`to_absolute`].
pub fn to_normalized(page_width: f64, page_height: f64, r: &Rect) -> Result<NormBox, AnonError> {
    check_page(page_width, page_height)?;
    Ok(NormBox {
        x: r.x0 / page_width * 100.0,
        y: r.y0 / page_height * 100.0,
        w: r.width() / page_width * 100.0,
        h: r.height() / page_height * 100.0,
    })
}

/// A point or rect in PDF user space (origin bottom-left, y up).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UserRect {
    pub llx: f64,
    pub lly: f64,
    pub urx: f64,
    pub ury: f64,
}

impl UserRect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            llx: x0.min(x1),
            lly: y0.min(y1),
            urx: x0.max(x1),
            ury: y0.max(y1),
        }
    }

    pub fn width(&self) -> f64 {
        self.urx - self.llx
    }

    pub fn height(&self) -> f64 {
        self.ury - self.lly
    }

    pub fn intersects(&self, other: &UserRect) -> bool {
        self.llx < other.urx && other.llx < self.urx && self.lly < other.ury && other.lly < self.ury
    }

    pub fn contains(&self, other: &UserRect) -> bool {
        self.llx <= other.llx && self.lly <= other.lly && self.urx >= other.urx && self.ury >= other.ury
    }

    pub fn intersection(&self, other: &UserRect) -> Option<UserRect> {
        self.intersects(other).then(|| UserRect {
            llx: self.llx.max(other.llx),
            lly: self.lly.max(other.lly),
            urx: self.urx.min(other.urx),
            ury: self.ury.min(other.ury),
        })
    }
}

/// The visible page box of one PDF page plus its display rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageFrame {
    /// Visible box in user space (CropBox, else MediaBox).
    pub bounds: UserRect,
    /// Clockwise display rotation: 0, 90, 180 or 270.
    pub rotation: i64,
}

impl PageFrame {
    pub fn new(bounds: UserRect, rotation: i64) -> Self {
        Self {
            bounds,
            rotation: rotation.rem_euclid(360) / 90 * 90,
        }
    }

    /// Width and height of the page as displayed (after rotation).
    pub fn view_size(&self) -> (f64, f64) {
        match self.rotation {
            90 | 270 => (self.bounds.height(), self.bounds.width()),
            _ => (self.bounds.width(), self.bounds.height()),
        }
    }

    /// Map a top-left view point into user space.
    pub fn view_point_to_user(&self, vx: f64, vy: f64) -> (f64, f64) {
        let b = &self.bounds;
        match self.rotation {
            90 => (b.llx + vy, b.lly + vx),
            180 => (b.urx - vx, b.lly + vy),
            270 => (b.urx - vy, b.ury - vx),
            _ => (b.llx + vx, b.ury - vy),
        }
    }

    pub fn user_point_to_view(&self, ux: f64, uy: f64) -> (f64, f64) {
        let b = &self.bounds;
        match self.rotation {
            90 => (uy - b.lly, ux - b.llx),
            180 => (b.urx - ux, uy - b.lly),
            270 => (b.ury - uy, b.urx - ux),
            _ => (ux - b.llx, b.ury - uy),
        }
    }

    /// Convert a top-left view rect into PDF user space.
    pub fn to_user_space(&self, r: &Rect) -> UserRect {
        let (ax, ay) = self.view_point_to_user(r.x0, r.y0);
        let (bx, by) = self.view_point_to_user(r.x1, r.y1);
        UserRect::new(ax, ay, bx, by)
    }

    /// Convert a user-space rect back into top-left view coordinates.
    pub fn to_view(&self, u: &UserRect) -> Rect {
        let (ax, ay) = self.user_point_to_view(u.llx, u.lly);
        let (bx, by) = self.user_point_to_view(u.urx, u.ury);
        Rect::new(ax, ay, bx, by)
    }

    /// Map a normalized box straight into user space.
    pub fn norm_to_user(&self, b: &NormBox) -> Result<UserRect, AnonError> {
        let (w, h) = self.view_size();
        Ok(self.to_user_space(&to_absolute(w, h, b)?))
    }
}
