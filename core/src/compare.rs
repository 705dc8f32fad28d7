use tracing::debug;

use crate::pixel::{MatchResult, PixelGrid, Rgba};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompareError {
    #[error("cannot compare {}x{} grid with {}x{} grid", .left.0, .left.1, .right.0, .right.1)]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}

/// A pixel matches when every channel differs by strictly less than
/// `tolerance`. A tolerance of zero demands exact equality, the same as one.
pub fn pixels_match(a: Rgba, b: Rgba, tolerance: u16) -> bool {
    let tolerance = i32::from(tolerance.max(1));
    a.channels()
        .iter()
        .zip(b.channels().iter())
        .all(|(&ca, &cb)| (i32::from(ca) - i32::from(cb)).abs() < tolerance)
}

/// Count matching and differing pixels between two equally sized grids.
///
/// Every position is visited; the result is symmetric in `a` and `b`.
pub fn compare(a: &PixelGrid, b: &PixelGrid, tolerance: u16) -> Result<MatchResult, CompareError> {
    if a.dimensions() != b.dimensions() {
        return Err(CompareError::DimensionMismatch {
            left: a.dimensions(),
            right: b.dimensions(),
        });
    }

    let mut result = MatchResult::default();
    for (&pa, &pb) in a.pixels().iter().zip(b.pixels()) {
        if pixels_match(pa, pb, tolerance) {
            result.pass += 1;
        } else {
            result.fail += 1;
        }
    }

    debug!(
        width = a.width(),
        height = a.height(),
        tolerance,
        pass = result.pass,
        fail = result.fail,
        "pixel comparison"
    );
    Ok(result)
}
