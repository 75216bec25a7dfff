//! Position capability boundary.

use crate::measurement::GeoPosition;

/// Source of the latest known GPS fix.
///
/// Returns all zeros when no fix is available; the flux pipeline treats that
/// as "no GPS at capture time" and substitutes the live position at save time.
pub trait PositionSource: Send + Sync {
    fn location(&self) -> GeoPosition;
}

/// A constant fix, or no fix at all with the default zeros.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPosition(pub GeoPosition);

impl PositionSource for FixedPosition {
    fn location(&self) -> GeoPosition {
        self.0
    }
}
