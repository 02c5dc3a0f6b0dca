//! The shared map resource guarded by the grid mutex.

use parking_lot::{Mutex, MutexGuard};

use crate::cells::{ClampParams, LogOddsGrid};
use crate::dimensions::MapDimensions;
use crate::hd_map::HdMap;

/// Geometry plus cell store plus the HD-map descriptor.
///
/// The cell store is exclusively owned by the layered map; everything else
/// borrows it under the grid mutex. Contract: any function that reads more
/// than one cell or performs any write must hold the mutex.
#[derive(Debug)]
pub struct MapData {
    hd_map: HdMap,
    dimensions: MapDimensions,
    grid: Mutex<LogOddsGrid>,
}

impl MapData {
    pub fn new(hd_map: HdMap, dimensions: MapDimensions, clamp: ClampParams) -> Self {
        Self {
            hd_map,
            dimensions,
            grid: Mutex::new(LogOddsGrid::new(dimensions, clamp)),
        }
    }

    #[inline]
    pub fn hd_map(&self) -> &HdMap {
        &self.hd_map
    }

    /// Grid geometry. Immutable for the lifetime of this `MapData`, so it
    /// can be read without the mutex.
    #[inline]
    pub fn dimensions(&self) -> &MapDimensions {
        &self.dimensions
    }

    /// Acquire the grid mutex.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, LogOddsGrid> {
        self.grid.lock()
    }
}
