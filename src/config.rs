use crate::{
    error::MapError,
    util::{table_size_for, MAXIMUM_CAPACITY},
};

pub const DEFAULT_CAPACITY: usize = 16;
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 1;

/// Sizing parameters for a new map.
///
/// `load_factor` and `concurrency_level` only shape the initial table. Once
/// the map is running it always grows at three quarters full.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    initial_capacity: usize,
    load_factor: f32,
    concurrency_level: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            initial_capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
        }
    }
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Estimated number of concurrently updating threads. Used as a floor
    /// for the initial capacity.
    pub fn concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.concurrency_level = concurrency_level;
        self
    }

    pub fn validate(&self) -> Result<(), MapError> {
        if !(self.load_factor.is_finite() && self.load_factor > 0.0) {
            return Err(MapError::InvalidLoadFactor(self.load_factor));
        }
        if self.concurrency_level == 0 {
            return Err(MapError::InvalidConcurrencyLevel);
        }
        Ok(())
    }

    /// Number of bins of the first table.
    pub fn table_size(&self) -> Result<usize, MapError> {
        self.validate()?;
        Ok(self.table_size_unchecked())
    }

    pub(crate) fn table_size_unchecked(&self) -> usize {
        let capacity = self.initial_capacity.max(self.concurrency_level);
        let size = 1.0 + capacity as f64 / f64::from(self.load_factor);
        if size >= MAXIMUM_CAPACITY as f64 {
            return MAXIMUM_CAPACITY;
        }
        table_size_for(size as usize)
    }
}
