use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScrollConfigError {
    #[error("item height must be a positive finite number of pixels (got {0})")]
    InvalidItemHeight(f64),
    #[error("container height must be a non-negative finite number of pixels (got {0})")]
    InvalidContainerHeight(f64),
    #[error("load-more threshold must be a non-negative finite number of pixels (got {0})")]
    InvalidLoadMoreThreshold(f64),
}

/// Geometry and behaviour of a [`crate::Controller`].
///
/// Fixed for the controller's lifetime except `container_height`, which
/// follows [`crate::Controller::update_container_height`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    pub container_height: f64,
    /// Row height for fixed layouts; initial estimate for dynamic ones.
    pub item_height: f64,
    pub dynamic_height: bool,
    /// Extra rows rendered above and below the viewport.
    pub buffer_size: usize,
    pub infinite_scroll: bool,
    /// Distance from the bottom (px) at which the next page is requested.
    pub load_more_threshold: f64,
    /// Measured heights kept per controller before the least recently
    /// measured ones fall back to the running average.
    pub max_measured_heights: usize,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            container_height: 600.0,
            item_height: 60.0,
            dynamic_height: false,
            buffer_size: 5,
            infinite_scroll: false,
            load_more_threshold: 200.0,
            max_measured_heights: 10_000,
        }
    }
}

impl ScrollConfig {
    pub fn validate(&self) -> Result<(), ScrollConfigError> {
        if !(self.item_height.is_finite() && self.item_height > 0.0) {
            return Err(ScrollConfigError::InvalidItemHeight(self.item_height));
        }
        check_container_height(self.container_height)?;
        if !(self.load_more_threshold.is_finite() && self.load_more_threshold >= 0.0) {
            return Err(ScrollConfigError::InvalidLoadMoreThreshold(
                self.load_more_threshold,
            ));
        }
        Ok(())
    }
}

pub(crate) fn check_container_height(px: f64) -> Result<f64, ScrollConfigError> {
    if px.is_finite() && px >= 0.0 {
        Ok(px)
    } else {
        Err(ScrollConfigError::InvalidContainerHeight(px))
    }
}
