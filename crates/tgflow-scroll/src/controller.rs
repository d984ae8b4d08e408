use crate::config::{check_container_height, ScrollConfig, ScrollConfigError};
use crate::heights::HeightIndex;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    #[default]
    None,
}

/// Half-open row range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VisibleRange {
    pub start: usize,
    pub end: usize,
}

impl VisibleRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }
}

/// Plain snapshot of the controller's window, for the rendering side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScrollState {
    /// Last position reported through [`Controller::handle_scroll`].
    pub scroll_top: f64,
    pub visible_range: VisibleRange,
    pub total_height: f64,
    /// Pixel offset of `visible_range.start`.
    pub offset_top: f64,
    pub is_loading_more: bool,
    pub has_more: bool,
    pub scroll_direction: ScrollDirection,
    pub item_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrollOutcome {
    pub visible_range: VisibleRange,
    pub range_changed: bool,
    /// A load-more request was issued by this call.
    pub load_more_started: bool,
}

type LoadMore<T> = Box<dyn FnMut() -> BoxFuture<'static, Vec<T>> + Send>;

enum Layout {
    Fixed { item_height: f64, len: usize },
    Dynamic(HeightIndex),
}

impl Layout {
    fn total(&self) -> f64 {
        match self {
            Layout::Fixed { item_height, len } => *len as f64 * item_height,
            Layout::Dynamic(heights) => heights.total(),
        }
    }

    fn offset(&self, index: usize) -> f64 {
        match self {
            Layout::Fixed { item_height, len } => index.min(*len) as f64 * item_height,
            Layout::Dynamic(heights) => heights.offset(index),
        }
    }

    fn height(&self, index: usize) -> f64 {
        match self {
            Layout::Fixed { item_height, .. } => *item_height,
            Layout::Dynamic(heights) => heights.height(index),
        }
    }

    fn extend(&mut self, additional: usize) {
        match self {
            Layout::Fixed { len, .. } => *len += additional,
            Layout::Dynamic(heights) => heights.extend(additional),
        }
    }

    fn clear(&mut self) {
        match self {
            Layout::Fixed { len, .. } => *len = 0,
            Layout::Dynamic(heights) => heights.clear(),
        }
    }
}

/// Windowing over a list too long to render in full.
///
/// The controller owns the items and answers which slice must be rendered for
/// a scroll position, plus the offsets needed to fake the full scroll height.
/// Every method is synchronous; a pending infinite-scroll load is completed
/// with [`Controller::poll_load_more`] or [`Controller::finish_load_more`].
pub struct Controller<T> {
    config: ScrollConfig,
    items: Vec<T>,
    layout: Layout,
    scroll_top: f64,
    visible_range: VisibleRange,
    offset_top: f64,
    direction: ScrollDirection,
    has_more: bool,
    load_more: Option<LoadMore<T>>,
    pending: Option<BoxFuture<'static, Vec<T>>>,
    destroyed: bool,
}

impl<T> Controller<T> {
    pub fn new(config: ScrollConfig) -> Result<Self, ScrollConfigError> {
        config.validate()?;
        let layout = if config.dynamic_height {
            Layout::Dynamic(HeightIndex::new(
                config.item_height,
                config.max_measured_heights,
            ))
        } else {
            Layout::Fixed {
                item_height: config.item_height,
                len: 0,
            }
        };
        Ok(Self {
            config,
            items: Vec::new(),
            layout,
            scroll_top: 0.0,
            visible_range: VisibleRange::default(),
            offset_top: 0.0,
            direction: ScrollDirection::None,
            has_more: true,
            load_more: None,
            pending: None,
            destroyed: false,
        })
    }

    pub fn config(&self) -> &ScrollConfig {
        &self.config
    }

    /// Replace the list, or append to it.
    ///
    /// Appending keeps every existing measurement and costs O(new items).
    /// Replacing drops measurements, resets `has_more` and abandons any
    /// in-flight load so stale rows are never appended to the new list.
    pub fn set_items(&mut self, items: impl IntoIterator<Item = T>, append: bool) {
        if self.destroyed {
            return;
        }
        if append {
            let before = self.items.len();
            self.items.extend(items);
            self.layout.extend(self.items.len() - before);
        } else {
            self.items.clear();
            self.items.extend(items);
            self.layout.clear();
            self.layout.extend(self.items.len());
            self.has_more = true;
            if self.pending.take().is_some() {
                log::debug!("list replaced while a load was in flight; dropping its result");
            }
        }
        self.recompute();
    }

    /// Apply a scroll position reported by the host.
    ///
    /// Direction follows the delta from the previous position; an unchanged
    /// position keeps the previous direction so repeated calls are
    /// idempotent. Triggers the load-more callback near the bottom.
    pub fn handle_scroll(&mut self, scroll_top: f64) -> ScrollOutcome {
        if self.destroyed {
            return ScrollOutcome::default();
        }
        let scroll_top = if scroll_top.is_finite() {
            scroll_top
        } else {
            0.0
        };
        if scroll_top > self.scroll_top {
            self.direction = ScrollDirection::Down;
        } else if scroll_top < self.scroll_top {
            self.direction = ScrollDirection::Up;
        }
        self.scroll_top = scroll_top;

        let previous = self.visible_range;
        self.recompute();
        let load_more_started = self.maybe_load_more();
        ScrollOutcome {
            visible_range: self.visible_range,
            range_changed: previous != self.visible_range,
            load_more_started,
        }
    }

    pub fn update_container_height(&mut self, px: f64) -> Result<(), ScrollConfigError> {
        self.config.container_height = check_container_height(px)?;
        if !self.destroyed {
            self.recompute();
        }
        Ok(())
    }

    /// Pixel offset the host should scroll to so `index` is at the top.
    /// Indices past the end clamp to the last row.
    pub fn scroll_to_index(&self, index: usize) -> f64 {
        let len = self.items.len();
        if len == 0 {
            return 0.0;
        }
        self.layout.offset(index.min(len - 1))
    }

    /// Record the rendered height of row `index` (dynamic layouts only).
    ///
    /// Later offsets and the total height absorb the correction; the scroll
    /// position is left alone so the viewport does not jump. Returns the
    /// change in total height.
    pub fn report_measured_height(&mut self, index: usize, px: f64) -> f64 {
        if self.destroyed || !(px.is_finite() && px > 0.0) {
            return 0.0;
        }
        let Layout::Dynamic(heights) = &mut self.layout else {
            return 0.0;
        };
        if index >= self.items.len() {
            return 0.0;
        }
        // An eviction can move earlier offsets while the total stays put.
        let delta = heights.set(index, px);
        self.recompute();
        delta
    }

    /// Register the infinite-scroll producer. An empty page marks the list
    /// as exhausted.
    pub fn set_load_more_callback<F, Fut>(&mut self, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Vec<T>> + Send + 'static,
    {
        if self.destroyed {
            return;
        }
        self.load_more = Some(Box::new(move || callback().boxed()));
    }

    /// Complete an in-flight load if its future is already resolved. Returns
    /// the number of rows appended.
    pub fn poll_load_more(&mut self) -> Option<usize> {
        let items = self.pending.as_mut()?.now_or_never()?;
        self.pending = None;
        Some(self.apply_loaded(items))
    }

    /// Wait for the in-flight load, if any, and append its rows.
    pub async fn finish_load_more(&mut self) -> Option<usize> {
        let pending = self.pending.take()?;
        let items = pending.await;
        Some(self.apply_loaded(items))
    }

    /// Release all buffers. Terminal and idempotent: afterwards every
    /// operation is a no-op.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.items = Vec::new();
        self.layout.clear();
        self.load_more = None;
        self.pending = None;
        self.visible_range = VisibleRange::default();
        self.offset_top = 0.0;
        self.has_more = false;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn state(&self) -> ScrollState {
        ScrollState {
            scroll_top: self.scroll_top,
            visible_range: self.visible_range,
            total_height: self.layout.total(),
            offset_top: self.offset_top,
            is_loading_more: self.pending.is_some(),
            has_more: self.has_more,
            scroll_direction: self.direction,
            item_count: self.items.len(),
        }
    }

    pub fn visible_range(&self) -> VisibleRange {
        self.visible_range
    }

    pub fn visible_items(&self) -> &[T] {
        &self.items[self.visible_range.start..self.visible_range.end]
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_height(&self) -> f64 {
        self.layout.total()
    }

    pub fn item_offset(&self, index: usize) -> Option<f64> {
        (index < self.items.len()).then(|| self.layout.offset(index))
    }

    pub fn item_height(&self, index: usize) -> Option<f64> {
        (index < self.items.len()).then(|| self.layout.height(index))
    }

    fn apply_loaded(&mut self, items: Vec<T>) -> usize {
        let count = items.len();
        self.has_more = count > 0;
        log::debug!("infinite scroll appended {count} rows");
        self.set_items(items, true);
        count
    }

    fn maybe_load_more(&mut self) -> bool {
        if !self.config.infinite_scroll || !self.has_more || self.pending.is_some() {
            return false;
        }
        let Some(callback) = self.load_more.as_mut() else {
            return false;
        };
        let bottom = self.scroll_top + self.config.container_height;
        if bottom < self.layout.total() - self.config.load_more_threshold {
            return false;
        }
        self.pending = Some(callback());
        true
    }

    fn recompute(&mut self) {
        let len = self.items.len();
        if len == 0 {
            self.visible_range = VisibleRange::default();
            self.offset_top = 0.0;
            return;
        }

        let container = self.config.container_height;
        let buffer = self.config.buffer_size;
        let max_top = (self.layout.total() - container).max(0.0);
        let top = self.scroll_top.clamp(0.0, max_top);

        let (start, end) = match &self.layout {
            Layout::Fixed { item_height, .. } => {
                let first = ((top / item_height).floor() as usize).min(len - 1);
                let start = first.saturating_sub(buffer);
                let rows = (container / item_height).ceil() as usize;
                let end = start.saturating_add(rows.saturating_add(2 * buffer)).min(len);
                (start, end)
            }
            Layout::Dynamic(heights) => {
                let first = heights.index_at(top);
                let last = heights.index_at(top + container);
                let start = first.saturating_sub(buffer);
                let end = (last + 1).saturating_add(buffer).min(len);
                (start, end)
            }
        };
        let end = end.max(start + 1);
        self.visible_range = VisibleRange { start, end };
        self.offset_top = self.layout.offset(start);
    }
}

impl<T> fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
