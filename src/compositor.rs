//! Two-document compositing while a transition is open.
//!
//! The outgoing and incoming documents are independent render roots under a
//! single compositor. Each root is its own stacking context and is clipped to
//! the viewport, so translating one root never grows its footprint: it uncovers
//! whatever the other root paints underneath.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::Viewport;

/// Frames kept for inspection. Older frames fall off the front.
const PAINT_LOG_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DocumentId(pub u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_viewport(viewport: Viewport) -> Self {
        Self::new(0.0, 0.0, viewport.width, viewport.height)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect::new(left, top, right - left, bottom - top))
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Outgoing,
    Incoming,
}

impl Slot {
    /// Render roots as named by page script.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "outgoing" => Some(Slot::Outgoing),
            "incoming" => Some(Slot::Incoming),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerContent {
    Document(DocumentId),
    /// Author-inserted stand-in shown before the real incoming content.
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaintedLayer {
    pub slot: Slot,
    pub content: LayerContent,
    pub z_index: i32,
    pub clip: Rect,
}

/// One composited frame, layers ordered bottom to top.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub sequence: u64,
    pub layers: Vec<PaintedLayer>,
}

impl Frame {
    pub fn shows(&self, content: &LayerContent) -> bool {
        self.layers.iter().any(|layer| &layer.content == content)
    }

    pub fn top(&self) -> Option<&PaintedLayer> {
        self.layers.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    Single,
    Dual,
}

#[derive(Debug, Default)]
struct GateState {
    holds: usize,
    taken: usize,
    open: bool,
}

/// Withholds the incoming document's real content from paint until every
/// holder has let go.
#[derive(Debug, Clone, Default)]
pub struct RevealGate {
    state: Rc<RefCell<GateState>>,
}

impl RevealGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> RevealHold {
        let mut state = self.state.borrow_mut();
        state.holds += 1;
        state.taken += 1;
        RevealHold {
            gate: Some(self.clone()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    fn release(&self) {
        let mut state = self.state.borrow_mut();
        state.holds = state.holds.saturating_sub(1);
        if state.holds == 0 && state.taken > 0 && !state.open {
            state.open = true;
            debug!(target: "compositor", "incoming content released for paint");
        }
    }
}

/// Releases its gate when released explicitly or dropped.
#[derive(Debug)]
pub struct RevealHold {
    gate: Option<RevealGate>,
}

impl RevealHold {
    pub fn release(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for RevealHold {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RenderRoot {
    document: Option<DocumentId>,
    placeholder: Option<String>,
    z_index: i32,
    offset: (f32, f32),
}

impl RenderRoot {
    fn showing(document: DocumentId) -> Self {
        Self {
            document: Some(document),
            ..Self::default()
        }
    }
}

pub struct DocumentCompositor {
    viewport: Rect,
    mode: CompositeMode,
    outgoing: RenderRoot,
    incoming: RenderRoot,
    gate: RevealGate,
    sequence: u64,
    paint_log: VecDeque<Frame>,
}

impl DocumentCompositor {
    pub fn new(viewport: Viewport, document: DocumentId) -> Self {
        Self {
            viewport: Rect::from_viewport(viewport),
            mode: CompositeMode::Single,
            outgoing: RenderRoot::showing(document),
            incoming: RenderRoot::default(),
            gate: RevealGate::new(),
            sequence: 0,
            paint_log: VecDeque::new(),
        }
    }

    pub fn shared(viewport: Viewport, document: DocumentId) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(viewport, document)))
    }

    /// Switch to dual-root rendering with an empty incoming root. The returned
    /// gate controls when the incoming document may be painted.
    pub fn begin_transition(&mut self) -> RevealGate {
        debug!(target: "compositor", "entering dual-document compositing");
        self.mode = CompositeMode::Dual;
        self.incoming = RenderRoot::default();
        self.gate = RevealGate::new();
        self.gate.clone()
    }

    pub fn mode(&self) -> CompositeMode {
        self.mode
    }

    pub fn is_compositing(&self) -> bool {
        self.mode == CompositeMode::Dual
    }

    pub fn viewport(&self) -> Rect {
        self.viewport
    }

    pub fn current_document(&self) -> Option<DocumentId> {
        self.outgoing.document
    }

    /// The incoming document finished loading. It stays invisible until the
    /// reveal gate opens.
    pub fn attach_incoming(&mut self, document: DocumentId) {
        if !self.is_compositing() {
            return;
        }
        self.incoming.document = Some(document);
    }

    pub fn insert_placeholder(&mut self, content: impl Into<String>) {
        if !self.is_compositing() {
            return;
        }
        self.incoming.placeholder = Some(content.into());
    }

    pub fn set_z_index(&mut self, slot: Slot, z_index: i32) {
        self.root_mut(slot).z_index = z_index;
    }

    pub fn set_offset(&mut self, slot: Slot, dx: f32, dy: f32) {
        self.root_mut(slot).offset = (dx, dy);
    }

    pub fn incoming_revealed(&self) -> bool {
        self.is_compositing() && self.gate.is_open() && self.incoming.document.is_some()
    }

    /// Composite the current state and append it to the paint log.
    pub fn paint(&mut self) -> Frame {
        self.sequence += 1;
        let frame = Frame {
            sequence: self.sequence,
            layers: self.layers(),
        };
        trace!(target: "compositor", sequence = frame.sequence, layers = frame.layers.len(), "painted frame");
        if self.paint_log.len() == PAINT_LOG_LIMIT {
            self.paint_log.pop_front();
        }
        self.paint_log.push_back(frame.clone());
        frame
    }

    /// The most recent frames, oldest first.
    pub fn paint_log(&self) -> Vec<Frame> {
        self.paint_log.iter().cloned().collect()
    }

    pub fn take_paint_log(&mut self) -> Vec<Frame> {
        self.paint_log.drain(..).collect()
    }

    /// Which root is visible at the given viewport point.
    pub fn hit_test(&self, x: f32, y: f32) -> Option<Slot> {
        self.layers()
            .iter()
            .rev()
            .find(|layer| layer.clip.contains(x, y))
            .map(|layer| layer.slot)
    }

    /// Drop back to single-document rendering of `survivor`. Falls back to
    /// the outgoing document when the incoming one never arrived.
    pub fn revert(&mut self, survivor: Slot) {
        if !self.is_compositing() {
            return;
        }
        let document = match survivor {
            Slot::Incoming => self.incoming.document.or(self.outgoing.document),
            Slot::Outgoing => self.outgoing.document,
        };
        debug!(target: "compositor", ?survivor, "reverting to single-document rendering");
        self.mode = CompositeMode::Single;
        self.outgoing = document.map(RenderRoot::showing).unwrap_or_default();
        self.incoming = RenderRoot::default();
    }

    /// Show `document` alone, e.g. once the pipeline has switched to it.
    pub fn present(&mut self, document: DocumentId) {
        self.mode = CompositeMode::Single;
        self.outgoing = RenderRoot::showing(document);
        self.incoming = RenderRoot::default();
    }

    fn root_mut(&mut self, slot: Slot) -> &mut RenderRoot {
        match slot {
            Slot::Outgoing => &mut self.outgoing,
            Slot::Incoming => &mut self.incoming,
        }
    }

    fn layers(&self) -> Vec<PaintedLayer> {
        let mut layers = Vec::with_capacity(2);
        if let Some(layer) = self.layer_for(Slot::Outgoing, &self.outgoing) {
            layers.push(layer);
        }
        if self.is_compositing() {
            if let Some(layer) = self.layer_for(Slot::Incoming, &self.incoming) {
                layers.push(layer);
            }
        }

        // Stable sort keeps outgoing first on a tie, so incoming paints on top.
        layers.sort_by_key(|layer| layer.z_index);
        layers
    }

    fn layer_for(&self, slot: Slot, root: &RenderRoot) -> Option<PaintedLayer> {
        let content = match slot {
            Slot::Outgoing => LayerContent::Document(root.document?),
            Slot::Incoming => match (root.document, &root.placeholder) {
                (Some(document), _) if self.gate.is_open() => LayerContent::Document(document),
                (_, Some(placeholder)) => LayerContent::Placeholder(placeholder.clone()),
                _ => return None,
            },
        };

        let (dx, dy) = if self.is_compositing() {
            root.offset
        } else {
            (0.0, 0.0)
        };
        let clip = self.viewport.translate(dx, dy).intersect(&self.viewport)?;

        Some(PaintedLayer {
            slot,
            content,
            z_index: if self.is_compositing() { root.z_index } else { 0 },
            clip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: DocumentId = DocumentId(1);
    const NEW: DocumentId = DocumentId(2);

    fn compositor() -> DocumentCompositor {
        DocumentCompositor::new(
            Viewport {
                width: 100.0,
                height: 50.0,
            },
            OLD,
        )
    }

    #[test]
    fn single_mode_paints_only_current_document() {
        let mut compositor = compositor();
        let frame = compositor.paint();
        assert_eq!(frame.layers.len(), 1);
        assert_eq!(frame.layers[0].content, LayerContent::Document(OLD));
        assert_eq!(frame.layers[0].clip, Rect::new(0.0, 0.0, 100.0, 50.0));
    }

    #[test]
    fn incoming_is_withheld_until_gate_opens() {
        let mut compositor = compositor();
        let gate = compositor.begin_transition();
        let hold = gate.hold();
        compositor.attach_incoming(NEW);

        assert!(!compositor.paint().shows(&LayerContent::Document(NEW)));
        assert!(!compositor.incoming_revealed());

        hold.release();
        assert!(compositor.incoming_revealed());
        assert!(compositor.paint().shows(&LayerContent::Document(NEW)));
    }

    #[test]
    fn gate_needs_every_hold_released() {
        let gate = RevealGate::new();
        let first = gate.hold();
        let second = gate.hold();
        first.release();
        assert!(!gate.is_open());
        drop(second);
        assert!(gate.is_open());
    }

    #[test]
    fn placeholder_paints_before_reveal() {
        let mut compositor = compositor();
        let _gate = compositor.begin_transition();
        compositor.insert_placeholder("skeleton");
        compositor.attach_incoming(NEW);

        let frame = compositor.paint();
        assert_eq!(
            frame.top().map(|layer| &layer.content),
            Some(&LayerContent::Placeholder("skeleton".into()))
        );
        assert!(!frame.shows(&LayerContent::Document(NEW)));
    }

    #[test]
    fn higher_z_index_paints_on_top_and_ties_favor_incoming() {
        let mut compositor = compositor();
        let gate = compositor.begin_transition();
        compositor.attach_incoming(NEW);
        gate.hold().release();

        let frame = compositor.paint();
        assert_eq!(frame.top().map(|layer| layer.slot), Some(Slot::Incoming));

        compositor.set_z_index(Slot::Outgoing, 5);
        let frame = compositor.paint();
        assert_eq!(frame.top().map(|layer| layer.slot), Some(Slot::Outgoing));
    }

    #[test]
    fn translated_root_is_clipped_and_reveals_the_other() {
        let mut compositor = compositor();
        let gate = compositor.begin_transition();
        compositor.attach_incoming(NEW);
        gate.hold().release();
        compositor.set_z_index(Slot::Outgoing, 1);
        compositor.set_offset(Slot::Outgoing, -60.0, 0.0);

        let frame = compositor.paint();
        let outgoing = frame
            .layers
            .iter()
            .find(|layer| layer.slot == Slot::Outgoing)
            .unwrap();
        assert_eq!(outgoing.clip, Rect::new(0.0, 0.0, 40.0, 50.0));

        assert_eq!(compositor.hit_test(10.0, 10.0), Some(Slot::Outgoing));
        assert_eq!(compositor.hit_test(70.0, 10.0), Some(Slot::Incoming));
    }

    #[test]
    fn root_moved_fully_offscreen_is_not_painted() {
        let mut compositor = compositor();
        let _gate = compositor.begin_transition();
        compositor.set_offset(Slot::Outgoing, 0.0, 500.0);
        assert!(compositor.paint().layers.is_empty());
    }

    #[test]
    fn revert_returns_to_single_document() {
        let mut compositor = compositor();
        let _gate = compositor.begin_transition();
        compositor.attach_incoming(NEW);
        compositor.set_offset(Slot::Outgoing, -30.0, 0.0);

        compositor.revert(Slot::Outgoing);
        assert_eq!(compositor.mode(), CompositeMode::Single);
        let frame = compositor.paint();
        assert_eq!(frame.layers.len(), 1);
        assert_eq!(frame.layers[0].content, LayerContent::Document(OLD));
        assert_eq!(frame.layers[0].clip, compositor.viewport());

        compositor.present(NEW);
        assert_eq!(compositor.current_document(), Some(NEW));
    }

    #[test]
    fn paint_log_keeps_only_recent_frames() {
        let mut compositor = compositor();
        for _ in 0..PAINT_LOG_LIMIT + 10 {
            compositor.paint();
        }

        let log = compositor.paint_log();
        assert_eq!(log.len(), PAINT_LOG_LIMIT);
        assert_eq!(log.first().map(|frame| frame.sequence), Some(11));

        let taken = compositor.take_paint_log();
        assert_eq!(taken.len(), PAINT_LOG_LIMIT);
        assert!(compositor.paint_log().is_empty());
        assert_eq!(compositor.paint().sequence, PAINT_LOG_LIMIT as u64 + 11);
    }

    #[test]
    fn revert_to_missing_incoming_keeps_outgoing() {
        let mut compositor = compositor();
        let _gate = compositor.begin_transition();
        compositor.revert(Slot::Incoming);
        assert_eq!(compositor.current_document(), Some(OLD));
    }
}
