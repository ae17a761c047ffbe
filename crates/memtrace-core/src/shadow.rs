//! Thread-local shadow call-stack recorder.
//!
//! A manually instrumented mirror of the real call stack, used when native
//! unwinding is unavailable, too slow, or disabled. Every field is
//! thread-local, so no locking is needed by construction.
//!
//! Annotations are short-lived strings attached to the top frame through a
//! bounded per-thread ring. When the ring is full the push is silently
//! skipped and a skip counter increments so the matching pop is absorbed
//! instead of corrupting the stack; that degrade-gracefully behavior is
//! intentional, and [`ShadowStack::skipped_annotations`] exposes the running
//! total so the data loss is observable.

use std::cell::RefCell;

/// Maximum shadow frames per thread; exceeding this is a fatal misuse.
pub const MAX_SHADOW_DEPTH: usize = 96;

/// Bounded annotation slots per thread.
pub const ANNOTATION_RING_CAPACITY: usize = 32;

/// One recorded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub name: &'static str,
    pub file: &'static str,
    pub line: u32,
    /// Marks a short-lived scope (per-iteration or per-item frames).
    pub transient: bool,
    /// Ring slot of the frame's current annotation.
    annotation: Option<u8>,
}

/// Annotation ring entry: the text, the annotation it shadowed on the same
/// frame (restored on pop), and the stack index of the owning frame.
struct Annotation {
    text: String,
    prev: Option<u8>,
    frame: usize,
}

/// Per-thread shadow stack with bounded annotation ring.
pub struct ShadowStack {
    frames: Vec<FrameInfo>,
    ring: Vec<Annotation>,
    /// Pushes skipped because the ring was full; matching pops are absorbed.
    skipped: u64,
    /// Lifetime total of skipped pushes (never decremented).
    skipped_total: u64,
}

impl ShadowStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(MAX_SHADOW_DEPTH),
            ring: Vec::with_capacity(ANNOTATION_RING_CAPACITY),
            skipped: 0,
            skipped_total: 0,
        }
    }

    /// Push a frame at scope entry. Fatal on overflow.
    pub fn push(&mut self, name: &'static str, file: &'static str, line: u32, transient: bool) {
        assert!(
            self.frames.len() < MAX_SHADOW_DEPTH,
            "shadow stack overflow at {name} ({file}:{line})"
        );
        self.frames.push(FrameInfo {
            name,
            file,
            line,
            transient,
            annotation: None,
        });
    }

    /// Pop the top frame at scope exit. Fatal on underflow.
    pub fn pop(&mut self) {
        assert!(!self.frames.is_empty(), "shadow stack underflow on pop");
        self.frames.pop();
    }

    /// Current depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frame at `index_from_top` (0 = top). Fatal if out of range.
    #[must_use]
    pub fn frame(&self, index_from_top: usize) -> FrameInfo {
        assert!(
            index_from_top < self.frames.len(),
            "shadow frame index {index_from_top} out of range (depth {})",
            self.frames.len()
        );
        self.frames[self.frames.len() - 1 - index_from_top]
    }

    /// Up to `max` frames, top (leaf) first.
    #[must_use]
    pub fn top_frames(&self, max: usize) -> Vec<FrameInfo> {
        self.frames.iter().rev().take(max).copied().collect()
    }

    /// Attach a short-lived annotation to the top frame.
    ///
    /// Silently skipped (and counted) when the ring is full. Fatal without a
    /// frame to attach to.
    pub fn push_annotation(&mut self, text: &str) {
        assert!(
            !self.frames.is_empty(),
            "annotation pushed with no shadow frame on the stack"
        );
        if self.ring.len() >= ANNOTATION_RING_CAPACITY {
            self.skipped += 1;
            self.skipped_total += 1;
            return;
        }
        let slot = self.ring.len() as u8;
        let frame = self.frames.len() - 1;
        let top = self.frames.last_mut().expect("non-empty checked above");
        self.ring.push(Annotation {
            text: text.to_string(),
            prev: top.annotation,
            frame,
        });
        top.annotation = Some(slot);
    }

    /// Detach the most recent annotation, restoring the owning frame's
    /// previous one. The owning frame need not be the top frame: a pop that
    /// straddles a nested frame still lands on the frame the push annotated.
    ///
    /// Absorbs the pop silently if the matching push was skipped; fatal when
    /// there is nothing to balance at all.
    pub fn pop_annotation(&mut self) {
        if self.skipped > 0 {
            self.skipped -= 1;
            return;
        }
        let entry = self
            .ring
            .pop()
            .unwrap_or_else(|| panic!("annotation pop with no matching push"));
        if let Some(owner) = self.frames.get_mut(entry.frame) {
            owner.annotation = entry.prev;
        }
    }

    /// Annotation text currently attached to `frame`, if any.
    #[must_use]
    pub fn annotation_text(&self, frame: &FrameInfo) -> Option<&str> {
        frame
            .annotation
            .map(|slot| self.ring[slot as usize].text.as_str())
    }

    /// Lifetime count of annotation pushes dropped under ring exhaustion.
    #[must_use]
    pub fn skipped_annotations(&self) -> u64 {
        self.skipped_total
    }

    /// Human-readable chain, top frame first: `leaf <- caller <- root`.
    #[must_use]
    pub fn render_chain(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.frames.iter().rev().enumerate() {
            if i > 0 {
                out.push_str(" <- ");
            }
            out.push_str(frame.name);
            out.push_str(&format!(" ({}:{})", frame.file, frame.line));
            if let Some(text) = self.annotation_text(frame) {
                out.push_str(&format!(" [{text}]"));
            }
        }
        out
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static SHADOW_STACK: RefCell<ShadowStack> = RefCell::new(ShadowStack::new());
}

/// Access the calling thread's shadow stack.
pub fn with_shadow<F, R>(f: F) -> R
where
    F: FnOnce(&mut ShadowStack) -> R,
{
    SHADOW_STACK.with(|stack| f(&mut stack.borrow_mut()))
}

/// RAII frame: pushed on construction, popped on drop.
pub struct ShadowFrameGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ShadowFrameGuard {
    /// Push a frame on the current thread's shadow stack.
    pub fn enter(name: &'static str, file: &'static str, line: u32, transient: bool) -> Self {
        with_shadow(|stack| stack.push(name, file, line, transient));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for ShadowFrameGuard {
    fn drop(&mut self) {
        with_shadow(ShadowStack::pop);
    }
}

/// Record the enclosing scope on the shadow stack until end of scope.
#[macro_export]
macro_rules! shadow_scope {
    ($name:expr) => {
        let _shadow_frame =
            $crate::shadow::ShadowFrameGuard::enter($name, file!(), line!(), false);
    };
    ($name:expr, transient) => {
        let _shadow_frame =
            $crate::shadow::ShadowFrameGuard::enter($name, file!(), line!(), true);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let mut s = ShadowStack::new();
        s.push("a", "a.rs", 1, false);
        s.push("b", "b.rs", 2, false);
        s.push("c", "c.rs", 3, true);
        assert_eq!(s.depth(), 3);
        assert_eq!(s.frame(0).name, "c");
        assert!(s.frame(0).transient);
        assert!(!s.frame(1).transient);
        assert_eq!(s.frame(1).name, "b");
        assert_eq!(s.frame(2).name, "a");
        s.pop();
        assert_eq!(s.frame(0).name, "b");
        s.pop();
        s.pop();
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn net_depth_equals_net_push_count() {
        let mut s = ShadowStack::new();
        for i in 0..40 {
            s.push("f", "f.rs", i, false);
        }
        for _ in 0..25 {
            s.pop();
        }
        assert_eq!(s.depth(), 15);
    }

    #[test]
    #[should_panic(expected = "shadow stack overflow")]
    fn overflow_is_fatal() {
        let mut s = ShadowStack::new();
        for i in 0..=MAX_SHADOW_DEPTH as u32 {
            s.push("deep", "deep.rs", i, false);
        }
    }

    #[test]
    #[should_panic(expected = "shadow stack underflow")]
    fn underflow_is_fatal() {
        let mut s = ShadowStack::new();
        s.pop();
    }

    #[test]
    fn annotation_attaches_to_top_frame() {
        let mut s = ShadowStack::new();
        s.push("f", "f.rs", 1, false);
        s.push_annotation("loading level 3");
        let top = s.frame(0);
        assert_eq!(s.annotation_text(&top), Some("loading level 3"));
        s.pop_annotation();
        let top = s.frame(0);
        assert_eq!(s.annotation_text(&top), None);
    }

    #[test]
    fn nested_annotations_restore_previous() {
        let mut s = ShadowStack::new();
        s.push("f", "f.rs", 1, false);
        s.push_annotation("outer");
        s.push_annotation("inner");
        assert_eq!(s.annotation_text(&s.frame(0)), Some("inner"));
        s.pop_annotation();
        assert_eq!(s.annotation_text(&s.frame(0)), Some("outer"));
        s.pop_annotation();
        assert_eq!(s.annotation_text(&s.frame(0)), None);
    }

    #[test]
    fn ring_exhaustion_skips_and_stays_balanced() {
        let mut s = ShadowStack::new();
        s.push("f", "f.rs", 1, false);
        let extra = 5;
        for i in 0..ANNOTATION_RING_CAPACITY + extra {
            s.push_annotation(&format!("a{i}"));
        }
        assert_eq!(s.skipped_annotations(), extra as u64);
        // The visible annotation is the last one that fit.
        let expected = format!("a{}", ANNOTATION_RING_CAPACITY - 1);
        assert_eq!(s.annotation_text(&s.frame(0)), Some(expected.as_str()));

        // Every pop balances: the skipped ones are absorbed first.
        for _ in 0..ANNOTATION_RING_CAPACITY + extra {
            s.pop_annotation();
        }
        assert_eq!(s.annotation_text(&s.frame(0)), None);
        assert_eq!(s.skipped_annotations(), extra as u64);
        s.pop();
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn pop_under_nested_frame_clears_the_owning_frame() {
        let mut s = ShadowStack::new();
        s.push("outer", "o.rs", 1, false);
        s.push_annotation("held across a call");
        s.push("inner", "i.rs", 2, false);

        // Balanced pop while a nested frame is on top: the annotation must
        // come off "outer", not "inner".
        s.pop_annotation();
        assert_eq!(s.annotation_text(&s.frame(0)), None);
        assert_eq!(s.annotation_text(&s.frame(1)), None);
        assert_eq!(s.render_chain(), "inner (i.rs:2) <- outer (o.rs:1)");

        s.pop();
        assert_eq!(s.annotation_text(&s.frame(0)), None);
        s.pop();
    }

    #[test]
    fn pop_under_nested_frame_restores_the_owners_previous() {
        let mut s = ShadowStack::new();
        s.push("outer", "o.rs", 1, false);
        s.push_annotation("first");
        s.push_annotation("second");
        s.push("inner", "i.rs", 2, false);

        s.pop_annotation();
        assert_eq!(s.annotation_text(&s.frame(1)), Some("first"));

        s.pop();
        assert_eq!(s.annotation_text(&s.frame(0)), Some("first"));
        s.pop_annotation();
        assert_eq!(s.annotation_text(&s.frame(0)), None);
        s.pop();
    }

    #[test]
    #[should_panic(expected = "no matching push")]
    fn unbalanced_annotation_pop_is_fatal() {
        let mut s = ShadowStack::new();
        s.push("f", "f.rs", 1, false);
        s.pop_annotation();
    }

    #[test]
    fn render_chain_lists_leaf_first() {
        let mut s = ShadowStack::new();
        s.push("root", "main.rs", 10, false);
        s.push("update", "world.rs", 20, false);
        s.push_annotation("entity 42");
        let chain = s.render_chain();
        assert_eq!(
            chain,
            "update (world.rs:20) [entity 42] <- root (main.rs:10)"
        );
    }

    #[test]
    fn top_frames_respects_bound() {
        let mut s = ShadowStack::new();
        for i in 0..10 {
            s.push("f", "f.rs", i, false);
        }
        let frames = s.top_frames(4);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].line, 9);
        assert_eq!(frames[3].line, 6);
    }

    #[test]
    fn guard_pops_on_drop() {
        with_shadow(|s| assert_eq!(s.depth(), 0));
        {
            let _g = ShadowFrameGuard::enter("scoped", "t.rs", 1, false);
            with_shadow(|s| assert_eq!(s.depth(), 1));
            {
                shadow_scope!("inner");
                with_shadow(|s| assert_eq!(s.depth(), 2));
            }
            with_shadow(|s| assert_eq!(s.depth(), 1));
        }
        with_shadow(|s| assert_eq!(s.depth(), 0));
    }
}
