//! The batch runner: nested transaction frames, flush bookkeeping, and the
//! transition-completion tracker.
//!
//! The runloop itself is bookkeeping only — the runtime drives the actual
//! flush (store `apply_changes`, dependant dispatch, deferred tasks)
//! because those steps need the stores and the view tree. A frame opened
//! while another is active nests: only popping the outermost frame
//! triggers a flush.

use crate::render::NodeId;

/// One batch frame.
pub struct Frame<T> {
    /// Stores (by instance id) touched during this frame.
    pub touched: Vec<usize>,
    /// View items that marked themselves dirty and need a render-time
    /// `update()`.
    pub dirty_items: Vec<usize>,
    /// Tasks to run after store changes and view updates.
    pub deferred: Vec<T>,
    /// Nodes whose detachment waits for this frame's transitions.
    pub detach_queue: Vec<NodeId>,
    /// Transitions registered during this frame.
    pub transitions: Vec<PendingTransition>,
}

impl<T> Default for Frame<T> {
    fn default() -> Self {
        Frame {
            touched: Vec::new(),
            dirty_items: Vec::new(),
            deferred: Vec::new(),
            detach_queue: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

/// A running transition; completion releases queued detachments.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransition {
    /// The node the transition animates.
    pub node: NodeId,
    /// Remaining ticker time.
    pub remaining: f64,
    /// Nodes detached when this transition completes.
    pub detach_on_complete: Vec<NodeId>,
}

/// The scheduler's frame stack.
pub struct Runloop<T> {
    frames: Vec<Frame<T>>,
    /// Transitions still running after their frame flushed.
    pub active_transitions: Vec<PendingTransition>,
    next_flush: u64,
}

impl<T> Default for Runloop<T> {
    fn default() -> Self {
        Runloop {
            frames: Vec::new(),
            active_transitions: Vec::new(),
            next_flush: 0,
        }
    }
}

impl<T> Runloop<T> {
    /// Open a new frame; returns the nesting depth (1 = outermost).
    pub fn start(&mut self) -> usize {
        self.frames.push(Frame::default());
        self.frames.len()
    }

    /// Whether any frame is active.
    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Close the current frame.
    ///
    /// A nested frame folds its bookkeeping into its parent and returns
    /// `None`; the outermost frame is returned for the runtime to flush.
    pub fn end(&mut self) -> Option<Frame<T>> {
        let frame = self.frames.pop()?;
        match self.frames.last_mut() {
            Some(parent) => {
                parent.touched.extend(frame.touched);
                parent.dirty_items.extend(frame.dirty_items);
                parent.deferred.extend(frame.deferred);
                parent.detach_queue.extend(frame.detach_queue);
                parent.transitions.extend(frame.transitions);
                None
            }
            None => Some(frame),
        }
    }

    /// Re-open a frame popped by [`end`](Self::end) so the flush driver can
    /// keep collecting bookkeeping while it runs.
    pub fn resume(&mut self, frame: Frame<T>) {
        self.frames.push(frame);
    }

    /// Drain the current frame's dirty-item queue.
    pub fn take_dirty(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.current().dirty_items)
    }

    /// Drain the current frame's deferred tasks.
    pub fn take_deferred(&mut self) -> Vec<T> {
        std::mem::take(&mut self.current().deferred)
    }

    /// Allocate the id for an outermost flush.
    pub fn next_flush_id(&mut self) -> u64 {
        let id = self.next_flush;
        self.next_flush += 1;
        id
    }

    fn current(&mut self) -> &mut Frame<T> {
        self.frames
            .last_mut()
            .expect("runloop frame must be active")
    }

    /// Record a touched store.
    pub fn touch(&mut self, instance: usize) {
        let frame = self.current();
        if !frame.touched.contains(&instance) {
            frame.touched.push(instance);
        }
    }

    /// Queue an item for a render-time `update()`.
    pub fn mark_dirty(&mut self, item: usize) {
        let frame = self.current();
        if !frame.dirty_items.contains(&item) {
            frame.dirty_items.push(item);
        }
    }

    /// Queue a deferred task for the end of the flush round.
    pub fn defer(&mut self, task: T) {
        self.current().deferred.push(task);
    }

    /// Queue a node for detachment once this frame's transitions finish.
    pub fn queue_detach(&mut self, node: NodeId) {
        self.current().detach_queue.push(node);
    }

    /// Register a transition on the current frame.
    pub fn add_transition(&mut self, transition: PendingTransition) {
        self.current().transitions.push(transition);
    }

    /// Advance active transitions by `dt`; returns every node now due for
    /// detachment.
    pub fn advance_transitions(&mut self, dt: f64) -> Vec<NodeId> {
        let mut due = Vec::new();
        self.active_transitions.retain_mut(|t| {
            t.remaining -= dt;
            if t.remaining <= 0.0 {
                due.append(&mut t.detach_on_complete);
                false
            } else {
                true
            }
        });
        due
    }

    /// Cancel any transition on `node`: its registration stops and its
    /// completion fires immediately, but its finish side effects (the
    /// queued detachments) do not run.
    pub fn cancel_transition(&mut self, node: NodeId) {
        self.active_transitions.retain(|t| t.node != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_frames_fold_into_parent() {
        let mut loop_: Runloop<()> = Runloop::default();
        assert_eq!(loop_.start(), 1);
        loop_.touch(0);
        assert_eq!(loop_.start(), 2);
        loop_.touch(1);
        assert!(loop_.end().is_none());
        let frame = loop_.end().expect("outermost frame flushes");
        assert_eq!(frame.touched, vec![0, 1]);
        assert!(!loop_.is_active());
    }

    #[test]
    fn touch_deduplicates() {
        let mut loop_: Runloop<()> = Runloop::default();
        loop_.start();
        loop_.touch(3);
        loop_.touch(3);
        let frame = loop_.end().unwrap();
        assert_eq!(frame.touched, vec![3]);
    }

    #[test]
    fn transitions_complete_and_release_detachments() {
        let mut loop_: Runloop<()> = Runloop::default();
        loop_.active_transitions.push(PendingTransition {
            node: 1,
            remaining: 2.0,
            detach_on_complete: vec![1],
        });
        assert!(loop_.advance_transitions(1.0).is_empty());
        assert_eq!(loop_.advance_transitions(1.5), vec![1]);
        assert!(loop_.active_transitions.is_empty());
    }

    #[test]
    fn cancellation_skips_finish_effects() {
        let mut loop_: Runloop<()> = Runloop::default();
        loop_.active_transitions.push(PendingTransition {
            node: 1,
            remaining: 2.0,
            detach_on_complete: vec![1],
        });
        loop_.cancel_transition(1);
        assert!(loop_.advance_transitions(10.0).is_empty());
    }
}
