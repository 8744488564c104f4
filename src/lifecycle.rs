//! Hierarchical start/stop protocol.
//!
//! Every long-running component owns a [`LifecycleNode`] and implements [`Lifecycle`].
//! Nodes form a tree: a parent keeps weak back-references to its children and a child
//! keeps a weak reference to its parent, so the tree never owns anything and a
//! component can be dropped at any time (its node detaches itself on drop).
//!
//! # Stop contract
//!
//! Stopping is a two-phase protocol shared by every component:
//!
//! 1. [`LifecycleNode::request_stop`] flips the node into `Stopping` and wakes every
//!    thread blocked in [`LifecycleNode::cancellable_wait_until`]. Only the first caller
//!    gets `true` back and becomes responsible for the cleanup.
//! 2. The responsible party cascades the stop to the children
//!    ([`LifecycleNode::cascade_stop`]), releases its own resources, and finally calls
//!    [`LifecycleNode::signal_stopped`], which returns the node to `Idle` and releases
//!    every caller parked in [`LifecycleNode::wait_stopped`].
//!
//! ```rust,ignore
//! fn stop(&self) {
//!     if !self.node.request_stop() {
//!         self.node.wait_stopped();
//!         return;
//!     }
//!     self.node.cascade_stop();
//!     self.release_resources();
//!     self.node.signal_stopped();
//! }
//! ```
//!
//! Components whose cleanup happens on a worker thread (the schedulers) call
//! [`LifecycleNode::stop`] instead, which requests the stop and waits for the worker to
//! signal completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// A component taking part in the hierarchical start/stop protocol.
pub trait Lifecycle: Send + Sync {
    /// The node carrying this component's lifecycle state.
    fn node(&self) -> &Arc<LifecycleNode>;

    /// Start the component. Returns `false` if it was already running or failed to start.
    fn start(&self) -> bool;

    /// Stop the component and its subtree. Returns once everything has stopped.
    fn stop(&self);
}

/// Outcome of a [`LifecycleNode::cancellable_wait_until`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline passed.
    Elapsed,
    /// A stop was requested before the deadline.
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
}

struct State {
    phase: Phase,
    /// Bumped every time a stop cycle completes.
    generation: u64,
}

struct ChildEntry {
    id: u64,
    component: Weak<dyn Lifecycle>,
}

/// Start/stop state machine with parent and child links.
///
/// The node is restartable: after a full stop cycle it is back in its initial state and
/// `start` succeeds again.
pub struct LifecycleNode {
    id: u64,
    name: String,
    state: Mutex<State>,
    /// Woken when a stop is requested.
    stopping: Condvar,
    /// Woken when a stop cycle completes.
    stopped: Condvar,
    parent: Mutex<Weak<LifecycleNode>>,
    children: Mutex<Vec<ChildEntry>>,
}

impl LifecycleNode {
    /// Create a detached node.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(State {
                phase: Phase::Idle,
                generation: 0,
            }),
            stopping: Condvar::new(),
            stopped: Condvar::new(),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Unique id of this node within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transition to running. Fails if the node is already running (or stopping).
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return false;
        }
        state.phase = Phase::Running;
        true
    }

    /// True between a successful `start` and the end of the matching stop cycle.
    pub fn is_running(&self) -> bool {
        self.state.lock().phase != Phase::Idle
    }

    /// True once a stop has been requested and until it completes.
    pub fn is_stopping(&self) -> bool {
        self.state.lock().phase == Phase::Stopping
    }

    /// True when this node or any of its ancestors is stopping.
    pub fn lineage_stopping(&self) -> bool {
        if self.is_stopping() {
            return true;
        }
        let mut parent = self.parent.lock().upgrade();
        while let Some(node) = parent {
            if node.is_stopping() {
                return true;
            }
            parent = node.parent.lock().upgrade();
        }
        false
    }

    /// Ask the node to stop and wake every cancellable wait.
    ///
    /// Returns `true` only for the caller that moved the node from running to stopping;
    /// that caller owns the cleanup and must end with [`signal_stopped`](Self::signal_stopped).
    pub fn request_stop(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return false;
        }
        state.phase = Phase::Stopping;
        self.stopping.notify_all();
        trace!(node = %self.name, "stop requested");
        true
    }

    /// Block until the current stop cycle completes. Returns immediately when idle.
    pub fn wait_stopped(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Idle {
            return;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.stopped.wait(&mut state);
        }
    }

    /// Request a stop and wait until the owner signals completion.
    ///
    /// No-op when the node is not running. Concurrent callers all return after the same
    /// completion.
    pub fn stop(&self) {
        self.request_stop();
        self.wait_stopped();
    }

    /// Mark the stop cycle as complete and reset to the restartable initial state.
    pub fn signal_stopped(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Idle;
        state.generation = state.generation.wrapping_add(1);
        self.stopped.notify_all();
        trace!(node = %self.name, "stopped");
    }

    /// Undo a `start` whose initialisation failed.
    pub fn abort_start(&self) {
        if self.request_stop() {
            self.signal_stopped();
        }
    }

    /// Block until `deadline` passes or a stop is requested, whichever comes first.
    pub fn cancellable_wait_until(&self, deadline: Instant) -> WaitOutcome {
        let mut state = self.state.lock();
        loop {
            if state.phase == Phase::Stopping {
                return WaitOutcome::StopRequested;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::Elapsed;
            }
            self.stopping.wait_until(&mut state, deadline);
        }
    }

    /// Register `child` below this node.
    pub fn adopt<C>(self: &Arc<Self>, child: &Arc<C>)
    where
        C: Lifecycle + 'static,
    {
        let child_node = child.node();
        child_node.detach();
        *child_node.parent.lock() = Arc::downgrade(self);

        let component: Arc<dyn Lifecycle> = child.clone();
        self.children.lock().push(ChildEntry {
            id: child_node.id,
            component: Arc::downgrade(&component),
        });
    }

    /// Remove this node from its parent's child set, if it has one.
    pub fn detach(&self) {
        let parent = std::mem::take(&mut *self.parent.lock());
        if let Some(parent) = parent.upgrade() {
            parent.children.lock().retain(|entry| entry.id != self.id);
        }
    }

    /// Number of children currently registered.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Live children, in registration order.
    ///
    /// The returned list is a snapshot: children may detach while the caller iterates.
    fn live_children(&self) -> Vec<Arc<dyn Lifecycle>> {
        self.children
            .lock()
            .iter()
            .filter_map(|entry| entry.component.upgrade())
            .collect()
    }

    /// Start every registered child that is not already running.
    ///
    /// Returns `false` if any child failed to start.
    pub fn cascade_start(&self) -> bool {
        let mut all_started = true;
        for child in self.live_children() {
            if child.node().is_running() {
                continue;
            }
            if !child.start() {
                all_started = false;
            }
        }
        all_started
    }

    /// Stop every registered child, waiting for each to finish.
    pub fn cascade_stop(&self) {
        for child in self.live_children() {
            child.stop();
        }
    }
}

impl Drop for LifecycleNode {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for LifecycleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LifecycleNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &state.phase)
            .finish()
    }
}
