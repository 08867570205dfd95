//! Node context injection for multi-node logging
//!
//! Thread-local storage for the identity of the node doing the work, so
//! logs from several nodes in one process (tests, embedded clusters) can be
//! told apart.

use std::cell::RefCell;

use uuid::Uuid;

/// Node context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContextData {
    /// Endpoint the node is known by in the cluster
    pub node_endpoint: String,
    /// Unique id of this process instance
    pub instance_id: Uuid,
}

thread_local! {
    static NODE_CONTEXT: RefCell<Option<NodeContextData>> = const { RefCell::new(None) };
}

/// RAII guard for node context
///
/// When this guard is created, it sets the node context for the current thread.
/// When it's dropped, it restores the previous context (if any).
///
/// # Example
///
/// ```ignore
/// use strand_logging::NodeContextGuard;
///
/// let _guard = NodeContextGuard::new("10.0.0.1:1112");
///
/// // Spans created in this scope carry node_endpoint = "10.0.0.1:1112"
/// tracing::info!("Chunk completed");
/// ```
pub struct NodeContextGuard {
    previous: Option<NodeContextData>,
}

impl NodeContextGuard {
    /// Set the node endpoint for the current scope with a fresh instance id
    pub fn new(node_endpoint: impl Into<String>) -> Self {
        Self::with_instance_id(node_endpoint, Uuid::new_v4())
    }

    /// Set the node endpoint with a known instance id
    pub fn with_instance_id(node_endpoint: impl Into<String>, instance_id: Uuid) -> Self {
        let previous = Self::current();
        let data = NodeContextData {
            node_endpoint: node_endpoint.into(),
            instance_id,
        };
        NODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(data));
        Self { previous }
    }

    /// Get the current node context (if any)
    pub fn current() -> Option<NodeContextData> {
        NODE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_endpoint() -> Option<String> {
        Self::current().map(|ctx| ctx.node_endpoint)
    }
}

impl Drop for NodeContextGuard {
    fn drop(&mut self) {
        NODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}
