//! Fire-and-forget dispatch of remote function calls
//!
//! The registered listener runs on its own local task so the conversation
//! never waits on it. Every call is acknowledged with a silent response
//! whether or not the listener succeeds.

use std::sync::Arc;

use serde_json::Value;

use super::protocol::{FunctionResponse, ToolCallRecord};

/// Handler invoked with `(name, args)` for every remote function call
pub type ToolCallListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Result reported in every acknowledgement
pub const ACK_RESULT: &str = "ok";

/// Dispatches function calls to one listener
#[derive(Default, Clone)]
pub struct ToolCallDispatcher {
    listener: Option<ToolCallListener>,
}

impl ToolCallDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered listener
    pub fn register(&mut self, listener: ToolCallListener) {
        self.listener = Some(listener);
    }

    #[must_use]
    pub const fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Hand each call to the listener without awaiting it
    ///
    /// Must be called from within a [`tokio::task::LocalSet`]. Listener tasks
    /// are spawned in receipt order. Returns one acknowledgement per call.
    pub fn dispatch(&self, calls: Vec<ToolCallRecord>) -> Vec<FunctionResponse> {
        let mut acks = Vec::with_capacity(calls.len());

        for call in calls {
            tracing::info!(id = %call.id, name = %call.name, "tool call received");

            match &self.listener {
                Some(listener) => {
                    let listener = Arc::clone(listener);
                    let (name, args) = (call.name.clone(), call.args.clone());
                    tokio::task::spawn_local(async move {
                        listener(&name, &args);
                    });
                }
                None => tracing::warn!(name = %call.name, "no tool call listener registered"),
            }

            acks.push(FunctionResponse::silent(&call, Value::from(ACK_RESULT)));
        }

        acks
    }
}

impl std::fmt::Debug for ToolCallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCallDispatcher")
            .field("has_listener", &self.has_listener())
            .finish()
    }
}
