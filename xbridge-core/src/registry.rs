//! Action handlers: what a Handler runs once a request and its files are in.
//!
//! A handler gets the request and the local paths of the fetched files and
//! returns a stream of replies. The channel keeps the last one; an empty
//! stream means "not now" and suspends the session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};

use crate::protocol::ControlMessage;

pub type ReplyStream = BoxStream<'static, anyhow::Result<ControlMessage>>;

pub type ActionHandler = Arc<dyn Fn(ControlMessage, Vec<PathBuf>) -> ReplyStream + Send + Sync>;

pub trait ActionRegistry: Send + Sync {
    fn lookup(&self, action: &str) -> Option<ActionHandler>;
}

/// Handlers keyed by action name.
#[derive(Default, Clone)]
pub struct HandlerMap {
    handlers: HashMap<String, ActionHandler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(ControlMessage, Vec<PathBuf>) -> ReplyStream + Send + Sync + 'static,
    {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    /// Register a handler that answers with exactly one reply.
    pub fn register_fn<F>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ControlMessage, &[PathBuf]) -> anyhow::Result<ControlMessage>
            + Send
            + Sync
            + 'static,
    {
        self.register(action, move |request, files| {
            let reply = handler(&request, &files);
            stream::once(async move { reply }).boxed()
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl ActionRegistry for HandlerMap {
    fn lookup(&self, action: &str) -> Option<ActionHandler> {
        self.handlers.get(action).cloned()
    }
}
