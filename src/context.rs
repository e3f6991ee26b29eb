//! Request-scoped context for the chat worker thread.
//!
//! A streamed answer is generated on a fresh OS thread, which inherits
//! neither the tokio runtime context nor the request's tracing span. The
//! request handler captures a [`RequestContext`] and the worker installs it
//! with [`RequestContext::install`] before running the pipeline. Pipeline
//! components then reach the conversation identity and the async stores
//! through [`current`].

use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::traits::MessageStore;

thread_local! {
    static CURRENT: RefCell<Option<Arc<RequestContext>>> = const { RefCell::new(None) };
}

/// Everything a pipeline needs from the request that started it.
pub struct RequestContext {
    pub conversation_id: String,
    pub pdf_id: String,
    pub messages: Arc<dyn MessageStore>,
    runtime: Handle,
    span: tracing::Span,
}

impl RequestContext {
    /// Captures the current tokio runtime and tracing span.
    ///
    /// Must be called from within a tokio runtime.
    pub fn capture(
        conversation_id: impl Into<String>,
        pdf_id: impl Into<String>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| anyhow!("request context must be captured inside a tokio runtime"))?;
        Ok(Self {
            conversation_id: conversation_id.into(),
            pdf_id: pdf_id.into(),
            messages,
            runtime,
            span: tracing::Span::current(),
        })
    }

    /// Makes this context current on the calling thread and enters its span
    /// until the returned guard is dropped.
    pub fn install(self: &Arc<Self>) -> ContextGuard {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(Arc::clone(self)));
        ContextGuard {
            previous,
            _span: self.span.clone().entered(),
        }
    }

    /// Drives an async store call to completion from the worker thread.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Restores the previously installed context on drop.
pub struct ContextGuard {
    previous: Option<Arc<RequestContext>>,
    _span: tracing::span::EnteredSpan,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// The context installed on this thread.
pub fn current() -> Result<Arc<RequestContext>> {
    CURRENT
        .with(|c| c.borrow().clone())
        .ok_or_else(|| anyhow!("no request context installed on this thread"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Role};
    use async_trait::async_trait;

    struct EmptyStore;

    #[async_trait]
    impl MessageStore for EmptyStore {
        async fn append(&self, _: &str, _: Role, _: &str) -> Result<Message> {
            anyhow::bail!("read-only")
        }
        async fn list(&self, _: &str) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_current_fails_without_install() {
        let err = std::thread::spawn(|| current().err().map(|e| e.to_string()))
            .join()
            .unwrap();
        assert!(err.unwrap().contains("no request context"));
    }

    #[tokio::test]
    async fn test_installed_context_visible_on_other_thread() {
        let ctx = Arc::new(RequestContext::capture("conv-1", "pdf-1", Arc::new(EmptyStore)).unwrap());

        let seen = std::thread::spawn(move || {
            let _guard = ctx.install();
            let current = current().unwrap();
            let history = current.block_on(current.messages.list(&current.conversation_id));
            (current.conversation_id.clone(), history.unwrap().len())
        })
        .join()
        .unwrap();

        assert_eq!(seen, ("conv-1".to_string(), 0));
    }

    #[tokio::test]
    async fn test_guard_restores_previous_context() {
        let outer = Arc::new(RequestContext::capture("outer", "pdf", Arc::new(EmptyStore)).unwrap());
        let inner = Arc::new(RequestContext::capture("inner", "pdf", Arc::new(EmptyStore)).unwrap());

        std::thread::spawn(move || {
            let _a = outer.install();
            {
                let _b = inner.install();
                assert_eq!(current().unwrap().conversation_id, "inner");
            }
            assert_eq!(current().unwrap().conversation_id, "outer");
        })
        .join()
        .unwrap();
    }
}
