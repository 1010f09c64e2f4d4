// file: src/workflow/resources.rs
// version: 1.0.0
// guid: b8e1f4a7-2c6d-4d90-8a3b-5e9c7f1d2a46

//! Deferred releases for mappings, mounts and containers
//!
//! Acquire A, defer its release, acquire B, defer its release: the stack runs
//! the releases in reverse order. A release failure is logged and never
//! replaces the error that caused the unwind.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

type Release = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// LIFO stack of named release closures
#[derive(Default)]
pub struct ReleaseStack {
    entries: Mutex<Vec<(String, Release)>>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(String, Release)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `release` to run when the stack unwinds
    pub fn defer<F, Fut>(&self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(resource = %name, "Deferred release registered");
        self.entries()
            .push((name, Box::new(move || Box::pin(release()) as BoxFuture<'static, Result<()>>)));
    }

    /// Run the most recent release registered under `name` now
    ///
    /// Returns `Ok(false)` when nothing is registered under that name.
    pub async fn release(&self, name: &str) -> Result<bool> {
        let entry = {
            let mut entries = self.entries();
            entries
                .iter()
                .rposition(|(n, _)| n == name)
                .map(|pos| entries.remove(pos))
        };
        match entry {
            Some((_, release)) => {
                release().await?;
                debug!(resource = %name, "Released early");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run every remaining release, newest first; returns how many failed
    pub async fn run_all(&self) -> usize {
        let mut failed = 0;
        loop {
            let Some((name, release)) = self.entries().pop() else { break };
            match release().await {
                Ok(()) => debug!(resource = %name, "Released"),
                Err(e) => {
                    failed += 1;
                    warn!(resource = %name, "Release failed: {}", e);
                }
            }
        }
        failed
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, stack: &ReleaseStack, name: &'static str, fail: bool) {
        let log = Arc::clone(log);
        stack.defer(name, move || async move {
            log.lock().unwrap().push(name.to_string());
            if fail {
                Err(ProvisionError::transport(format!("{} busy", name)))
            } else {
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_reverse_order_and_failures_counted() {
        let log = recorder();
        let stack = ReleaseStack::new();
        push(&log, &stack, "unmap", false);
        push(&log, &stack, "unmount", true);
        push(&log, &stack, "container", false);

        assert_eq!(stack.run_all().await, 1);
        assert_eq!(*log.lock().unwrap(), vec!["container", "unmount", "unmap"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_early_release_runs_once() {
        let log = recorder();
        let stack = ReleaseStack::new();
        push(&log, &stack, "unmap", false);
        push(&log, &stack, "unmount", false);

        assert!(stack.release("unmount").await.unwrap());
        assert!(!stack.release("unmount").await.unwrap());
        assert_eq!(stack.names(), vec!["unmap"]);
        stack.run_all().await;
        assert_eq!(*log.lock().unwrap(), vec!["unmount", "unmap"]);
    }
}
