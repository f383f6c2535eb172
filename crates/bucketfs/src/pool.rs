// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-filesystem bound on concurrent remote calls
//!
//! Bulk work (recursive delete and move, background prefetch, part uploads)
//! takes a permit for every request it issues, so one filesystem never has
//! more than `size` of those requests outstanding.

use futures::{StreamExt, stream};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot. The semaphore is never closed, so `None` is
    /// unreachable in practice and the caller proceeds unthrottled.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Run `fut` once a slot is free
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let _permit = self.acquire().await;
        fut.await
    }

    /// Spawn `fut` as a task that starts its work once a slot is free
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move { pool.run(fut).await })
    }

    /// Apply `f` to every item with at most `size` calls in flight, keeping
    /// results in input order.
    pub async fn map<I, T, F, Fut>(&self, items: I, f: F) -> Vec<T>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = T>,
    {
        stream::iter(items)
            .map(|item| self.run(f(item)))
            .buffered(self.size)
            .collect()
            .await
    }
}
