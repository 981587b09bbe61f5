//! Batch scheduler: coalesces individual requests into bulk HTTP calls.
//!
//! A background task owns the pending queue and two deadlines (debounce and
//! hard cap). Callers talk to it over an unbounded command channel and wait
//! on a [`BatchHandle`] for their own item's outcome.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use super::fingerprint::{FingerprintCache, Lookup};
use super::handler::{BatchHandler, ItemOutcome};
use crate::backoff::Backoff;
use crate::error::{MercuryError, Result};
use crate::http::{HttpClient, HttpError, HttpResponse};
use crate::models::BatcherOptions;

/// Far-future sentinel for disabled deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

const NOT_FOUND_REASON: &str = "not found in response";

struct QueuedItem<I> {
    fingerprint: String,
    item: I,
    /// Network retries already spent on this item.
    attempts: u32,
}

enum BatchCmd<I> {
    Push(QueuedItem<I>),
    Requeue(Vec<QueuedItem<I>>),
    Shutdown,
}

struct BatcherInner<H: BatchHandler> {
    name: String,
    handler: H,
    http: Arc<dyn HttpClient>,
    options: BatcherOptions,
    retry_backoff: Backoff,
    cache: Mutex<FingerprintCache<H::Output>>,
}

impl<H: BatchHandler> BatcherInner<H> {
    fn settle_all(&self, batch: &[QueuedItem<H::Item>], err: MercuryError) {
        let mut cache = self.cache.lock();
        for queued in batch {
            cache.settle(&queued.fingerprint, Err(err.clone()));
        }
    }

    fn accept(&self, batch: &[QueuedItem<H::Item>], response: HttpResponse) {
        let outcomes = match self.handler.accept_response(response) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                log::warn!("[batcher] {}: could not read bulk response: {}", self.name, e);
                self.settle_all(batch, e);
                return;
            },
        };

        let mut cache = self.cache.lock();
        for ItemOutcome {
            fingerprint,
            result,
        } in outcomes
        {
            let result = result.map_err(|reason| MercuryError::BatchItemError {
                fingerprint: fingerprint.clone(),
                reason,
            });
            cache.settle(&fingerprint, result);
        }

        if self.handler.out_of_band() {
            return;
        }
        for queued in batch {
            if cache.is_in_flight(&queued.fingerprint) {
                cache.settle(
                    &queued.fingerprint,
                    Err(MercuryError::BatchItemError {
                        fingerprint: queued.fingerprint.clone(),
                        reason: NOT_FOUND_REASON.to_string(),
                    }),
                );
            }
        }
    }

    async fn retry(
        &self,
        batch: Vec<QueuedItem<H::Item>>,
        retry_after: Option<Duration>,
        reason: String,
        cmd_tx: &mpsc::UnboundedSender<BatchCmd<H::Item>>,
    ) {
        let max_retries = self.options.max_retries;
        let (exhausted, mut retry): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|q| q.attempts >= max_retries);

        if !exhausted.is_empty() {
            log::warn!(
                "[batcher] {}: giving up on {} items after {} retries: {}",
                self.name,
                exhausted.len(),
                max_retries,
                reason
            );
            self.settle_all(
                &exhausted,
                MercuryError::BatchNetworkError(format!(
                    "{} (gave up after {} retries)",
                    reason, max_retries
                )),
            );
        }
        if retry.is_empty() {
            return;
        }

        let attempt = retry.iter().map(|q| q.attempts).max().unwrap_or(0);
        let delay = retry_after.unwrap_or_else(|| self.retry_backoff.delay_for(attempt));
        log::info!(
            "[batcher] {}: retrying {} items in {:?}: {}",
            self.name,
            retry.len(),
            delay,
            reason
        );
        tokio::time::sleep(delay).await;

        for queued in retry.iter_mut() {
            queued.attempts += 1;
        }
        if let Err(mpsc::error::SendError(BatchCmd::Requeue(items))) =
            cmd_tx.send(BatchCmd::Requeue(retry))
        {
            self.settle_all(
                &items,
                MercuryError::Cancelled("batcher shut down before retry".to_string()),
            );
        }
    }

    async fn submit(
        self: Arc<Self>,
        batch: Vec<QueuedItem<H::Item>>,
        cmd_tx: mpsc::UnboundedSender<BatchCmd<H::Item>>,
    ) {
        let items: Vec<H::Item> = batch.iter().map(|q| q.item.clone()).collect();
        let request = match self.handler.prepare_request(&items) {
            Ok(request) => request,
            Err(e) => {
                self.settle_all(&batch, e);
                return;
            },
        };

        log::debug!("[batcher] {}: submitting {} items", self.name, batch.len());
        match self.http.request(request).await {
            Ok(response) => self.accept(&batch, response),
            Err(HttpError::Network(message)) => {
                self.retry(batch, None, message, &cmd_tx).await;
            },
            Err(err) => {
                let status_code = err.status_code().unwrap_or_default();
                match (status_code, err.retry_after()) {
                    (429 | 503, Some(retry_after)) => {
                        self.retry(batch, Some(retry_after), err.to_string(), &cmd_tx)
                            .await;
                    },
                    _ => {
                        let message = match &err {
                            HttpError::Status { body, .. } => body.to_string(),
                            HttpError::Network(m) => m.clone(),
                        };
                        log::warn!("[batcher] {}: bulk request failed: {}", self.name, err);
                        self.settle_all(
                            &batch,
                            MercuryError::ServerError {
                                status_code,
                                message,
                            },
                        );
                    },
                }
            },
        }
    }
}

/// Coalesces [`enqueue`](Batcher::enqueue)d items into bulk requests.
///
/// Must be created inside a tokio runtime. Dropping the batcher stops its
/// task; items still queued resolve with `Cancelled`.
pub struct Batcher<H: BatchHandler> {
    inner: Arc<BatcherInner<H>>,
    cmd_tx: mpsc::UnboundedSender<BatchCmd<H::Item>>,
    task: JoinHandle<()>,
}

impl<H: BatchHandler> std::fmt::Debug for Batcher<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<H: BatchHandler> Batcher<H> {
    pub fn new(
        name: impl Into<String>,
        handler: H,
        http: Arc<dyn HttpClient>,
        options: BatcherOptions,
    ) -> Self {
        let inner = Arc::new(BatcherInner {
            name: name.into(),
            handler,
            http,
            retry_backoff: options.retry_backoff(),
            cache: Mutex::new(FingerprintCache::new(
                options.cache_successes,
                options.cache_failures,
            )),
            options,
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(batch_task(inner.clone(), cmd_rx, cmd_tx.clone()));
        Self {
            inner,
            cmd_tx,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &BatcherOptions {
        &self.inner.options
    }

    /// Queue `item` and return a handle to its outcome.
    ///
    /// An item whose fingerprint cannot be computed fails immediately. An
    /// item whose fingerprint is already pending joins that request.
    pub fn enqueue(&self, item: H::Item) -> BatchHandle<H::Output> {
        let fingerprint = match self.inner.handler.fingerprint_request(&item) {
            Ok(fingerprint) => fingerprint,
            Err(e) => return BatchHandle::ready(Err(e)),
        };

        let lookup = self.inner.cache.lock().get_or_create(&fingerprint, || {
            self.cmd_tx
                .send(BatchCmd::Push(QueuedItem {
                    fingerprint: fingerprint.clone(),
                    item,
                    attempts: 0,
                }))
                .map_err(|_| MercuryError::Cancelled("batcher has shut down".to_string()))
        });
        match lookup {
            Lookup::Settled(result) => BatchHandle::ready(result),
            Lookup::Pending(rx) => BatchHandle::waiting(rx),
        }
    }

    /// Settle an item of an out-of-band batch. Returns `false` when nothing
    /// was waiting on `fingerprint`.
    pub fn accept_out_of_band(
        &self,
        fingerprint: &str,
        result: std::result::Result<H::Output, String>,
    ) -> bool {
        let result = result.map_err(|reason| MercuryError::BatchItemError {
            fingerprint: fingerprint.to_string(),
            reason,
        });
        self.inner.cache.lock().settle(fingerprint, result) > 0
    }

    /// Forget a retained outcome so the next enqueue hits the server again.
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.inner.cache.lock().invalidate(fingerprint)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }
}

impl<H: BatchHandler> Drop for Batcher<H> {
    fn drop(&mut self) {
        if self.cmd_tx.send(BatchCmd::Shutdown).is_err() {
            self.task.abort();
        }
    }
}

async fn batch_task<H: BatchHandler>(
    inner: Arc<BatcherInner<H>>,
    mut cmd_rx: mpsc::UnboundedReceiver<BatchCmd<H::Item>>,
    cmd_tx: mpsc::UnboundedSender<BatchCmd<H::Item>>,
) {
    let limit = inner.options.batch_limit();
    let wait = inner.options.wait();
    let max_wait = inner.options.max_wait();

    let mut queue: VecDeque<QueuedItem<H::Item>> = VecDeque::new();
    let mut wait_deadline: Option<Instant> = None;
    let mut max_deadline: Option<Instant> = None;

    loop {
        let far = Instant::now() + FAR_FUTURE;
        let wait_sleep = sleep_until(wait_deadline.unwrap_or(far));
        let max_sleep = sleep_until(max_deadline.unwrap_or(far));

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                let incoming = match cmd {
                    Some(BatchCmd::Push(item)) => vec![item],
                    Some(BatchCmd::Requeue(items)) => items,
                    Some(BatchCmd::Shutdown) | None => break,
                };
                let now = Instant::now();
                queue.extend(incoming);
                wait_deadline = Some(now + wait);
                if max_deadline.is_none() {
                    max_deadline = Some(now + max_wait);
                }
                while queue.len() >= limit {
                    flush(&inner, &mut queue, limit, &cmd_tx);
                }
            }

            _ = wait_sleep, if wait_deadline.is_some() => {
                log::debug!("[batcher] {}: wait elapsed", inner.name);
                while !queue.is_empty() {
                    flush(&inner, &mut queue, limit, &cmd_tx);
                }
            }

            _ = max_sleep, if max_deadline.is_some() => {
                log::debug!("[batcher] {}: max wait elapsed", inner.name);
                while !queue.is_empty() {
                    flush(&inner, &mut queue, limit, &cmd_tx);
                }
            }
        }

        if queue.is_empty() {
            wait_deadline = None;
            max_deadline = None;
        }
    }

    if !queue.is_empty() {
        log::debug!("[batcher] {}: cancelling {} queued items", inner.name, queue.len());
        let pending: Vec<_> = queue.drain(..).collect();
        inner.settle_all(&pending, MercuryError::Cancelled("batcher shut down".to_string()));
    }
}

/// Take up to `limit` items from the front of the queue and submit them.
fn flush<H: BatchHandler>(
    inner: &Arc<BatcherInner<H>>,
    queue: &mut VecDeque<QueuedItem<H::Item>>,
    limit: usize,
    cmd_tx: &mpsc::UnboundedSender<BatchCmd<H::Item>>,
) {
    let take = queue.len().min(limit);
    if take == 0 {
        return;
    }
    let batch: Vec<_> = queue.drain(..take).collect();
    tokio::spawn(inner.clone().submit(batch, cmd_tx.clone()));
}

enum HandleState<T> {
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Result<T>>),
}

/// Outcome of one enqueued item.
pub struct BatchHandle<T> {
    state: HandleState<T>,
}

impl<T> Unpin for BatchHandle<T> {}

impl<T> std::fmt::Debug for BatchHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            HandleState::Ready(_) => "ready",
            HandleState::Waiting(_) => "waiting",
        };
        f.debug_struct("BatchHandle").field("state", &state).finish()
    }
}

impl<T> BatchHandle<T> {
    fn ready(result: Result<T>) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: HandleState::Waiting(rx),
        }
    }
}

impl<T> Future for BatchHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(MercuryError::InvalidState(
                    "batch handle polled after completion".to_string(),
                ))
            })),
            HandleState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(MercuryError::Cancelled(
                    "request dropped by the batcher".to_string(),
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
