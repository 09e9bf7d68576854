//! # Download Scheduler
//!
//! Admits download operations under a concurrency cap, orders the pending
//! ones and coalesces requests for a key that is already pending or running.
//!
//! Queue, running count and in-flight map live under one lock, so submit,
//! cancel and completion handling serialize against each other and the cap
//! is exact. Lock order is scheduler state first, then operation.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};
use url::Url;

use crate::DownloadError;
use crate::DownloaderConfig;
use crate::cache::CacheKey;
use crate::config::Credentials;
use crate::download::events::DownloadEvent;
use crate::download::http::HttpTransport;
use crate::download::operation::{
    DownloadObserver, DownloadOperation, DownloadOutcome, DownloadProgress, ObserverId,
    OperationState,
};
use crate::download::options::{DownloadOptions, DownloadOrder, QueuePriority};
use crate::download::transport::{Transport, TransportRequest};

static SHARED: OnceLock<Downloader> = OnceLock::new();

struct SchedulerState {
    max_concurrent: usize,
    order: DownloadOrder,
    suspended: bool,
    running: usize,
    high: VecDeque<Arc<DownloadOperation>>,
    normal: VecDeque<Arc<DownloadOperation>>,
    low: VecDeque<Arc<DownloadOperation>>,
    in_flight: HashMap<CacheKey, Arc<DownloadOperation>>,
}

impl SchedulerState {
    fn can_admit(&self) -> bool {
        !self.suspended && self.running < self.max_concurrent
    }

    fn enqueue(&mut self, operation: Arc<DownloadOperation>, priority: QueuePriority) {
        match priority {
            QueuePriority::High => self.high.push_front(operation),
            QueuePriority::Normal => self.normal.push_back(operation),
            QueuePriority::Low => self.low.push_back(operation),
        }
    }

    fn next_pending(&mut self) -> Option<Arc<DownloadOperation>> {
        let order = self.order;
        let pop = |lane: &mut VecDeque<Arc<DownloadOperation>>| match order {
            DownloadOrder::Fifo => lane.pop_front(),
            DownloadOrder::Lifo => lane.pop_back(),
        };
        self.high
            .pop_front()
            .or_else(|| pop(&mut self.normal))
            .or_else(|| pop(&mut self.low))
    }

    fn pending(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn remove_queued(&mut self, operation: &Arc<DownloadOperation>) {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            lane.retain(|queued| !Arc::ptr_eq(queued, operation));
        }
    }

    /// Drop the in-flight entry for `operation`, unless a newer operation
    /// already took its key.
    fn forget(&mut self, operation: &Arc<DownloadOperation>) {
        if self
            .in_flight
            .get(operation.key())
            .is_some_and(|current| Arc::ptr_eq(current, operation))
        {
            self.in_flight.remove(operation.key());
        }
    }
}

struct SchedulerInner {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    state: Mutex<SchedulerState>,
    headers: RwLock<HeaderMap>,
    credentials: Option<Credentials>,
    timeout: Duration,
    events: broadcast::Sender<DownloadEvent>,
    next_id: AtomicU64,
}

impl SchedulerInner {
    fn start_locked(self: &Arc<Self>, state: &mut SchedulerState, operation: Arc<DownloadOperation>) {
        if !operation.start() {
            state.forget(&operation);
            return;
        }
        state.running += 1;
        debug!(key = %operation.key(), running = state.running, "Starting download");

        let scheduler = Arc::clone(self);
        self.runtime.spawn(async move {
            scheduler.run(operation).await;
        });
    }

    fn admit_locked(self: &Arc<Self>, state: &mut SchedulerState) {
        while state.can_admit() {
            let Some(operation) = state.next_pending() else {
                break;
            };
            self.start_locked(state, operation);
        }
    }

    async fn run(self: Arc<Self>, operation: Arc<DownloadOperation>) {
        let request = TransportRequest {
            url: operation.url().clone(),
            options: operation.options(),
            headers: self.headers.read().clone(),
            credentials: self.credentials.clone(),
            timeout: self.timeout,
        };
        let cancel = operation.cancel_token();
        let timeout = self.timeout;
        let fetch = self
            .transport
            .fetch(request, operation.progress_reporter(), cancel.clone());

        let bounded = async move {
            if timeout.is_zero() {
                return fetch.await;
            }
            match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(DownloadError::Timeout(timeout)),
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = AssertUnwindSafe(bounded).catch_unwind() => match result {
                Ok(result) => result,
                Err(_) => {
                    error!(key = %operation.key(), "Transport panicked");
                    Err(DownloadError::Transport("transport panicked".to_owned()))
                }
            },
        };

        if let Err(e) = &result {
            debug!(key = %operation.key(), error = %e, "Download did not complete");
        }
        operation.complete(result);
        self.finish(&operation);
    }

    fn finish(self: &Arc<Self>, operation: &Arc<DownloadOperation>) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        state.forget(operation);
        self.admit_locked(&mut state);
    }

    fn cancel_observer(&self, operation: &Arc<DownloadOperation>, observer: ObserverId) -> bool {
        let detached = {
            let mut state = self.state.lock();
            let Some(detached) = operation.detach(observer) else {
                return false;
            };
            match detached.aborted_from {
                Some(OperationState::Pending) => {
                    state.remove_queued(operation);
                    state.forget(operation);
                }
                Some(OperationState::Running) => state.forget(operation),
                _ => {}
            }
            detached
        };
        debug!(key = %operation.key(), "Observer cancelled");
        detached.notify();
        true
    }
}

impl Drop for SchedulerInner {
    /// Queued operations are owned by the lanes alone; once the scheduler is
    /// gone nothing could admit them, so their observers are told now.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let orphaned: Vec<Arc<DownloadOperation>> = state
            .high
            .drain(..)
            .chain(state.normal.drain(..))
            .chain(state.low.drain(..))
            .collect();
        state.in_flight.clear();
        if orphaned.is_empty() {
            return;
        }

        debug!(count = orphaned.len(), "Cancelling queued downloads of dropped scheduler");
        for operation in orphaned {
            operation.cancel_token().cancel();
            operation.complete(Err(DownloadError::Cancelled));
        }
    }
}

/// Handle for one observer of a download. Cancelling it detaches only this
/// observer; the transfer is aborted when the last observer leaves.
#[derive(Clone)]
pub struct ObserverHandle {
    operation: Arc<DownloadOperation>,
    observer: ObserverId,
    scheduler: Weak<SchedulerInner>,
}

impl ObserverHandle {
    pub fn key(&self) -> &CacheKey {
        self.operation.key()
    }

    pub fn operation(&self) -> &Arc<DownloadOperation> {
        &self.operation
    }

    /// Detach this observer, delivering [`DownloadOutcome::Cancelled`] to it.
    ///
    /// Returns false when the observer was already notified or detached.
    pub fn cancel(&self) -> bool {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.cancel_observer(&self.operation, self.observer),
            None => match self.operation.detach(self.observer) {
                Some(detached) => {
                    detached.notify();
                    true
                }
                None => false,
            },
        }
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("operation", &self.operation)
            .field("observer", &self.observer)
            .finish()
    }
}

/// A download whose outcome is awaited rather than delivered to a callback
#[derive(Debug)]
pub struct DownloadTicket {
    handle: ObserverHandle,
    outcome: oneshot::Receiver<DownloadOutcome>,
}

impl DownloadTicket {
    pub fn handle(&self) -> &ObserverHandle {
        &self.handle
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub async fn outcome(self) -> DownloadOutcome {
        self.outcome.await.unwrap_or(DownloadOutcome::Cancelled)
    }
}

/// Concurrency-bounded, coalescing download scheduler
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<SchedulerInner>,
}

impl Downloader {
    /// Create a downloader using the reqwest transport.
    ///
    /// Must be called from within a tokio runtime; downloads are spawned on it.
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        let transport = Arc::new(HttpTransport::new(config.clone()));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DownloadError> {
        let runtime = Handle::try_current().map_err(|_| DownloadError::NoRuntime)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                transport,
                runtime,
                state: Mutex::new(SchedulerState {
                    max_concurrent: config.max_concurrent.max(1),
                    order: config.order,
                    suspended: false,
                    running: 0,
                    high: VecDeque::new(),
                    normal: VecDeque::new(),
                    low: VecDeque::new(),
                    in_flight: HashMap::new(),
                }),
                headers: RwLock::new(config.headers),
                credentials: config.credentials,
                timeout: config.timeout,
                events,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Process-wide instance with the default configuration, bound to the
    /// runtime of its first caller.
    pub fn shared() -> Result<&'static Downloader, DownloadError> {
        if let Some(downloader) = SHARED.get() {
            return Ok(downloader);
        }
        let downloader = Self::new(DownloaderConfig::default())?;
        info!("Initialized shared downloader");
        Ok(SHARED.get_or_init(move || downloader))
    }

    /// Request `url` under `key`, attaching to an in-flight download of the
    /// same key if there is one.
    pub fn submit(
        &self,
        key: CacheKey,
        url: Url,
        options: DownloadOptions,
        observer: DownloadObserver,
    ) -> ObserverHandle {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let mut observer = observer;
        if let Some(existing) = state.in_flight.get(&key).cloned() {
            match existing.attach(observer, &options) {
                Ok(id) => {
                    debug!(%key, observers = existing.observer_count(), "Coalesced download request");
                    return self.handle(existing, id);
                }
                Err(returned) => observer = returned,
            }
        }

        let (operation, id) = DownloadOperation::with_first_observer(
            inner.next_id.fetch_add(1, Ordering::Relaxed),
            key.clone(),
            url,
            options,
            inner.events.clone(),
            observer,
        );
        state.in_flight.insert(key.clone(), Arc::clone(&operation));

        if state.can_admit() {
            inner.start_locked(&mut state, Arc::clone(&operation));
        } else {
            state.enqueue(Arc::clone(&operation), options.priority());
            debug!(%key, pending = state.pending(), priority = ?options.priority(), "Queued download");
        }
        drop(state);

        self.handle(operation, id)
    }

    /// Download `url` keyed by its normalised form and await the outcome.
    pub fn download(&self, url: &str, options: DownloadOptions) -> Result<DownloadTicket, DownloadError> {
        self.download_with_progress(url, options, |_| {})
    }

    pub fn download_with_progress(
        &self,
        url: &str,
        options: DownloadOptions,
        progress: impl Fn(DownloadProgress) + Send + Sync + 'static,
    ) -> Result<DownloadTicket, DownloadError> {
        let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
        let (tx, rx) = oneshot::channel();
        let observer = DownloadObserver::new()
            .on_progress(progress)
            .on_complete(move |outcome| {
                let _ = tx.send(outcome);
            });
        let handle = self.submit(CacheKey::from_url(url), parsed, options, observer);
        Ok(DownloadTicket {
            handle,
            outcome: rx,
        })
    }

    pub fn cancel(&self, handle: &ObserverHandle) -> bool {
        handle.cancel()
    }

    fn handle(&self, operation: Arc<DownloadOperation>, observer: ObserverId) -> ObserverHandle {
        ObserverHandle {
            operation,
            observer,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    /// Change the cap. Raising it admits queued work at once; lowering it
    /// lets running work finish.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = self.inner.state.lock();
        state.max_concurrent = max_concurrent.max(1);
        self.inner.admit_locked(&mut state);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.state.lock().max_concurrent
    }

    pub fn set_order(&self, order: DownloadOrder) {
        self.inner.state.lock().order = order;
    }

    pub fn order(&self) -> DownloadOrder {
        self.inner.state.lock().order
    }

    /// Stop or resume admissions from the queue. Running downloads continue.
    pub fn set_suspended(&self, suspended: bool) {
        let mut state = self.inner.state.lock();
        state.suspended = suspended;
        if !suspended {
            self.inner.admit_locked(&mut state);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Number of running downloads
    pub fn current_downloads(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn pending_downloads(&self) -> usize {
        self.inner.state.lock().pending()
    }

    /// Set a header sent with every request; `None` removes it.
    pub fn set_header(&self, name: HeaderName, value: Option<HeaderValue>) {
        let mut headers = self.inner.headers.write();
        match value {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.inner.headers.read().get(name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Downloader")
            .field("max_concurrent", &state.max_concurrent)
            .field("order", &state.order)
            .field("suspended", &state.suspended)
            .field("running", &state.running)
            .field("pending", &state.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::transport::{ProgressReporter, TransportResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    /// Holds every fetch open until released, recording start order and
    /// peak concurrency.
    #[derive(Default)]
    struct GatedTransport {
        gate: Notify,
        released: std::sync::atomic::AtomicBool,
        active: AtomicUsize,
        peak: AtomicUsize,
        fetches: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl GatedTransport {
        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
            self.gate.notify_waiters();
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn fetch(
            &self,
            request: TransportRequest,
            _progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<TransportResponse, DownloadError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.started.lock().push(request.url.path().to_owned());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let result = if self.released.load(Ordering::SeqCst) {
                Ok(())
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => Err(DownloadError::Cancelled),
                    _ = notified => Ok(()),
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result?;

            Ok(TransportResponse {
                data: Bytes::from(request.url.path().to_owned()),
                status: StatusCode::OK,
                expected_len: None,
                from_cache: false,
            })
        }
    }

    fn downloader(max_concurrent: usize, transport: Arc<GatedTransport>) -> Downloader {
        let config = DownloaderConfig::builder()
            .with_max_concurrent(max_concurrent)
            .with_timeout(Duration::ZERO)
            .build();
        Downloader::with_transport(config, transport).unwrap()
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("http://example.com/{path}")).unwrap()
    }

    fn submit_recording(
        downloader: &Downloader,
        path: &str,
        options: DownloadOptions,
        sink: &Arc<Mutex<Vec<(String, DownloadOutcome)>>>,
    ) -> ObserverHandle {
        let sink = sink.clone();
        let name = path.to_owned();
        downloader.submit(
            CacheKey::from(path),
            url(path),
            options,
            DownloadObserver::new().on_complete(move |outcome| sink.lock().push((name, outcome))),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_coalesces_duplicate_keys() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(4, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        let a = submit_recording(&downloader, "same", DownloadOptions::default(), &sink);
        let b = submit_recording(&downloader, "same", DownloadOptions::default(), &sink);
        assert!(Arc::ptr_eq(a.operation(), b.operation()));
        assert_eq!(a.operation().observer_count(), 2);

        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 1).await;
        transport.release();
        wait_until(|| sink.lock().len() == 2).await;

        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        for (_, outcome) in sink.lock().iter() {
            assert_eq!(outcome.data().unwrap().as_ref(), b"/same");
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(2, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            submit_recording(&downloader, &format!("k{i}"), DownloadOptions::default(), &sink);
        }
        assert_eq!(downloader.current_downloads(), 2);
        assert_eq!(downloader.pending_downloads(), 3);

        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 2).await;
        transport.release();
        wait_until(|| sink.lock().len() == 5).await;

        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(downloader.current_downloads(), 0);
        assert_eq!(downloader.pending_downloads(), 0);
    }

    #[tokio::test]
    async fn test_cancel_one_observer_keeps_shared_download() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        let a = submit_recording(&downloader, "shared", DownloadOptions::default(), &sink);
        let _b = submit_recording(&downloader, "shared", DownloadOptions::default(), &sink);

        assert!(a.cancel());
        assert!(!a.cancel(), "second cancel is a no-op");
        assert_eq!(a.operation().state(), OperationState::Running);

        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 1).await;
        transport.release();
        wait_until(|| sink.lock().len() == 2).await;

        let sink = sink.lock();
        assert!(matches!(sink[0].1, DownloadOutcome::Cancelled));
        assert!(sink[1].1.is_success());
    }

    #[tokio::test]
    async fn test_cancel_last_observer_aborts_and_admits_next() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        let running = submit_recording(&downloader, "first", DownloadOptions::default(), &sink);
        submit_recording(&downloader, "second", DownloadOptions::default(), &sink);
        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 1).await;

        assert!(running.cancel());
        assert_eq!(running.operation().state(), OperationState::Cancelled);

        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 2).await;
        transport.release();
        wait_until(|| sink.lock().len() == 2).await;

        let sink = sink.lock();
        assert_eq!(sink[0].0, "first");
        assert!(matches!(sink[0].1, DownloadOutcome::Cancelled));
        assert_eq!(sink[1].0, "second");
        assert!(sink[1].1.is_success());
    }

    #[tokio::test]
    async fn test_cancel_pending_removes_from_queue() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        submit_recording(&downloader, "running", DownloadOptions::default(), &sink);
        let queued = submit_recording(&downloader, "queued", DownloadOptions::default(), &sink);
        assert_eq!(downloader.pending_downloads(), 1);

        assert!(queued.cancel());
        assert_eq!(downloader.pending_downloads(), 0);
        assert_eq!(sink.lock().len(), 1);

        transport.release();
        wait_until(|| sink.lock().len() == 2).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fifo_and_lifo_admission() {
        for (order, expected) in [
            (DownloadOrder::Fifo, vec!["/a", "/b", "/c", "/d"]),
            (DownloadOrder::Lifo, vec!["/a", "/d", "/c", "/b"]),
        ] {
            let transport = Arc::new(GatedTransport::default());
            let downloader = downloader(1, transport.clone());
            downloader.set_order(order);
            let sink = Arc::new(Mutex::new(Vec::new()));

            for path in ["a", "b", "c", "d"] {
                submit_recording(&downloader, path, DownloadOptions::default(), &sink);
            }
            transport.release();
            wait_until(|| sink.lock().len() == 4).await;

            assert_eq!(*transport.started.lock(), expected, "{order:?}");
        }
    }

    #[tokio::test]
    async fn test_priority_lanes() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        submit_recording(&downloader, "first", DownloadOptions::default(), &sink);
        submit_recording(&downloader, "low", DownloadOptions::new().low_priority(), &sink);
        submit_recording(&downloader, "normal", DownloadOptions::default(), &sink);
        submit_recording(&downloader, "high", DownloadOptions::new().high_priority(), &sink);
        submit_recording(
            &downloader,
            "both",
            DownloadOptions::new().high_priority().low_priority(),
            &sink,
        );

        transport.release();
        wait_until(|| sink.lock().len() == 5).await;
        assert_eq!(
            *transport.started.lock(),
            vec!["/first", "/both", "/high", "/normal", "/low"]
        );
    }

    #[tokio::test]
    async fn test_suspension_holds_queue() {
        let transport = Arc::new(GatedTransport::default());
        transport.release();
        let downloader = downloader(2, transport.clone());
        downloader.set_suspended(true);
        let sink = Arc::new(Mutex::new(Vec::new()));

        submit_recording(&downloader, "a", DownloadOptions::default(), &sink);
        submit_recording(&downloader, "b", DownloadOptions::default(), &sink);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(downloader.pending_downloads(), 2);

        downloader.set_suspended(false);
        wait_until(|| sink.lock().len() == 2).await;
    }

    #[tokio::test]
    async fn test_raising_cap_admits_queued_work() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        let sink = Arc::new(Mutex::new(Vec::new()));

        for path in ["a", "b", "c"] {
            submit_recording(&downloader, path, DownloadOptions::default(), &sink);
        }
        assert_eq!(downloader.current_downloads(), 1);

        downloader.set_max_concurrent(3);
        assert_eq!(downloader.current_downloads(), 3);
        assert_eq!(downloader.pending_downloads(), 0);

        wait_until(|| transport.fetches.load(Ordering::SeqCst) == 3).await;
        transport.release();
        wait_until(|| sink.lock().len() == 3).await;
    }

    #[tokio::test]
    async fn test_ticket_and_events() {
        let transport = Arc::new(GatedTransport::default());
        transport.release();
        let downloader = downloader(1, transport.clone());
        let mut events = downloader.subscribe();

        let ticket = downloader
            .download("http://example.com/ticket", DownloadOptions::default())
            .unwrap();
        let outcome = ticket.outcome().await;
        assert_eq!(outcome.data().unwrap().as_ref(), b"/ticket");

        let key = CacheKey::from_url("http://example.com/ticket");
        assert_eq!(events.recv().await.unwrap(), DownloadEvent::Started(key.clone()));
        assert_eq!(events.recv().await.unwrap(), DownloadEvent::Stopped(key.clone()));
        assert_eq!(events.recv().await.unwrap(), DownloadEvent::Finished(key));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let downloader = downloader(1, Arc::new(GatedTransport::default()));
        let err = downloader
            .download("not a url", DownloadOptions::default())
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_headers_can_be_set_and_removed() {
        let downloader = downloader(1, Arc::new(GatedTransport::default()));
        let name = HeaderName::from_static("x-token");
        downloader.set_header(name.clone(), Some(HeaderValue::from_static("abc")));
        assert_eq!(downloader.header("x-token").unwrap(), "abc");
        downloader.set_header(name, None);
        assert!(downloader.header("x-token").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_completion_notifies_each_observer_once() {
        const OBSERVERS: usize = 2_000;
        const KEYS: usize = 7;

        let transport = Arc::new(GatedTransport::default());
        transport.release();
        let downloader = downloader(3, transport.clone());

        let counters: Vec<Arc<AtomicUsize>> =
            (0..OBSERVERS).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut cancels = Vec::with_capacity(OBSERVERS);
        for (i, counter) in counters.iter().enumerate() {
            let path = format!("k{}", i % KEYS);
            let counter = counter.clone();
            let handle = downloader.submit(
                CacheKey::from(path.as_str()),
                url(&path),
                DownloadOptions::default(),
                DownloadObserver::new().on_complete(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            cancels.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                handle.cancel();
            }));
        }
        for cancel in cancels {
            cancel.await.unwrap();
        }

        for _ in 0..400 {
            if counters.iter().all(|c| c.load(Ordering::SeqCst) >= 1)
                && downloader.current_downloads() == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let wrong: Vec<(usize, usize)> = counters
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .enumerate()
            .filter(|(_, n)| *n != 1)
            .collect();
        assert!(wrong.is_empty(), "observers not notified exactly once: {wrong:?}");
        assert_eq!(downloader.current_downloads(), 0);
        assert_eq!(downloader.pending_downloads(), 0);
    }

    #[tokio::test]
    async fn test_dropping_downloader_cancels_queued_observers() {
        let transport = Arc::new(GatedTransport::default());
        let downloader = downloader(1, transport.clone());
        downloader.set_suspended(true);
        let sink = Arc::new(Mutex::new(Vec::new()));

        let queued = submit_recording(&downloader, "queued", DownloadOptions::default(), &sink);
        submit_recording(&downloader, "low", DownloadOptions::new().low_priority(), &sink);
        assert_eq!(downloader.pending_downloads(), 2);

        drop(downloader);

        let sink = sink.lock();
        assert_eq!(sink.len(), 2);
        assert!(sink.iter().all(|(_, o)| matches!(o, DownloadOutcome::Cancelled)));
        assert_eq!(queued.operation().state(), OperationState::Cancelled);
        assert!(!queued.cancel(), "already notified");
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_requires_runtime() {
        let result = Downloader::with_transport(
            DownloaderConfig::default(),
            Arc::new(GatedTransport::default()),
        );
        assert!(matches!(result, Err(DownloadError::NoRuntime)));
    }
}
