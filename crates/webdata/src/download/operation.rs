//! # Download Operation
//!
//! One in-flight fetch for one key, shared by every observer that asked for
//! that key while it was pending or running.
//!
//! Each observer receives exactly one terminal callback. The observer slot is
//! removed from the map under the operation lock by whichever side gets there
//! first (completion or cancellation), and only that side fires the callback.
//! Callbacks always run after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::DownloadError;
use crate::cache::CacheKey;
use crate::download::events::DownloadEvent;
use crate::download::options::DownloadOptions;
use crate::download::transport::{ProgressReporter, TransportResponse, TransportSignal};

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;
pub type CompletionCallback = Box<dyn FnOnce(DownloadOutcome) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    /// `None` when the server did not announce a length
    pub expected: Option<u64>,
}

/// Terminal result delivered to an observer
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// The transfer ran to completion. `error` is set for non-success HTTP
    /// statuses; `data` is `None` for those and for ignored cached responses.
    Finished {
        data: Option<Bytes>,
        error: Option<DownloadError>,
    },
    Cancelled,
    Failed(DownloadError),
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Finished { error: None, .. })
    }

    pub fn data(&self) -> Option<&Bytes> {
        match self {
            DownloadOutcome::Finished { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&DownloadError> {
        match self {
            DownloadOutcome::Finished { error, .. } => error.as_ref(),
            DownloadOutcome::Failed(error) => Some(error),
            DownloadOutcome::Cancelled => None,
        }
    }

    fn state(&self) -> OperationState {
        match self {
            DownloadOutcome::Finished { .. } => OperationState::Finished,
            DownloadOutcome::Cancelled => OperationState::Cancelled,
            DownloadOutcome::Failed(_) => OperationState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Finished | OperationState::Cancelled | OperationState::Failed
        )
    }
}

/// Callbacks registered by one caller of the downloader
#[derive(Default)]
pub struct DownloadObserver {
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

impl DownloadObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(DownloadProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(DownloadOutcome) + Send + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for DownloadObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadObserver")
            .field("progress", &self.progress.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

pub(crate) type ObserverId = u64;

struct ObserverSlot {
    observer: DownloadObserver,
    progressive: bool,
    ignore_cached_response: bool,
}

impl ObserverSlot {
    /// A transport-cache answer carries no asset body. Observers that opted
    /// to ignore it get an empty success, the rest see the status as an error.
    fn outcome_for(&self, outcome: &DownloadOutcome, from_cache: bool) -> DownloadOutcome {
        match outcome {
            DownloadOutcome::Finished { .. } if from_cache && self.ignore_cached_response => {
                DownloadOutcome::Finished {
                    data: None,
                    error: None,
                }
            }
            other => other.clone(),
        }
    }
}

struct OperationInner {
    state: OperationState,
    observers: HashMap<ObserverId, ObserverSlot>,
    next_observer: ObserverId,
    outcome: Option<DownloadOutcome>,
}

/// Result of detaching an observer that was still attached
pub(crate) struct Detached {
    pub completion: Option<CompletionCallback>,
    /// State the operation was aborted from, when this was the last observer
    pub aborted_from: Option<OperationState>,
}

impl Detached {
    pub fn notify(self) {
        if let Some(completion) = self.completion {
            completion(DownloadOutcome::Cancelled);
        }
    }
}

pub struct DownloadOperation {
    id: u64,
    key: CacheKey,
    url: Url,
    options: DownloadOptions,
    cancel: CancellationToken,
    events: broadcast::Sender<DownloadEvent>,
    inner: Mutex<OperationInner>,
}

impl DownloadOperation {
    pub(crate) fn new(
        id: u64,
        key: CacheKey,
        url: Url,
        options: DownloadOptions,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        Self {
            id,
            key,
            url,
            options,
            cancel: CancellationToken::new(),
            events,
            inner: Mutex::new(OperationInner {
                state: OperationState::Pending,
                observers: HashMap::new(),
                next_observer: 0,
                outcome: None,
            }),
        }
    }

    /// A pending operation with `observer` already attached
    pub(crate) fn with_first_observer(
        id: u64,
        key: CacheKey,
        url: Url,
        options: DownloadOptions,
        events: broadcast::Sender<DownloadEvent>,
        observer: DownloadObserver,
    ) -> (Arc<Self>, ObserverId) {
        let operation = Self::new(id, key, url, options, events);
        {
            let mut inner = operation.inner.lock();
            inner.next_observer = 1;
            inner.observers.insert(
                0,
                ObserverSlot {
                    observer,
                    progressive: options.progressive,
                    ignore_cached_response: options.ignore_cached_response,
                },
            );
        }
        (Arc::new(operation), 0)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Options of the request that created this operation
    pub fn options(&self) -> DownloadOptions {
        self.options
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// The recorded terminal outcome, once there is one
    pub fn outcome(&self) -> Option<DownloadOutcome> {
        self.inner.lock().outcome.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attach an observer. Gives it back if the operation already ended.
    pub(crate) fn attach(
        &self,
        observer: DownloadObserver,
        options: &DownloadOptions,
    ) -> Result<ObserverId, DownloadObserver> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(observer);
        }
        let id = inner.next_observer;
        inner.next_observer += 1;
        inner.observers.insert(
            id,
            ObserverSlot {
                observer,
                progressive: options.progressive,
                ignore_cached_response: options.ignore_cached_response,
            },
        );
        Ok(id)
    }

    /// Detach an observer. `None` if it was already notified or detached.
    ///
    /// Removing the last observer of a live operation cancels it.
    pub(crate) fn detach(&self, observer: ObserverId) -> Option<Detached> {
        let mut inner = self.inner.lock();
        let slot = inner.observers.remove(&observer)?;

        let mut aborted_from = None;
        if inner.observers.is_empty() && !inner.state.is_terminal() {
            aborted_from = Some(inner.state);
            inner.state = OperationState::Cancelled;
            inner.outcome = Some(DownloadOutcome::Cancelled);
            self.cancel.cancel();
        }
        drop(inner);

        if aborted_from == Some(OperationState::Running) {
            debug!(key = %self.key, "Last observer left, aborting transfer");
            let _ = self.events.send(DownloadEvent::Stopped(self.key.clone()));
        }

        Some(Detached {
            completion: slot.observer.completion,
            aborted_from,
        })
    }

    /// Move from pending to running. False if the operation was cancelled.
    pub(crate) fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != OperationState::Pending {
            return false;
        }
        inner.state = OperationState::Running;
        drop(inner);
        let _ = self.events.send(DownloadEvent::Started(self.key.clone()));
        true
    }

    pub(crate) fn progress_reporter(self: &Arc<Self>) -> ProgressReporter {
        let operation = Arc::downgrade(self);
        ProgressReporter::new(move |signal| {
            if let Some(operation) = operation.upgrade() {
                operation.report(signal);
            }
        })
    }

    fn report(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::ResponseReceived { expected } => {
                let _ = self
                    .events
                    .send(DownloadEvent::ResponseReceived(self.key.clone()));
                self.notify_progress(DownloadProgress {
                    received: 0,
                    expected,
                });
            }
            TransportSignal::Progress { received, expected } => {
                self.notify_progress(DownloadProgress { received, expected });
            }
        }
    }

    fn notify_progress(&self, progress: DownloadProgress) {
        let callbacks: Vec<ProgressCallback> = {
            let inner = self.inner.lock();
            if inner.state != OperationState::Running {
                return;
            }
            inner
                .observers
                .values()
                .filter(|slot| slot.progressive)
                .filter_map(|slot| slot.observer.progress.clone())
                .collect()
        };
        for callback in callbacks {
            callback(progress);
        }
    }

    /// Record the transport result and notify every remaining observer.
    ///
    /// A no-op when the operation was already cancelled.
    pub(crate) fn complete(&self, result: Result<TransportResponse, DownloadError>) {
        let (outcome, from_cache) = match result {
            Ok(response) if response.from_cache => (
                DownloadOutcome::Finished {
                    data: None,
                    error: Some(DownloadError::Status(response.status)),
                },
                true,
            ),
            Ok(response) if response.status.is_success() => (
                DownloadOutcome::Finished {
                    data: Some(response.data),
                    error: None,
                },
                false,
            ),
            Ok(response) => (
                DownloadOutcome::Finished {
                    data: None,
                    error: Some(DownloadError::Status(response.status)),
                },
                false,
            ),
            Err(DownloadError::Cancelled) => (DownloadOutcome::Cancelled, false),
            Err(e) => (DownloadOutcome::Failed(e), false),
        };

        let slots: Vec<ObserverSlot> = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = outcome.state();
            inner.outcome = Some(outcome.clone());
            inner.observers.drain().map(|(_, slot)| slot).collect()
        };

        debug!(key = %self.key, state = ?outcome.state(), observers = slots.len(), "Download ended");
        let _ = self.events.send(DownloadEvent::Stopped(self.key.clone()));
        if matches!(outcome, DownloadOutcome::Finished { .. }) {
            let _ = self.events.send(DownloadEvent::Finished(self.key.clone()));
        }

        for slot in slots {
            let delivered = slot.outcome_for(&outcome, from_cache);
            if let Some(completion) = slot.observer.completion {
                completion(delivered);
            }
        }
    }
}

impl std::fmt::Debug for DownloadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOperation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn operation() -> Arc<DownloadOperation> {
        let (events, _) = broadcast::channel(16);
        Arc::new(DownloadOperation::new(
            1,
            CacheKey::from("k"),
            Url::parse("http://example.com/k").unwrap(),
            DownloadOptions::default(),
            events,
        ))
    }

    fn counting_observer(counter: &Arc<AtomicUsize>) -> DownloadObserver {
        let counter = counter.clone();
        DownloadObserver::new().on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn ok_response(status: StatusCode) -> TransportResponse {
        TransportResponse {
            data: Bytes::from_static(b"body"),
            status,
            expected_len: Some(4),
            from_cache: status == StatusCode::NOT_MODIFIED,
        }
    }

    #[test]
    fn test_complete_notifies_every_observer_once() {
        let op = operation();
        let counter = Arc::new(AtomicUsize::new(0));
        let options = DownloadOptions::default();
        op.attach(counting_observer(&counter), &options).unwrap();
        op.attach(counting_observer(&counter), &options).unwrap();
        assert!(op.start());

        op.complete(Ok(ok_response(StatusCode::OK)));
        op.complete(Ok(ok_response(StatusCode::OK)));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(op.state(), OperationState::Finished);
        assert!(op.outcome().unwrap().is_success());
    }

    #[test]
    fn test_detach_after_complete_is_noop() {
        let op = operation();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = op
            .attach(counting_observer(&counter), &DownloadOptions::default())
            .unwrap();
        op.start();
        op.complete(Ok(ok_response(StatusCode::OK)));

        assert!(op.detach(id).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(op.state(), OperationState::Finished);
    }

    #[test]
    fn test_last_detach_cancels_and_complete_is_ignored() {
        let op = operation();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let id = op
            .attach(
                DownloadObserver::new().on_complete(move |o| sink.lock().push(o)),
                &DownloadOptions::default(),
            )
            .unwrap();
        op.start();

        let detached = op.detach(id).unwrap();
        assert_eq!(detached.aborted_from, Some(OperationState::Running));
        detached.notify();
        assert!(op.cancel_token().is_cancelled());

        op.complete(Ok(ok_response(StatusCode::OK)));
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], DownloadOutcome::Cancelled));
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn test_detach_one_of_two_keeps_running() {
        let op = operation();
        let counter = Arc::new(AtomicUsize::new(0));
        let options = DownloadOptions::default();
        let first = op.attach(counting_observer(&counter), &options).unwrap();
        op.attach(counting_observer(&counter), &options).unwrap();
        op.start();

        let detached = op.detach(first).unwrap();
        assert!(detached.aborted_from.is_none());
        detached.notify();
        assert!(!op.cancel_token().is_cancelled());

        op.complete(Ok(ok_response(StatusCode::OK)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_status_finishes_with_error() {
        let op = operation();
        op.attach(DownloadObserver::new(), &DownloadOptions::default())
            .unwrap();
        op.start();
        op.complete(Ok(ok_response(StatusCode::NOT_FOUND)));

        let outcome = op.outcome().unwrap();
        assert!(!outcome.is_success());
        assert!(matches!(
            outcome.error(),
            Some(DownloadError::Status(code)) if *code == StatusCode::NOT_FOUND
        ));
        assert_eq!(op.state(), OperationState::Finished);
    }

    #[test]
    fn test_cached_response_ignored_per_observer() {
        let op = operation();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink_a = outcomes.clone();
        let sink_b = outcomes.clone();
        op.attach(
            DownloadObserver::new().on_complete(move |o| sink_a.lock().push((true, o))),
            &DownloadOptions::new().ignore_cached_response(),
        )
        .unwrap();
        op.attach(
            DownloadObserver::new().on_complete(move |o| sink_b.lock().push((false, o))),
            &DownloadOptions::new(),
        )
        .unwrap();
        op.start();
        op.complete(Ok(ok_response(StatusCode::NOT_MODIFIED)));

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 2);
        for (ignoring, outcome) in outcomes.iter() {
            assert!(outcome.data().is_none());
            assert_eq!(outcome.is_success(), *ignoring);
            if !*ignoring {
                assert!(matches!(
                    outcome.error(),
                    Some(DownloadError::Status(code)) if *code == StatusCode::NOT_MODIFIED
                ));
            }
        }
    }

    #[test]
    fn test_progress_only_for_progressive_observers() {
        let op = operation();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        op.attach(
            DownloadObserver::new().on_progress(move |p| sink.lock().push(p)),
            &DownloadOptions::new().progressive(),
        )
        .unwrap();
        let quiet = Arc::new(AtomicUsize::new(0));
        let quiet_sink = quiet.clone();
        op.attach(
            DownloadObserver::new().on_progress(move |_| {
                quiet_sink.fetch_add(1, Ordering::SeqCst);
            }),
            &DownloadOptions::new(),
        )
        .unwrap();
        op.start();

        let reporter = op.progress_reporter();
        reporter.response_received(Some(10));
        reporter.progress(4, Some(10));
        reporter.progress(10, Some(10));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2],
            DownloadProgress {
                received: 10,
                expected: Some(10)
            }
        );
        assert_eq!(quiet.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attach_to_terminal_operation_is_refused() {
        let op = operation();
        let id = op
            .attach(DownloadObserver::new(), &DownloadOptions::default())
            .unwrap();
        op.detach(id).unwrap();
        assert!(op.attach(DownloadObserver::new(), &DownloadOptions::default()).is_err());
        assert!(!op.start());
    }
}
