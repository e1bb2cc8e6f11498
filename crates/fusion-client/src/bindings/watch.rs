//! A retargetable subscription mirrored into a `watch` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::FusionContext;
use crate::fetcher::{FetchParams, Fetcher};
use crate::subscription::{RefetchHandle, SubscriptionRequest, SubscriptionResult};

/// What makes two requests the same target. Fetchers compare by identity.
struct RequestKey {
    url: Option<String>,
    params: FetchParams,
    wait: Option<u64>,
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl RequestKey {
    fn of(request: &SubscriptionRequest) -> Self {
        let options = request.options.as_ref();
        Self {
            url: request.url.clone(),
            params: request.params.clone(),
            wait: options.and_then(|o| o.wait),
            fetcher: options.and_then(|o| o.fetcher.clone()),
        }
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        let same_fetcher = match (&self.fetcher, &other.fetcher) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.url == other.url && self.params == other.params && self.wait == other.wait && same_fetcher
    }
}

struct Forward {
    task: JoinHandle<()>,
    refetch: RefetchHandle,
}

/// A subscription whose latest state lives in a `watch` channel.
///
/// Retargeting to a different url, params or options unsubscribes the
/// previous subscription first; retargeting to an equal request does nothing.
/// Dropping stops forwarding and unsubscribes.
pub struct WatchedSubscription<T> {
    context: FusionContext,
    default_data: T,
    target: Option<RequestKey>,
    forward: Option<Forward>,
    generation: Arc<AtomicU64>,
    state: watch::Sender<SubscriptionResult<T>>,
}

impl<T> WatchedSubscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Idle watcher holding `{loading: true, data: default_data}`.
    pub fn new(context: FusionContext, default_data: T) -> Self {
        let (state, _) = watch::channel(SubscriptionResult {
            loading: true,
            error: None,
            data: default_data.clone(),
        });
        Self {
            context,
            default_data,
            target: None,
            forward: None,
            generation: Arc::new(AtomicU64::new(0)),
            state,
        }
    }

    /// Point the watcher at `request`. Returns whether it resubscribed.
    pub fn set_request(&mut self, request: SubscriptionRequest) -> bool {
        let key = RequestKey::of(&request);
        if self.target.as_ref() == Some(&key) {
            return false;
        }
        self.stop();
        self.target = Some(key);
        if request.url.is_none() {
            debug!("watched subscription idle");
            return true;
        }

        let mut subscription = self.context.subscribe(self.default_data.clone(), request);
        let refetch = subscription.refetch_handle();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let state = self.state.clone();
        let task = self.context.runtime().spawn(async move {
            while let Some(result) = subscription.next_update().await {
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let _ = state.send_replace(result);
            }
        });
        self.forward = Some(Forward { task, refetch });
        true
    }

    /// Point the watcher at `url` with no params.
    pub fn set_url(&mut self, url: Option<&str>) -> bool {
        let request = match url {
            Some(url) => SubscriptionRequest::new(url),
            None => SubscriptionRequest::idle(),
        };
        self.set_request(request)
    }

    /// Receiver for state changes.
    pub fn watch(&self) -> watch::Receiver<SubscriptionResult<T>> {
        self.state.subscribe()
    }

    /// The latest state.
    pub fn latest(&self) -> SubscriptionResult<T> {
        self.state.borrow().clone()
    }

    /// Skip the throttle on the current subscription.
    pub fn request_update_now(&self) -> bool {
        self.forward
            .as_ref()
            .is_some_and(|f| f.refetch.request_update_now())
    }
}

impl<T> WatchedSubscription<T> {
    /// Unsubscribe without forgetting the target.
    fn stop(&mut self) {
        let _ = self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(forward) = self.forward.take() {
            forward.task.abort();
        }
    }
}

impl<T> Drop for WatchedSubscription<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
