//! Named fields, each kept current by its own subscription.
//!
//! Every field reports into one channel as a [`FieldUpdate`], carrying the
//! whole result or only the data depending on its [`FieldMode`].

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{FusionContext, OptionsOverride};
use crate::fetcher::FetchParams;
use crate::subscription::{SubscriptionRequest, SubscriptionResult};

/// What a field receives on each state change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldMode {
    /// The whole `{loading, error, data}` result.
    #[default]
    Result,
    /// Only `data`.
    DataOnly,
}

/// Declaration of one observed field.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// Endpoint fetched for the initial value.
    pub url: String,
    /// Headers and query for the fetch.
    pub params: FetchParams,
    /// Per-field wait or fetcher.
    pub options: Option<OptionsOverride>,
    /// What the field receives.
    pub mode: FieldMode,
}

impl FieldSpec {
    /// Result-mode field for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: FetchParams::default(),
            options: None,
            mode: FieldMode::Result,
        }
    }

    /// Replace the fetch params.
    #[must_use]
    pub fn with_params(mut self, params: FetchParams) -> Self {
        self.params = params;
        self
    }

    /// Override wait or fetcher for this field.
    #[must_use]
    pub fn with_options(mut self, options: OptionsOverride) -> Self {
        self.options = Some(options);
        self
    }

    /// Deliver only `data`.
    #[must_use]
    pub fn data_only(mut self) -> Self {
        self.mode = FieldMode::DataOnly;
        self
    }

    fn request(&self) -> SubscriptionRequest {
        let request = SubscriptionRequest::new(self.url.clone()).with_params(self.params.clone());
        match &self.options {
            Some(options) => request.with_options(options.clone()),
            None => request,
        }
    }
}

/// New value for a field.
#[derive(Clone, Debug)]
pub enum FieldValue {
    /// For [`FieldMode::Result`] fields.
    Result(SubscriptionResult<Value>),
    /// For [`FieldMode::DataOnly`] fields.
    Data(Value),
}

/// A field changed.
#[derive(Clone, Debug)]
pub struct FieldUpdate {
    /// Declared field name.
    pub field: String,
    /// The new value.
    pub value: FieldValue,
}

/// A set of named fields, each kept fresh by its own subscription while
/// observed.
///
/// Every field reports into the single receiver returned by
/// [`ObservedFields::new`]. A field's default data is whatever value it held
/// when observation started.
pub struct ObservedFields {
    context: FusionContext,
    specs: BTreeMap<String, FieldSpec>,
    active: HashMap<String, JoinHandle<()>>,
    updates: mpsc::UnboundedSender<FieldUpdate>,
}

impl ObservedFields {
    /// Empty field set and the receiver its updates go to.
    pub fn new(context: FusionContext) -> (Self, mpsc::UnboundedReceiver<FieldUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let fields = Self {
            context,
            specs: BTreeMap::new(),
            active: HashMap::new(),
            updates,
        };
        (fields, rx)
    }

    /// Declare `name`. Builder form of [`ObservedFields::declare`].
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.declare(name, spec);
        self
    }

    /// Declare or replace `name`. Takes effect on the next
    /// [`ObservedFields::start_observing`].
    pub fn declare(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let _ = self.specs.insert(name.into(), spec);
    }

    /// Declared field names, sorted.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Subscribe `field`, seeded with its `current` value.
    ///
    /// Returns `false` for undeclared fields and fields already observed.
    pub fn start_observing(&mut self, field: &str, current: Value) -> bool {
        if self.active.contains_key(field) {
            return false;
        }
        let Some(spec) = self.specs.get(field) else {
            warn!(field, "start_observing on undeclared field");
            return false;
        };

        let mut subscription = self.context.subscribe(current, spec.request());
        let mode = spec.mode;
        let name = field.to_owned();
        let updates = self.updates.clone();
        let task = self.context.runtime().spawn(async move {
            while let Some(result) = subscription.next_update().await {
                let value = match mode {
                    FieldMode::Result => FieldValue::Result(result),
                    FieldMode::DataOnly => FieldValue::Data(result.data),
                };
                let update = FieldUpdate {
                    field: name.clone(),
                    value,
                };
                if updates.send(update).is_err() {
                    break;
                }
            }
        });
        debug!(field, "observing");
        let _ = self.active.insert(field.to_owned(), task);
        true
    }

    /// Unsubscribe `field`. Returns whether it was observed.
    pub fn stop_observing(&mut self, field: &str) -> bool {
        match self.active.remove(field) {
            Some(task) => {
                task.abort();
                debug!(field, "stopped observing");
                true
            }
            None => false,
        }
    }

    /// Whether `field` currently has a subscription.
    pub fn is_observing(&self, field: &str) -> bool {
        self.active.contains_key(field)
    }
}

impl Drop for ObservedFields {
    fn drop(&mut self) {
        for (_, task) in self.active.drain() {
            task.abort();
        }
    }
}
