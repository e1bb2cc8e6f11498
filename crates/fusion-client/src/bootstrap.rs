//! Initial fetch with unbounded exponential backoff.
//!
//! Transport failures (network errors, non-2xx statuses) are retried forever
//! with `1000 * 2^attempt` ms between attempts. A response that arrives but
//! does not name its publication is terminal for this attempt: retrying
//! would get the same answer.

use serde_json::Value;
use tracing::{debug, warn};

use fusion_core::retry::bootstrap_delay;
use fusion_core::{FusionError, PublicationRef, Result};

use crate::fetcher::{FetchParams, FetchResponse, Fetcher};

/// The initial value and the publication that will keep it fresh.
#[derive(Clone, Debug, PartialEq)]
pub struct Bootstrapped {
    /// The fetched value.
    pub data: Value,
    /// The publication named by the response header.
    pub publication: PublicationRef,
}

/// Fetch `url` until it succeeds or fails terminally.
///
/// Cancel by dropping the future.
pub async fn fetch_initial(fetcher: &dyn Fetcher, url: &str, params: &FetchParams) -> Result<Bootstrapped> {
    let mut attempt: u32 = 0;
    loop {
        match fetcher.fetch(url, params).await {
            Ok(response) => return into_bootstrapped(response),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                let delay = bootstrap_delay(attempt);
                warn!(
                    url,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "initial fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

fn into_bootstrapped(response: FetchResponse) -> Result<Bootstrapped> {
    let publication = response
        .header
        .and_then(|h| h.publication_ref)
        .filter(PublicationRef::is_complete)
        .ok_or_else(|| FusionError::Protocol("publication header was not in response".into()))?;
    debug!(%publication, "bootstrapped");
    Ok(Bootstrapped {
        data: response.data,
        publication,
    })
}
