use std::sync::Arc;

use tracing::{debug, warn};

use crate::interfaces::DiscardInterface;
use crate::transaction::ServerTransaction;

/// Answers discarded requests with 503 and a Retry-After
pub struct RejectHelper {
    retry_after: u32,
    inner: Option<Arc<dyn DiscardInterface>>,
}

impl RejectHelper {
    pub fn new(retry_after_secs: u32) -> Self {
        Self {
            retry_after: retry_after_secs,
            inner: None,
        }
    }

    /// Also notify `inner` after the rejection went out
    pub fn with_inner(mut self, inner: Arc<dyn DiscardInterface>) -> Self {
        self.inner = Some(inner);
        self
    }
}

impl DiscardInterface for RejectHelper {
    fn discard(&self, tx: &ServerTransaction) {
        let mut response = tx.create_response(503);
        response.push_header("Retry-After", self.retry_after.to_string());
        match tx.send_response(response) {
            Ok(()) => debug!(id = %tx.key(), retry_after = self.retry_after, "request rejected"),
            Err(e) => warn!(id = %tx.key(), error = %e, "could not reject request"),
        }
        if let Some(inner) = &self.inner {
            inner.discard(tx);
        }
    }
}
