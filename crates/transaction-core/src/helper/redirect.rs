use std::sync::Arc;

use rvoip_sip_transport::Transport;
use tracing::{debug, warn};

use crate::interfaces::DiscardInterface;
use crate::transaction::ServerTransaction;

/// Answers discarded requests with 302, pointing the client at another
/// server through `maddr`
pub struct RedirectHelper {
    host: String,
    port: u16,
    transport: Transport,
    inner: Option<Arc<dyn DiscardInterface>>,
}

impl RedirectHelper {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: Arc<dyn DiscardInterface>) -> Self {
        self.inner = Some(inner);
        self
    }

    fn contact(&self, tx: &ServerTransaction) -> String {
        let ruri_host = tx.request().request_uri_host().unwrap_or(self.host.as_str());
        format!(
            "<sip:{}:{};maddr={};transport={}>",
            ruri_host,
            self.port,
            self.host,
            self.transport.as_str().to_ascii_lowercase()
        )
    }
}

impl DiscardInterface for RedirectHelper {
    fn discard(&self, tx: &ServerTransaction) {
        let mut response = tx.create_response(302);
        response.push_header("Contact", self.contact(tx));
        match tx.send_response(response) {
            Ok(()) => debug!(id = %tx.key(), host = %self.host, "request redirected"),
            Err(e) => warn!(id = %tx.key(), error = %e, "could not redirect request"),
        }
        if let Some(inner) = &self.inner {
            inner.discard(tx);
        }
    }
}
