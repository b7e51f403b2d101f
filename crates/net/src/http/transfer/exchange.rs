use http::Method;
use tracing::debug;

use crate::ensure;
use crate::http::transfer::HttpTransferManager;
use crate::http::{ConnectionDirective, HttpRequest, HttpResponse, METHODS};
use crate::protocol::TransferError;
use crate::session::Session;

impl HttpTransferManager {
    /// Builds a request from `"METHOD /path"`, see [`HttpRequest::outgoing`]
    /// for the headers it carries.
    pub fn create_request(line: &str, keep_alive: bool) -> Result<HttpRequest, TransferError> {
        let invalid = || TransferError::InvalidRequestLine(line.to_owned());

        let (method, url) = line.trim().split_once(' ').ok_or_else(invalid)?;
        let url = url.trim();
        ensure!(METHODS.contains(&method), invalid());
        ensure!(!url.is_empty() && !url.bytes().any(|b| b.is_ascii_control() || b == b' '), invalid());

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| TransferError::InvalidRequestLine(format!("{line}: {e}")))?;
        Ok(HttpRequest::outgoing(method, url, keep_alive))
    }

    /// Writes `request` and returns the number of bytes sent.
    pub async fn send_request(&self, session: &Session, request: &HttpRequest) -> Result<usize, TransferError> {
        let sent = session.send(&request.to_bytes()).await?;
        debug!(id = session.id(), route = %request.route(), len = sent, "sent request");
        Ok(sent)
    }

    /// Reads the next response. A `Connection: close` response closes the session.
    pub async fn receive_response(&self, session: &Session) -> Result<HttpResponse, TransferError> {
        let response = self.read_message(session, &self.responses, &self.response_parsers).await?;
        debug!(id = session.id(), status = %response.status(), len = response.body().len(), "received response");

        if response.headers().connection() == Some(ConnectionDirective::Close) {
            debug!(id = session.id(), "peer asked to close the connection");
            self.forget(session.id());
            session.close().await;
        }
        Ok(response)
    }

    /// Sends the request described by `line` and waits for its response.
    ///
    /// A `PUT` announces a chunked body; send it with
    /// [`send_request`](Self::send_request) and
    /// [`send_chunk_file`](Self::send_chunk_file) instead.
    pub async fn round_trip(&self, session: &Session, line: &str, keep_alive: bool) -> Result<HttpResponse, TransferError> {
        let request = Self::create_request(line, keep_alive)?;
        self.send_request(session, &request).await?;
        self.receive_response(session).await
    }
}
