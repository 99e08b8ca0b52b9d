//! Per-client output channels.
//!
//! Transport framing lives outside this crate; a connected client is a
//! bounded channel of [`Downstream`] frames. A slow consumer exerts
//! backpressure on the view-syncer through the bounded buffer; a dropped
//! receiver closes the connection.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use zync_core::models::version::CvrVersion;
use zync_core::protocol::{Downstream, ErrorBody};
use zync_core::ClientId;

pub struct ClientConnection {
    client_id: ClientId,
    schema_version: u32,
    base_cookie: Option<CvrVersion>,
    sender: mpsc::Sender<Downstream>,
    open: bool,
}

impl ClientConnection {
    /// Opens a connection with the given output buffer; the returned
    /// stream is handed to the transport.
    pub fn new(
        client_id: ClientId,
        schema_version: u32,
        base_cookie: Option<CvrVersion>,
        buffer: usize,
    ) -> (Self, ReceiverStream<Downstream>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self { client_id, schema_version, base_cookie, sender, open: true },
            ReceiverStream::new(receiver),
        )
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn base_cookie(&self) -> Option<&CvrVersion> {
        self.base_cookie.as_ref()
    }

    pub fn set_base_cookie(&mut self, cookie: CvrVersion) {
        self.base_cookie = Some(cookie);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Sends one frame; returns false (and closes) when the receiver is
    /// gone.
    pub async fn send(&mut self, frame: Downstream) -> bool {
        if !self.open {
            return false;
        }
        if self.sender.send(frame).await.is_err() {
            debug!(client = %self.client_id, "client receiver dropped, closing");
            self.open = false;
        }
        self.open
    }

    /// Terminates the subscription with a typed error frame.
    pub async fn fail(&mut self, error: ErrorBody) {
        warn!(client = %self.client_id, kind = %error.kind, message = %error.message,
            "failing client subscription");
        let _ = self.send(Downstream::Error(error)).await;
        self.open = false;
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_stream::StreamExt;
    use zync_core::protocol::{ErrorKind, PokeEndBody};

    #[tokio::test]
    async fn test_send_and_close_on_drop() {
        let (mut conn, mut stream) =
            ClientConnection::new("c1".to_string(), 1, None, 4);
        assert!(
            conn.send(Downstream::PokeEnd(PokeEndBody {
                poke_id: "01".to_string(),
                cookie: "01".to_string(),
            }))
            .await
        );
        assert!(matches!(stream.next().await, Some(Downstream::PokeEnd(_))));

        drop(stream);
        assert!(
            !conn
                .send(Downstream::PokeEnd(PokeEndBody {
                    poke_id: "02".to_string(),
                    cookie: "02".to_string(),
                }))
                .await
        );
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_fail_emits_terminal_error() {
        let (mut conn, mut stream) =
            ClientConnection::new("c1".to_string(), 1, None, 4);
        conn.fail(ErrorBody::new(ErrorKind::ClientNotFound, "gone")).await;
        assert!(matches!(
            stream.next().await,
            Some(Downstream::Error(body)) if body.kind == ErrorKind::ClientNotFound
        ));
        assert!(!conn.is_open());
    }
}
