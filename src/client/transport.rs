//! Transport seam between the connection worker and the network.
//!
//! The worker is generic over anything that speaks `Stream + Sink` of
//! envelopes, so tests can drive it through an in-memory transport; the
//! production connector opens a real websocket.

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use snafu::prelude::*;
use tokio_tungstenite as websocket;
use url::Url;

use crate::wire::{Envelope, EnvelopeStream, WireError};

pub(crate) type WebsocketClient =
    websocket::WebSocketStream<websocket::MaybeTlsStream<tokio::net::TcpStream>>;

/// Error when open the websocket endpoint
#[derive(Debug, Snafu)]
#[snafu(
    display("connect endpoint {url} failed: {source}"),
    visibility(pub(crate)),
    module(error),
    context(suffix(false))
)]
pub struct ConnectError {
    /// endpoint url
    pub url: String,
    /// source error
    pub source: websocket::tungstenite::Error,
}

/// Opens a fresh transport for every connection attempt.
#[async_trait]
pub trait Connector: Send + 'static {
    /// the envelope stream/sink a successful attempt yields
    type Transport: Stream<Item = Result<Envelope, WireError>>
        + Sink<Envelope, Error = WireError>
        + Unpin
        + Send
        + 'static;

    /// Open a transport to the endpoint.
    async fn connect(&mut self, endpoint: &Url) -> Result<Self::Transport, ConnectError>;
}

/// The production connector: a `tokio-tungstenite` websocket client.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Transport = EnvelopeStream;

    async fn connect(&mut self, endpoint: &Url) -> Result<Self::Transport, ConnectError> {
        log::debug!("Connecting endpoint: {endpoint}");

        let (ws, _) = websocket::connect_async(endpoint.as_str())
            .await
            .with_context(|_| error::Connect {
                url: endpoint.to_string(),
            })?;

        Ok(EnvelopeStream::new(ws))
    }
}
