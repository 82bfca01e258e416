use std::task::Poll;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use snafu::prelude::*;
use tokio_tungstenite::tungstenite::{self as websocket, protocol::frame::coding::CloseCode};

use super::Envelope;
use crate::client::transport::WebsocketClient;

/// Error when read/write the envelope stream/sink
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum WireError {
    /// underlying websocket stream broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        source: websocket::Error,
    },

    /// peer closed the connection
    #[snafu(display("connection closed by peer (clean: {clean})"))]
    ConnectionClosed {
        /// true when the peer sent a normal close code
        clean: bool,
    },

    /// received a control frame that carries no envelope
    #[snafu(display("received a non-data frame"))]
    NonDataFrame,

    /// frame payload is not a valid envelope
    #[snafu(display("parse frame to envelope failed: {source}"))]
    ParseFailed {
        /// frame payload
        data: Bytes,
        /// source error
        source: serde_json::Error,
    },
}

impl WireError {
    /// Check if this error means the transport is gone.
    ///
    /// Non-fatal errors (malformed or non-data frames) are skipped with a
    /// warning; fatal ones tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Websocket { .. } | Self::ConnectionClosed { .. })
    }
}

/// JSON envelope stream/sink over a websocket connection.
#[derive(Debug)]
pub struct EnvelopeStream {
    ws: WebsocketClient,
}

impl EnvelopeStream {
    /// Wrap an established websocket connection.
    pub fn new(ws: WebsocketClient) -> Self {
        Self { ws }
    }

    fn decode(data: Bytes) -> Result<Envelope, WireError> {
        serde_json::from_slice(&data).with_context(|_| error::ParseFailed { data: data.clone() })
    }
}

impl Stream for EnvelopeStream {
    type Item = Result<Envelope, WireError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match self.ws.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Err(err))) => {
                Poll::Ready(Some(Err(WireError::Websocket { source: err })))
            }
            Poll::Ready(Some(Ok(frame))) => {
                let result = match frame {
                    websocket::Message::Text(data) => Self::decode(Bytes::from(data)),
                    websocket::Message::Binary(data) => Self::decode(Bytes::from(data)),
                    websocket::Message::Close(frame) => {
                        let clean = matches!(
                            frame,
                            Some(ref f) if f.code == CloseCode::Normal || f.code == CloseCode::Away
                        );
                        Err(WireError::ConnectionClosed { clean })
                    }
                    // ws-level ping/pong is handled by the protocol layer
                    _ => Err(WireError::NonDataFrame),
                };
                Poll::Ready(Some(result))
            }
        }
    }
}

impl Sink<Envelope> for EnvelopeStream {
    type Error = WireError;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_ready_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: Envelope) -> Result<(), Self::Error> {
        // envelope is a plain struct, serialization can not fail
        let payload = serde_json::to_string(&item).unwrap_or_default();
        self.ws
            .start_send_unpin(websocket::Message::Text(payload))
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_flush_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_close_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }
}
