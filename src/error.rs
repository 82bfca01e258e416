//! engine error types

use snafu::prelude::*;

/// engine error type
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum Error {
    /// Endpoint string is not a valid url
    #[snafu(display("invalid endpoint url {url}: {source}"))]
    InvalidEndpoint {
        /// the offending url string
        url: String,
        /// source error
        source: url::ParseError,
    },

    /// Endpoint url scheme can not carry a websocket
    #[snafu(display("endpoint url {url} has unsupported scheme {scheme}"))]
    UnsupportedScheme {
        /// the offending url string
        url: String,
        /// its scheme
        scheme: String,
    },
}
