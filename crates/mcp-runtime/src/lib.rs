#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::{BoxError, ErrorData};

/// JSON-RPC envelope and protocol data types
pub mod model;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod handler;
#[cfg(any(feature = "client", feature = "server"))]
pub mod service;
pub mod transport;

#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub use service::client::{ClientError, McpClient, McpClientOptions};
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub use service::server::{McpServer, McpServerOptions};
pub use transport::{Transport, TransportError};

#[cfg(feature = "schemars")]
#[cfg_attr(docsrs, doc(cfg(feature = "schemars")))]
pub use schemars;
pub use serde;
pub use serde_json;
