//! The two protocol endpoints: [`server::McpServer`] dispatches inbound
//! requests to its registries, [`client::McpClient`] correlates outbound
//! requests with their responses.
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;
