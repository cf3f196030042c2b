pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod rewrite;
pub mod upstream;

pub use config::RelayConfig;
pub use error::{ConnectError, RelayError};
pub use relay::{Relay, RelaySettings};
pub use rewrite::RewriteRule;
pub use upstream::{TlsUpstream, UpstreamConnector};
