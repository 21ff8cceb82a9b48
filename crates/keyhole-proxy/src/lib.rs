mod config;
mod connect;
mod errors;
mod headers;
mod http1;
mod request_log;
mod server;
mod session;

pub use config::ProxyConfig;
pub use connect::{
    parse_connect_request_head, parse_connect_request_line, ConnectParseError, ConnectRequest,
};
pub use errors::{BridgeError, CredentialError, ProxyError, SessionError};
pub use headers::REASON_HEADER;
pub use request_log::RequestLog;
pub use server::{InterceptingProxy, ServerRunSummary};
pub use session::{
    AccessCredential, ClientConfigBridge, CredentialSource, ProxySession, SessionController,
    SessionOutcome, ShutdownTrigger,
};
