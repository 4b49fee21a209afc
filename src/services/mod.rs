//! Services module
//!
//! Token cache, signature verification, service registry and platform client.

mod forward;
mod registry;
mod signature;
mod token_cache;
mod wx_client;

pub use forward::{InboundMessage, MessageHandler, Reply, NO_REPLY, USER_INFO_HEADER};
pub use registry::{ServiceEntry, ServiceRegistry};
pub use signature::{compute_signature, SignatureParams, SignatureVerifier};
pub use token_cache::{
    token_file_path, AccessTokenCache, IssuedToken, TokenError, TokenFetcher,
    DEFAULT_REFRESH_MARGIN_SECS,
};
pub use wx_client::{upstream_error, WxClient, WxTokenFetcher};
