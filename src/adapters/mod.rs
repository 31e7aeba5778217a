//! Transport adapters: the generic HTTP client and the authority built on it.

pub mod http_authority;
pub mod http_client;

pub use http_authority::HttpAuthority;
pub use http_client::{HttpClient, HttpMethod, ReqwestHttpClient, SimpleHttpResponse};
