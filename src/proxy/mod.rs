pub mod access_log;
pub mod discovery;
pub mod forwarder;
pub mod handler;
pub mod health_check;
pub mod server;
pub mod tls;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

/// Body type every pipeline response uses: either a buffered canned body or
/// a streamed upstream body.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a buffered payload in the streaming body type.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty body.
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}
