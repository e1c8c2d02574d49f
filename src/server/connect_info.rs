//! Remote address extractor that tolerates routers served without
//! `into_make_service_with_connect_info` (in-process tests).

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl MaybeConnectInfo {
    /// Peer IP as a string, used as the agent's address when it reports none.
    pub fn ip_string(&self) -> Option<String> {
        self.0.map(|addr| addr.ip().to_canonical().to_string())
    }
}

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(MaybeConnectInfo(addr))
    }
}
