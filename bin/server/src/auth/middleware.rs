//! Request extractors for Axum.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{
        HeaderMap,
        header::{FORWARDED, USER_AGENT},
        request::Parts,
    },
};
use std::convert::Infallible;
use std::net::SocketAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Where a request came from, as far as the relay can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// First hop of `X-Forwarded-For`, else the socket peer, else "unknown".
    pub ip: String,
    /// `User-Agent` header, or empty.
    pub user_agent: String,
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Ok(Self {
            ip: forwarded_for(&parts.headers)
                .or(peer)
                .unwrap_or_else(|| "unknown".to_string()),
            user_agent: parts
                .headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            // RFC 7239: `Forwarded: for=1.2.3.4;proto=https`
            headers
                .get(FORWARDED)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|hop| {
                    hop.split(';')
                        .filter_map(|pair| pair.trim().split_once('='))
                        .find(|(key, _)| key.eq_ignore_ascii_case("for"))
                        .map(|(_, ip)| ip.trim_matches('"').to_string())
                })
        })
}
