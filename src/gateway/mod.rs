//! The HTTP gateway: request identity, parameter parsing, and the
//! subscription handler.

pub mod challenge_pages;
pub mod handler;

use crate::config::Config;
use crate::db::Database;
use crate::error::RequestError;
use crate::fetch::{AggregationCache, FetchOrchestrator};
use crate::shield::{ChallengeEngine, ShieldGate, ShieldStore};
use axum::http::{header, HeaderMap, Uri};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub store: Arc<dyn ShieldStore>,
    pub gate: Arc<ShieldGate>,
    pub challenges: Arc<ChallengeEngine>,
    pub cache: Arc<AggregationCache>,
    pub fetcher: Arc<FetchOrchestrator>,
}

/// Identity and shape of one inbound request.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    /// Challenge cookie value, if present.
    pub token: Option<String>,
    /// Whether the client looks like an API consumer rather than a
    /// browser; decides challenge presentation.
    pub is_api: bool,
    /// Request line plus user agent, fed to the pattern scanner.
    pub corpus: String,
}

/// Extract the client identity from headers and the socket peer.
///
/// Proxy headers win over the socket address: `CF-Connecting-IP` first,
/// then the first hop of `X-Forwarded-For`. Unparseable values fall
/// back to the peer address.
pub fn client_context(
    headers: &HeaderMap,
    peer: SocketAddr,
    uri: &Uri,
    cookie_name: &str,
) -> ClientContext {
    let ip = header_str(headers, "cf-connecting-ip")
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next().map(str::trim).map(str::to_string))
                .and_then(|first| first.parse().ok())
        })
        .unwrap_or_else(|| peer.ip());

    let user_agent = header_str(headers, "user-agent").map(str::to_string);
    let token = cookie_value(headers, cookie_name);

    let accept = header_str(headers, "accept").unwrap_or("");
    let is_api = accept.contains("application/json")
        || header_str(headers, "x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"));

    // The scanner sees the request line, agent, and cookies together
    let corpus = format!(
        "{} {} {}",
        uri,
        user_agent.as_deref().unwrap_or(""),
        header_str(headers, "cookie").unwrap_or("")
    );

    ClientContext {
        ip,
        user_agent,
        token,
        is_api,
        corpus,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Which subscriptions a request selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidSelector {
    /// Every subscription in the database.
    All,
    /// A single subscription by id.
    One(i64),
    /// An explicit id list.
    Many(Vec<i64>),
}

impl SidSelector {
    /// Parse the `sid` query parameter. Absent and `all` both select
    /// everything; otherwise a positive integer or a comma list of
    /// them.
    pub fn parse(raw: Option<&str>) -> Result<Self, RequestError> {
        let raw = match raw {
            None => return Ok(Self::All),
            Some(r) => r.trim(),
        };
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if raw.contains(',') {
            let ids = raw
                .split(',')
                .map(|part| parse_positive(part.trim()))
                .collect::<Result<Vec<i64>, _>>()?;
            if ids.is_empty() {
                return Err(RequestError::Validation("empty sid list".to_string()));
            }
            return Ok(Self::Many(ids));
        }
        Ok(Self::One(parse_positive(raw)?))
    }
}

fn parse_positive(part: &str) -> Result<i64, RequestError> {
    part.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| RequestError::Validation(format!("invalid sid: {part}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.1.1.1:5000".parse().unwrap()
    }

    #[test]
    fn sid_selector_forms() {
        assert_eq!(SidSelector::parse(None).unwrap(), SidSelector::All);
        assert_eq!(SidSelector::parse(Some("all")).unwrap(), SidSelector::All);
        assert_eq!(SidSelector::parse(Some("")).unwrap(), SidSelector::All);
        assert_eq!(SidSelector::parse(Some("7")).unwrap(), SidSelector::One(7));
        assert_eq!(
            SidSelector::parse(Some("1, 2,3")).unwrap(),
            SidSelector::Many(vec![1, 2, 3])
        );
    }

    #[test]
    fn sid_selector_rejects_garbage() {
        assert!(SidSelector::parse(Some("abc")).is_err());
        assert!(SidSelector::parse(Some("0")).is_err());
        assert!(SidSelector::parse(Some("-3")).is_err());
        assert!(SidSelector::parse(Some("1,x")).is_err());
    }

    #[test]
    fn ip_prefers_proxy_headers() {
        let uri: Uri = "/sub?uuid=u".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("192.0.2.9"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1, 10.0.0.1"),
        );
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert_eq!(ctx.ip.to_string(), "192.0.2.9");

        headers.remove("cf-connecting-ip");
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert_eq!(ctx.ip.to_string(), "198.51.100.1");

        headers.remove("x-forwarded-for");
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert_eq!(ctx.ip.to_string(), "10.1.1.1");
    }

    #[test]
    fn malformed_forwarded_header_falls_back_to_peer() {
        let uri: Uri = "/sub".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert_eq!(ctx.ip.to_string(), "10.1.1.1");
    }

    #[test]
    fn cookie_and_api_detection() {
        let uri: Uri = "/sub".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; sg_token=abcd1234"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert_eq!(ctx.token.as_deref(), Some("abcd1234"));
        assert!(ctx.is_api);
    }

    #[test]
    fn corpus_includes_uri_and_agent() {
        let uri: Uri = "/sub?uuid=u&target=clash".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("clash-verge/1.0"));
        let ctx = client_context(&headers, peer(), &uri, "sg_token");
        assert!(ctx.corpus.contains("target=clash"));
        assert!(ctx.corpus.contains("clash-verge"));
    }
}
