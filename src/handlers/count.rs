// Hit ingestion endpoint
// Records one pageview for the site named by the Host header

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
};
use chrono::Utc;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

use crate::{
    app::AppState,
    models::hit::{HitMetadata, RefScheme},
    utils::{fingerprint::Fingerprint, service_error::ServiceError},
};

/// Query parameters sent by the tracking script. Bot classification is left
/// to the layer in front of the collector.
#[derive(Debug, Default, Deserialize)]
pub struct CountQuery {
    /// Path
    pub p: Option<String>,
    /// Referrer
    pub r: Option<String>,
    /// Title
    pub t: Option<String>,
    /// Event flag
    pub e: Option<String>,
    /// Screen size: width,height,pixel ratio
    pub s: Option<String>,
    /// Page query string; a `ref` or `utm_source` campaign overrides `r`.
    /// Falls back to the query part of `p`.
    pub q: Option<String>,
}

/// GET|POST /count
pub async fn count(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<CountQuery>,
) -> Result<StatusCode, ServiceError> {
    let site = site_from_host(&headers)
        .ok_or_else(|| ServiceError::ValidationError("missing Host header".to_string()))?;

    let path = query.p.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
        ServiceError::ValidationError("missing required parameter: p".to_string())
    })?;

    let size = match query.s.as_deref() {
        Some(s) => parse_size(s)?,
        None => Vec::new(),
    };

    let page_query = query
        .q
        .as_deref()
        .or_else(|| path.split_once('?').map(|(_, q)| q));
    let (referrer, ref_scheme) = match page_query.and_then(campaign) {
        Some(campaign) => (campaign, Some(RefScheme::Campaign)),
        None => classify_referrer(query.r.as_deref().unwrap_or("")),
    };

    let event = matches!(query.e.as_deref(), Some("true" | "1" | "on"));
    let metadata = HitMetadata {
        path: normalize_path(path.trim(), event),
        title: query.t.unwrap_or_default(),
        referrer,
        ref_scheme,
        event,
        size,
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let ip = client_ip(&headers, addr, state.trust_proxy);
    let fingerprint = Fingerprint::from_request(user_agent, ip);

    state
        .memstore
        .record_hit(&site, &fingerprint, metadata, Utc::now());

    Ok(StatusCode::OK)
}

/// Client address. Forwarding headers are only honoured behind a trusted proxy.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if !trust_proxy {
        return peer.ip();
    }

    // Leftmost X-Forwarded-For entry is the original client
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    from_header("x-forwarded-for")
        .or_else(|| from_header("x-real-ip"))
        .unwrap_or_else(|| peer.ip())
}

/// Parse `width,height[,ratio]`; an empty value means unknown
fn parse_size(raw: &str) -> Result<Vec<f64>, ServiceError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let invalid = || ServiceError::ValidationError(format!("invalid screen size: {}", raw));
    let size = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(invalid)
        })
        .collect::<Result<Vec<f64>, _>>()?;

    if size.len() > 3 {
        return Err(invalid());
    }
    Ok(size)
}

/// Campaign name from the page query string, if any
fn campaign(query: &str) -> Option<String> {
    let query = query.trim_start_matches('?');
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    ["ref", "utm_source"].iter().find_map(|key| {
        pairs
            .iter()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    })
}

/// Lowercased host without port
fn site_from_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();

    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        },
        _ => host,
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Pageview paths always start with a slash; event names are kept as sent
fn normalize_path(path: &str, event: bool) -> String {
    if event || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// URL referrers are reduced to host and path; anything else is kept as text
fn classify_referrer(referrer: &str) -> (String, Option<RefScheme>) {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return (String::new(), None);
    }

    match url::Url::parse(referrer) {
        Ok(url) => match url.host_str() {
            Some(host) => {
                let value = match url.path() {
                    "" | "/" => host.to_string(),
                    path => format!("{}{}", host, path),
                };
                (value, Some(RefScheme::Http))
            },
            None => (referrer.to_string(), Some(RefScheme::Other)),
        },
        Err(_) => (referrer.to_string(), Some(RefScheme::Other)),
    }
}
