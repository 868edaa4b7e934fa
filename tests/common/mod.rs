// Common test utilities and helper structs
// Shared across all test files to avoid duplication
#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use hitcount_core::{
    app::{router, AppState},
    db::MemoryHitStorage,
    models::HitMetadata,
    services::{Memstore, SaltStore, Scheduler, SchedulerSettings, SessionAssigner},
    utils::Fingerprint,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

pub const HOUR: Duration = Duration::from_secs(3600);

/// Fixed starting instant so time arithmetic in tests is readable
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(offset: Duration) -> DateTime<Utc> {
    t0() + chrono::Duration::from_std(offset).unwrap()
}

pub fn visitor(n: u8) -> Fingerprint {
    Fingerprint::from_bytes([n; 32])
}

pub fn pageview(path: &str) -> HitMetadata {
    HitMetadata {
        path: path.to_string(),
        ..HitMetadata::default()
    }
}

/// Memstore over in-memory storage with salts created at `t0()`
pub fn memstore(storage: Arc<MemoryHitStorage>, window: Duration) -> Memstore {
    let salts = Arc::new(SaltStore::new_at(4 * HOUR, t0()));
    Memstore::new(SessionAssigner::new(salts, window), storage)
}

/// Test application wrapper
pub struct TestApp {
    pub app: Router,
    pub memstore: Arc<Memstore>,
    pub storage: Arc<MemoryHitStorage>,
}

impl TestApp {
    /// Send a POST request
    pub fn post(&self, uri: &str) -> TestRequest {
        TestRequest::new(self, "POST", uri)
    }

    /// Send a GET request
    pub fn get(&self, uri: &str) -> TestRequest {
        TestRequest::new(self, "GET", uri)
    }
}

/// Test request builder
pub struct TestRequest<'a> {
    app: &'a TestApp,
    method: &'static str,
    uri: String,
    headers: Vec<(&'static str, String)>,
    ip: String,
}

impl<'a> TestRequest<'a> {
    fn new(app: &'a TestApp, method: &'static str, uri: &str) -> Self {
        Self {
            app,
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
            ip: "127.0.0.1:12345".to_string(),
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    /// Set the client address seen by the handler
    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = ip.to_string();
        self
    }

    /// Send the request
    pub async fn send(self) -> TestResponse {
        let mut builder = Request::builder().method(self.method).uri(&self.uri);
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        let mut request = builder.body(Body::empty()).unwrap();

        // Add ConnectInfo to the request extensions to simulate a client connection
        request
            .extensions_mut()
            .insert(ConnectInfo(self.ip.parse::<SocketAddr>().unwrap()));

        let response = self.app.app.clone().oneshot(request).await.unwrap();

        TestResponse { response }
    }
}

/// Test response wrapper
pub struct TestResponse {
    response: Response<Body>,
}

impl TestResponse {
    /// Get status code
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Parse JSON response
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> T {
        let body = axum::body::to_bytes(self.response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Get response body as text
    pub async fn text(self) -> String {
        let body = axum::body::to_bytes(self.response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }
}

/// Setup test application over in-memory storage
pub fn setup_test_app() -> TestApp {
    setup_test_app_with_proxy(false)
}

/// Same as `setup_test_app`, optionally trusting forwarding headers
pub fn setup_test_app_with_proxy(trust_proxy: bool) -> TestApp {
    let storage = Arc::new(MemoryHitStorage::new());
    let salts = Arc::new(SaltStore::new(4 * HOUR));
    let memstore = Arc::new(Memstore::new(
        SessionAssigner::new(salts, 4 * HOUR),
        storage.clone(),
    ));
    let scheduler = Scheduler::new(SchedulerSettings::default(), CancellationToken::new()).unwrap();

    let app = router(
        AppState::new(memstore.clone(), scheduler.registry()).with_trusted_proxy(trust_proxy),
    );

    TestApp {
        app,
        memstore,
        storage,
    }
}
