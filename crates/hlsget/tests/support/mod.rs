//! In-process HTTP fixture for integration tests.
//!
//! Serves configured blobs from a real listener on `127.0.0.1:0`, counts
//! requests per path, and supports fault injection: canned early responses
//! (e.g. a couple of 503s before the real body), fixed error statuses,
//! per-path delays, and `Range` handling for resume tests.

// Each integration test binary compiles this module; not every binary uses
// every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use url::Url;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// One canned response served before the steady-state body.
pub struct Prelude {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

pub struct Route {
    pub body: Bytes,
    pub content_type: &'static str,
    pub status: u16,
    /// Honor `Range: bytes=N-` with a 206. When false the header is ignored
    /// and the full body comes back as 200.
    pub ranged: bool,
    pub delay: Duration,
    pub prelude: Vec<Prelude>,
}

impl Route {
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/octet-stream",
            status: 200,
            ranged: false,
            delay: Duration::ZERO,
            prelude: Vec::new(),
        }
    }

    pub fn playlist(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self {
            content_type: "application/vnd.apple.mpegurl",
            ..Self::bytes(text.into_bytes())
        }
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn ranged(mut self) -> Self {
        self.ranged = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(mut self, prelude: Prelude) -> Self {
        self.prelude.push(prelude);
        self
    }
}

struct FixtureState {
    routes: Mutex<HashMap<String, Route>>,
    counts: Mutex<HashMap<String, u64>>,
}

#[derive(Clone)]
pub struct Fixture {
    state: Arc<FixtureState>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FixtureState {
                routes: Mutex::new(HashMap::new()),
                counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn put(&self, path: &str, route: Route) {
        let path = normalize(path);
        self.state.routes.lock().unwrap().insert(path, route);
    }

    pub fn count(&self, path: &str) -> u64 {
        let path = normalize(path);
        *self.state.counts.lock().unwrap().get(&path).unwrap_or(&0)
    }

    /// Bind on an ephemeral local port and serve in the background. Returns
    /// the base URL (ends with `/`).
    pub async fn start(&self) -> Url {
        let app = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&self.state));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind fixture listener");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let listener =
                tokio::net::TcpListener::from_std(listener).expect("tokio listener from std");
            axum::serve(listener, app).await.unwrap();
        });

        Url::parse(&format!("http://{addr}/")).expect("fixture base url")
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

async fn serve(
    State(state): State<Arc<FixtureState>>,
    uri: Uri,
    request_headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    *state.counts.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let (status, content_type, body, ranged, delay, prelude) = {
        let mut routes = state.routes.lock().unwrap();
        let Some(route) = routes.get_mut(&path) else {
            return (StatusCode::NOT_FOUND, Bytes::new()).into_response();
        };
        let prelude = if route.prelude.is_empty() {
            None
        } else {
            Some(route.prelude.remove(0))
        };
        (
            route.status,
            route.content_type,
            route.body.clone(),
            route.ranged,
            route.delay,
            prelude,
        )
    };

    if delay != Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    if let Some(prelude) = prelude {
        let mut headers = HeaderMap::new();
        for (name, value) in &prelude.headers {
            headers.insert(
                header::HeaderName::from_static(name),
                value.parse().unwrap(),
            );
        }
        return (
            StatusCode::from_u16(prelude.status).unwrap(),
            headers,
            prelude.body,
        )
            .into_response();
    }

    let status = StatusCode::from_u16(status).unwrap();
    if !status.is_success() {
        return (status, Bytes::new()).into_response();
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());

    if ranged {
        headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
        if let Some(offset) = parse_range_start(&request_headers) {
            if offset >= body.len() as u64 {
                return (StatusCode::RANGE_NOT_SATISFIABLE, headers, Bytes::new())
                    .into_response();
            }
            let total = body.len();
            let sliced = body.slice(offset as usize..);
            headers.insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, total - 1, total)
                    .parse()
                    .unwrap(),
            );
            return (StatusCode::PARTIAL_CONTENT, headers, sliced).into_response();
        }
    }

    (status, headers, body).into_response()
}

fn parse_range_start(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let rest = raw.strip_prefix("bytes=")?;
    let (start, _) = rest.split_once('-')?;
    start.parse().ok()
}

/// AES-128-CBC encrypt with PKCS#7, the way segment encryptors pad.
pub fn encrypt_segment(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
    let mut buffer = vec![0u8; plaintext.len() + 16];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}

/// IV used for a segment without an explicit IV: big-endian absolute index.
pub fn sequence_iv(absolute_index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&absolute_index.to_be_bytes());
    iv
}
