//! In-process stand-in for the course portal, served over real HTTP on a
//! loopback port so the whole client stack is exercised.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use once_cell::sync::OnceCell;
use reqwest::Url;

#[derive(Debug, Clone)]
struct MockResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Routes are keyed by path plus query (`/Sinif/1/DersDosyalari?g42`) and may
/// be replaced while the server is running.
#[derive(Debug, Clone, Default)]
pub struct MockPortal {
    routes: Arc<Mutex<HashMap<String, MockResponse>>>,
    posts: Arc<Mutex<HashMap<String, MockResponse>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    posted_forms: Arc<Mutex<Vec<(String, String)>>>,
    base_url: Arc<OnceCell<Url>>,
}

impl MockPortal {
    pub fn html(&self, path: &str, html: &str) {
        self.route(path, StatusCode::OK, vec![content_type("text/html; charset=utf-8")], html.as_bytes());
    }

    /// A file download announced with a Content-Disposition filename
    pub fn file(&self, path: &str, filename: &str, body: &[u8]) {
        self.route(
            path,
            StatusCode::OK,
            vec![
                content_type("application/octet-stream"),
                (
                    "content-disposition".to_string(),
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            body,
        );
    }

    pub fn status(&self, path: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap();
        self.route(path, status, Vec::new(), b"");
    }

    /// Response to a POST on `path`
    pub fn post_response(&self, path: &str, headers: Vec<(String, String)>, body: &[u8]) {
        self.posts.lock().unwrap().insert(
            path.to_string(),
            MockResponse {
                status: StatusCode::OK,
                headers,
                body: body.to_vec(),
            },
        );
    }

    /// Hold every answer on `path` back for `delay`
    pub fn delayed(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    fn route(&self, path: &str, status: StatusCode, headers: Vec<(String, String)>, body: &[u8]) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            MockResponse {
                status,
                headers,
                body: body.to_vec(),
            },
        );
    }

    /// Requests of any method seen for `path`
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Every urlencoded form body received, with the path it was posted to
    pub fn posted_forms(&self) -> Vec<(String, String)> {
        self.posted_forms.lock().unwrap().clone()
    }

    /// Start serving on an ephemeral port. Calling it again returns the same address.
    pub async fn serve(&self) -> Url {
        if let Some(url) = self.base_url.get() {
            return url.clone();
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(respond).with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let _ = self.base_url.set(url.clone());
        url
    }

    pub fn base_url(&self) -> Url {
        self.base_url.get().cloned().expect("serve() must be called first")
    }
}

fn content_type(value: &str) -> (String, String) {
    ("content-type".to_string(), value.to_string())
}

async fn respond(State(portal): State<MockPortal>, method: Method, uri: Uri, body: String) -> Response {
    let key = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    *portal.hits.lock().unwrap().entry(key.clone()).or_default() += 1;

    let delay = portal.delays.lock().unwrap().get(&key).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let found = if method == Method::POST {
        portal.posted_forms.lock().unwrap().push((key.clone(), body));
        let post = portal.posts.lock().unwrap().get(&key).cloned();
        post.or_else(|| portal.routes.lock().unwrap().get(&key).cloned())
    } else {
        portal.routes.lock().unwrap().get(&key).cloned()
    };

    let Some(mock) = found else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut builder = Response::builder().status(mock.status);
    for (name, value) in mock.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(mock.body)).unwrap()
}
