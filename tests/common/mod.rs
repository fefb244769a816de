//! Common test infrastructure
//!
//! Provides an in-memory object store that implements `Transport`, so the
//! full client pipeline can be exercised without a network:
//! - PUT stores the body and the `Content-Type` / `m-*` headers
//! - HEAD/GET/DELETE answer from the stored objects, 404 otherwise
//! - every request is recorded for inspection

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use objput::config::Config;
use objput::error::BoxError;
use objput::http::{RequestBody, Transport, TransportRequest, TransportResponse};
use objput::ObjectClient;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

/// Buffer threshold used by most tests
pub const BUFFER_SIZE: u64 = 1024;

/// What the store saw for one request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// `bytes`, `stream` or `empty`
    pub body_kind: &'static str,
    pub body_len: usize,
}

impl RecordedRequest {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    headers: HeaderMap,
    last_modified: String,
}

/// In-memory object store speaking the client's transport contract
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded requests, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Most recent request
    pub fn last_request(&self) -> RecordedRequest {
        self.requests
            .lock()
            .last()
            .cloned()
            .expect("no request recorded")
    }

    /// Raw stored bytes under a wire path
    pub fn raw(&self, wire_path: &str) -> Option<Bytes> {
        self.objects.lock().get(wire_path).map(|o| o.data.clone())
    }

    /// Stored Content-Type under a wire path
    pub fn stored_content_type(&self, wire_path: &str) -> Option<String> {
        self.objects.lock().get(wire_path).and_then(|o| {
            o.headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
    }

    fn object_headers(object: &StoredObject) -> HeaderMap {
        let mut headers = object.headers.clone();
        let digest = md5::compute(&object.data);
        headers.insert(
            "etag",
            HeaderValue::from_str(&format!("\"{:x}\"", digest)).unwrap(),
        );
        headers.insert(
            "computed-md5",
            HeaderValue::from_str(&base64::engine::general_purpose::STANDARD.encode(digest.0))
                .unwrap(),
        );
        headers.insert(
            "last-modified",
            HeaderValue::from_str(&object.last_modified).unwrap(),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(object.data.len()));
        headers
    }

    fn not_found(path: &str, with_body: bool) -> TransportResponse {
        let body = if with_body {
            Bytes::from(format!(
                r#"{{"code":"ResourceNotFound","message":"{} was not found"}}"#,
                path
            ))
        } else {
            Bytes::new()
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        TransportResponse {
            status: StatusCode::NOT_FOUND,
            headers,
            body,
        }
    }

    fn bad_request(message: &str) -> TransportResponse {
        TransportResponse {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: Bytes::from(format!(
                r#"{{"code":"InvalidArgument","message":"{}"}}"#,
                message
            )),
        }
    }
}

#[async_trait]
impl Transport for InMemoryStore {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, BoxError> {
        let body_kind = match &request.body {
            RequestBody::Empty => "empty",
            RequestBody::Bytes(_) => "bytes",
            RequestBody::Stream(_) => "stream",
        };
        let body = match request.body {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(data) => data,
            RequestBody::Stream(mut stream) => {
                let mut buffer = bytes::BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                buffer.freeze()
            }
        };

        self.requests.lock().push(RecordedRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body_kind,
            body_len: body.len(),
        });

        let path = request.path;
        let response = match request.method {
            Method::PUT => {
                if let Some(declared) = request
                    .headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<usize>().ok())
                {
                    if declared != body.len() {
                        return Ok(Self::bad_request("Content-Length does not match body"));
                    }
                }

                let mut headers = HeaderMap::new();
                headers.insert(
                    CONTENT_TYPE,
                    request
                        .headers
                        .get(CONTENT_TYPE)
                        .cloned()
                        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
                );
                for (name, value) in request.headers.iter() {
                    if name.as_str().starts_with("m-") {
                        headers.insert(name.clone(), value.clone());
                    }
                }

                let object = StoredObject {
                    data: body,
                    headers,
                    last_modified: objput::response::format_http_date(&chrono::Utc::now()),
                };
                let response_headers = Self::object_headers(&object);
                self.objects.lock().insert(path, object);

                TransportResponse {
                    status: StatusCode::NO_CONTENT,
                    headers: response_headers,
                    body: Bytes::new(),
                }
            }
            Method::HEAD | Method::GET => {
                let object = self.objects.lock().get(&path).cloned();
                match object {
                    Some(object) => TransportResponse {
                        status: StatusCode::OK,
                        headers: Self::object_headers(&object),
                        body: if request.method == Method::GET {
                            object.data
                        } else {
                            Bytes::new()
                        },
                    },
                    None => Self::not_found(&path, request.method == Method::GET),
                }
            }
            Method::DELETE => match self.objects.lock().remove(&path) {
                Some(_) => TransportResponse {
                    status: StatusCode::NO_CONTENT,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                },
                None => Self::not_found(&path, true),
            },
            _ => Self::bad_request("unsupported method"),
        };

        Ok(response)
    }
}

/// Configuration with a small buffer threshold
pub fn config() -> Config {
    let mut config = Config::default();
    config.upload.buffer_size = BUFFER_SIZE;
    config
}

/// Configuration with client-side encryption enabled
pub fn encrypting_config() -> Config {
    let mut config = config();
    config.encryption.enabled = true;
    config.encryption.key_id = Some("integration-key".into());
    config.encryption.key = Some(base64::engine::general_purpose::STANDARD.encode([42u8; 32]));
    config
}

/// Client without encryption
pub fn client(store: &Arc<InMemoryStore>) -> ObjectClient {
    ObjectClient::new(&config(), store.clone()).unwrap()
}

/// Client with encryption
pub fn encrypting_client(store: &Arc<InMemoryStore>) -> ObjectClient {
    ObjectClient::new(&encrypting_config(), store.clone()).unwrap()
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

/// Test directory path for an object
pub fn object_path(name: &str) -> String {
    format!("/integration/stor/{}/{}", uuid::Uuid::new_v4(), name)
}
