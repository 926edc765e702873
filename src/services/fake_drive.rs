//! In-process stand-in for the Google OAuth and Drive endpoints used by the
//! token provider and uploader tests.

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, post, put},
};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::net::TcpListener;

use crate::models::credentials::{Credentials, OAuthToken};

pub const TEST_PRIVATE_KEY: &str = include_str!("testdata/service_account_key.pem");

/// Folder id answered with 404 on upload.
pub const MISSING_FOLDER: &str = "missing-folder";
/// Folder id answered with a storage quota error on upload.
pub const FULL_FOLDER: &str = "full-folder";

#[derive(Default)]
struct DriveState {
    base: String,
    token_requests: AtomicUsize,
    last_grant_type: Mutex<Option<String>>,
    reject_tokens: AtomicBool,
    reject_permissions: AtomicBool,
    corrupt_checksum: AtomicBool,
    truncate_next_chunk: AtomicBool,
    discard_next_chunk: AtomicBool,
    sessions: Mutex<HashMap<usize, Session>>,
    next_session: AtomicUsize,
    chunk_requests: AtomicUsize,
    permission_requests: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

struct Session {
    name: String,
    parents: Vec<String>,
    data: Vec<u8>,
}

pub struct FakeDrive {
    pub base: String,
    state: Arc<DriveState>,
}

impl FakeDrive {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(DriveState {
            base: base.clone(),
            ..DriveState::default()
        });

        let app = Router::new()
            .route("/token", post(token))
            .route("/upload/drive/v3/files", post(start_session))
            .route("/upload/session/{id}", put(put_chunk))
            .route("/drive/v3/files/{id}/permissions", post(create_permission))
            .route("/drive/v3/files/{id}", delete(delete_file))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn last_grant_type(&self) -> Option<String> {
        self.state.last_grant_type.lock().unwrap().clone()
    }

    pub fn chunk_requests(&self) -> usize {
        self.state.chunk_requests.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.state.permission_requests.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().unwrap().clone()
    }

    pub fn reject_tokens(&self) {
        self.state.reject_tokens.store(true, Ordering::SeqCst);
    }

    pub fn reject_permissions(&self) {
        self.state.reject_permissions.store(true, Ordering::SeqCst);
    }

    pub fn corrupt_checksum(&self) {
        self.state.corrupt_checksum.store(true, Ordering::SeqCst);
    }

    /// Keep only the first half of the next chunk.
    pub fn truncate_next_chunk(&self) {
        self.state.truncate_next_chunk.store(true, Ordering::SeqCst);
    }

    /// Keep none of the next chunk when nothing was stored yet.
    pub fn discard_next_chunk(&self) {
        self.state.discard_next_chunk.store(true, Ordering::SeqCst);
    }
}

/// OAuth credentials whose token endpoint is the fake server.
pub fn oauth_credentials(base: &str) -> Credentials {
    Credentials::OAuth(OAuthToken {
        client_id: "client".into(),
        client_secret: "secret".into(),
        refresh_token: "refresh".into(),
        token: None,
        expiry: None,
        token_uri: Some(format!("{}/token", base)),
    })
}

fn drive_error(status: StatusCode, reason: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
            "errors": [{ "reason": reason, "message": message }]
        }
    });
    (status, Json(body)).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer tok-"))
}

async fn token(
    State(state): State<Arc<DriveState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let n = state.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_grant_type.lock().unwrap() = form.get("grant_type").cloned();
    if state.reject_tokens.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response();
    }
    Json(json!({
        "access_token": format!("tok-{}", n),
        "expires_in": 3599,
        "token_type": "Bearer"
    }))
    .into_response()
}

async fn start_session(
    State(state): State<Arc<DriveState>>,
    headers: HeaderMap,
    Json(metadata): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return drive_error(StatusCode::UNAUTHORIZED, "authError", "Invalid Credentials");
    }
    let parents: Vec<String> = metadata["parents"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|p| p.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();
    if parents.iter().any(|p| p == MISSING_FOLDER) {
        return drive_error(
            StatusCode::NOT_FOUND,
            "notFound",
            "File not found: missing-folder.",
        );
    }
    if parents.iter().any(|p| p == FULL_FOLDER) {
        return drive_error(
            StatusCode::FORBIDDEN,
            "storageQuotaExceeded",
            "The user's Drive storage quota has been exceeded.",
        );
    }

    let id = state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
    state.sessions.lock().unwrap().insert(
        id,
        Session {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            parents,
            data: Vec::new(),
        },
    );
    let location = format!("{}/upload/session/{}", state.base, id);
    (StatusCode::OK, [(header::LOCATION, location)]).into_response()
}

/// Parse `bytes start-end/total`.
fn content_range(headers: &HeaderMap) -> Option<(u64, u64, u64)> {
    let raw = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (range, total) = raw.strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?, total.parse().ok()?))
}

async fn put_chunk(
    State(state): State<Arc<DriveState>>,
    Path(id): Path<usize>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.chunk_requests.fetch_add(1, Ordering::SeqCst);
    let Some((start, end, total)) = content_range(&headers) else {
        return drive_error(StatusCode::BAD_REQUEST, "badRequest", "missing Content-Range");
    };

    let mut sessions = state.sessions.lock().unwrap();
    let Some(session) = sessions.get_mut(&id) else {
        return drive_error(StatusCode::NOT_FOUND, "notFound", "unknown upload session");
    };
    if start != session.data.len() as u64 || end - start + 1 != body.len() as u64 {
        return drive_error(StatusCode::BAD_REQUEST, "badRequest", "range mismatch");
    }
    let keep = if state.discard_next_chunk.swap(false, Ordering::SeqCst) {
        0
    } else if state.truncate_next_chunk.swap(false, Ordering::SeqCst) {
        body.len() / 2
    } else {
        body.len()
    };
    session.data.extend_from_slice(&body[..keep]);

    let stored = session.data.len() as u64;
    if stored == 0 {
        // Drive omits Range until it holds at least one byte.
        return StatusCode::PERMANENT_REDIRECT.into_response();
    }
    if stored < total {
        let range = format!("bytes=0-{}", stored - 1);
        return (StatusCode::PERMANENT_REDIRECT, [(header::RANGE, range)]).into_response();
    }

    let file_id = format!("file-{}", id);
    let md5 = if state.corrupt_checksum.load(Ordering::SeqCst) {
        "00000000000000000000000000000000".to_string()
    } else {
        format!("{:x}", md5::compute(&session.data))
    };
    Json(json!({
        "id": file_id,
        "name": session.name,
        "parents": session.parents,
        "size": session.data.len().to_string(),
        "md5Checksum": md5,
        "webViewLink": format!("https://drive.google.com/file/d/{}/view", file_id),
    }))
    .into_response()
}

async fn create_permission(
    State(state): State<Arc<DriveState>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.permission_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return drive_error(StatusCode::UNAUTHORIZED, "authError", "Invalid Credentials");
    }
    if state.reject_permissions.load(Ordering::SeqCst) {
        return drive_error(
            StatusCode::FORBIDDEN,
            "sharingRateLimitExceeded",
            "Sharing is disabled for this drive.",
        );
    }
    assert_eq!(body["role"], "reader");
    assert_eq!(body["type"], "anyone");
    Json(json!({ "id": "anyoneWithLink" })).into_response()
}

async fn delete_file(
    State(state): State<Arc<DriveState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return drive_error(StatusCode::UNAUTHORIZED, "authError", "Invalid Credentials");
    }
    if id == "gone" {
        return drive_error(StatusCode::NOT_FOUND, "notFound", "File not found: gone.");
    }
    state.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT.into_response()
}
