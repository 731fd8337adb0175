// FindFace Multi HTTP client: event submission for finalized tracks and
// discovery of the virtual cameras an external detector should feed.

use crate::pipeline::sink::{RemoteSink, SinkResponse, Submission};
use crate::pipeline::types::Camera;
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

/// One agent per process; every sink and session clones it and shares its connection pool.
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn api_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Turns a ureq result into the response body, or an error carrying the server's answer.
fn read_body(result: Result<ureq::Response, ureq::Error>, what: &str) -> Result<(u16, String)> {
    match result {
        Ok(response) => {
            let status = response.status();
            let body = response
                .into_string()
                .with_context(|| format!("Failed to read FindFace {} response", what))?;
            Ok((status, body))
        }
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("FindFace rejected {} with HTTP {}: {}", what, code, body)
        }
        Err(e) => Err(e).with_context(|| format!("FindFace {} request failed", what)),
    }
}

/// FindFace Multi external detector endpoint.
pub struct FindfaceSink {
    agent: ureq::Agent,
    endpoint: String,
    mf_selector: String,
}

impl FindfaceSink {
    pub fn new(agent: ureq::Agent, base_url: &str, mf_selector: &str) -> Self {
        Self {
            agent,
            endpoint: api_url(base_url, "events/faces/add/"),
            mf_selector: mf_selector.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RemoteSink for FindfaceSink {
    fn submit(&self, submission: &Submission) -> Result<SinkResponse> {
        let boundary = format!(
            "face-relay-{}-{}",
            submission.camera_id,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let body = multipart_body(&boundary, submission, &self.mf_selector);

        let result = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Token {}", submission.camera_token))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body);

        let (status, body) = read_body(result, "event")?;
        if body.trim().is_empty() {
            warn!(
                "FindFace accepted event for camera {} with an empty response",
                submission.camera_id
            );
        }
        Ok(SinkResponse { status, body })
    }
}

fn push_text_field(body: &mut Vec<u8>, boundary: &str, name: &str, value: &str) {
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
    );
    body.extend_from_slice(value.as_bytes());
    body.extend_from_slice(b"\r\n");
}

fn multipart_body(boundary: &str, submission: &Submission, mf_selector: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(submission.image_jpeg.len() + 1024);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"fullframe\"; filename=\"fullframe.jpg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(&submission.image_jpeg);
    body.extend_from_slice(b"\r\n");

    push_text_field(&mut body, boundary, "camera", &submission.camera_id.to_string());
    let roi = submission.roi;
    for v in [roi.x1, roi.y1, roi.x2, roi.y2] {
        push_text_field(&mut body, boundary, "roi", &v.to_string());
    }
    push_text_field(&mut body, boundary, "mf_selector", mf_selector);
    push_text_field(&mut body, boundary, "timestamp", &submission.timestamp.to_rfc3339());

    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

/// Operator account used to list cameras.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    /// Device identifier the session is registered under
    pub uuid: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct Page<T> {
    results: Vec<T>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CameraGroup {
    pub id: i64,
    pub name: String,
}

/// Camera as FindFace lists it. External detector cameras keep their stream URL in `comment`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteCamera {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub external_detector_token: Option<String>,
}

impl RemoteCamera {
    /// `None` unless the camera points at an RTSP stream.
    pub fn into_camera(self) -> Option<Camera> {
        let url = self.comment.trim();
        if !url.starts_with("rtsp://") {
            return None;
        }
        Some(Camera {
            id: self.id,
            name: self.name,
            token: self.external_detector_token.unwrap_or_default(),
            url: url.to_string(),
        })
    }
}

/// Authenticated operator session.
pub struct FindfaceSession {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl FindfaceSession {
    pub fn login(agent: ureq::Agent, base_url: &str, credentials: &Credentials) -> Result<Self> {
        let basic = BASE64.encode(format!("{}:{}", credentials.user, credentials.password));
        let payload = serde_json::json!({ "uuid": credentials.uuid }).to_string();
        let result = agent
            .post(&api_url(base_url, "auth/login/"))
            .set("Authorization", &format!("Basic {}", basic))
            .set("Content-Type", "application/json")
            .send_string(&payload);

        let (_, body) = read_body(result, "login")?;
        let login: LoginResponse =
            serde_json::from_str(&body).context("Unexpected FindFace login response")?;
        info!("Logged in to FindFace as {}", credentials.user);
        Ok(Self {
            agent,
            base_url: base_url.to_string(),
            token: login.token,
        })
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut request = self
            .agent
            .get(&api_url(&self.base_url, path))
            .set("Authorization", &format!("Token {}", self.token));
        for (key, value) in query {
            request = request.query(key, value);
        }
        let (_, body) = read_body(request.call(), path)?;
        serde_json::from_str(&body).with_context(|| format!("Unexpected FindFace {} response", path))
    }

    pub fn camera_groups(&self) -> Result<Vec<CameraGroup>> {
        Ok(self.get::<Page<CameraGroup>>("camera-groups/", &[])?.results)
    }

    /// External detector cameras of one group, ordered by id.
    pub fn external_cameras(&self, group_id: i64) -> Result<Vec<RemoteCamera>> {
        let group = group_id.to_string();
        let page: Page<RemoteCamera> = self.get(
            "cameras/",
            &[
                ("camera_groups", group.as_str()),
                ("external_detector", "true"),
                ("ordering", "id"),
            ],
        )?;
        Ok(page.results)
    }

    /// RTSP cameras of every group whose name starts with `group_prefix`, case-insensitive.
    pub fn discover_cameras(&self, group_prefix: &str) -> Result<Vec<Camera>> {
        let prefix = group_prefix.to_lowercase();
        let mut cameras = Vec::new();
        for group in self.camera_groups()? {
            if !group.name.to_lowercase().starts_with(&prefix) {
                continue;
            }
            let found: Vec<Camera> = self
                .external_cameras(group.id)?
                .into_iter()
                .filter_map(RemoteCamera::into_camera)
                .collect();
            info!(
                "FindFace group {} ({}): {} RTSP cameras",
                group.name,
                group.id,
                found.len()
            );
            cameras.extend(found);
        }
        Ok(cameras)
    }

    pub fn logout(self) -> Result<()> {
        let result = self
            .agent
            .post(&api_url(&self.base_url, "auth/logout/"))
            .set("Authorization", &format!("Token {}", self.token))
            .call();
        read_body(result, "logout").map(|_| ())
    }
}

/// Logs in, lists matching cameras and logs out again.
pub fn discover_cameras(
    agent: ureq::Agent,
    base_url: &str,
    credentials: &Credentials,
    group_prefix: &str,
) -> Result<Vec<Camera>> {
    let session = FindfaceSession::login(agent, base_url, credentials)?;
    let cameras = session.discover_cameras(group_prefix);
    if let Err(e) = session.logout() {
        warn!("FindFace logout failed: {:#}", e);
    }
    cameras
}
