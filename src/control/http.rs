//! HTTP/JSON client for the storage control plane.
//!
//! Lease operations are POSTs to `/lease/<op>` with the lease key in the
//! body; volume resolution is a GET on `/volume/<id>`. A 404 maps to
//! [`ControlError::NotFound`] so teardown paths can treat it as "already
//! absent".

use super::{ControlError, ControlPlane, VolumeInfo};
use crate::lease::{AccessMode, LeaseKey};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    lease_id: &'a str,
    volume_id: &'a str,
    sr_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<AccessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_leak: Option<bool>,
}

impl<'a> LeaseRequest<'a> {
    fn new(key: &'a LeaseKey) -> Self {
        Self {
            lease_id: &key.lease_id,
            volume_id: &key.volume_id,
            sr_id: &key.sr_id,
            mode: None,
            allow_leak: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachResponse {
    device: PathBuf,
}

pub struct HttpControlPlane {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
}

impl HttpControlPlane {
    pub fn new(base: Url) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: base.as_str().trim_end_matches('/').to_string(),
        }
    }

    async fn post_lease(
        &self,
        op: &str,
        body: &LeaseRequest<'_>,
    ) -> Result<Bytes, ControlError> {
        let uri = format!("{}/lease/{}", self.base, op);
        let payload = serde_json::to_vec(body)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        self.dispatch(request).await
    }

    async fn dispatch(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Bytes, ControlError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?
            .to_bytes();

        if status == StatusCode::NOT_FOUND {
            return Err(ControlError::NotFound(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        if !status.is_success() {
            return Err(ControlError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn resolve_volume(&self, volume_id: &str) -> Result<VolumeInfo, ControlError> {
        let uri = format!("{}/volume/{}", self.base, volume_id);
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let body = self.dispatch(request).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn create_lease(&self, key: &LeaseKey, mode: AccessMode) -> Result<(), ControlError> {
        let mut body = LeaseRequest::new(key);
        body.mode = Some(mode);
        self.post_lease("create", &body).await?;
        Ok(())
    }

    async fn attach(&self, key: &LeaseKey) -> Result<PathBuf, ControlError> {
        let body = self.post_lease("attach", &LeaseRequest::new(key)).await?;
        let response: AttachResponse = serde_json::from_slice(&body)?;
        Ok(response.device)
    }

    async fn activate(&self, key: &LeaseKey) -> Result<(), ControlError> {
        self.post_lease("activate", &LeaseRequest::new(key)).await?;
        Ok(())
    }

    async fn deactivate(&self, key: &LeaseKey) -> Result<(), ControlError> {
        self.post_lease("deactivate", &LeaseRequest::new(key)).await?;
        Ok(())
    }

    async fn detach(&self, key: &LeaseKey) -> Result<(), ControlError> {
        self.post_lease("detach", &LeaseRequest::new(key)).await?;
        Ok(())
    }

    async fn destroy_lease(&self, key: &LeaseKey, allow_leak: bool) -> Result<(), ControlError> {
        let mut body = LeaseRequest::new(key);
        body.allow_leak = Some(allow_leak);
        self.post_lease("destroy", &body).await?;
        Ok(())
    }
}
