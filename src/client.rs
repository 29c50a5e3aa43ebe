//! HTTP client for another node's control API.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::{PullFanout, PutSummary};
use crate::error::PeerError;
use crate::gossip::Member;
use crate::types::ServiceSpec;

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl PeerClient {
    /// Every request is bounded by `timeout` so one dead peer cannot stall
    /// a propagation round.
    pub fn new(timeout: Duration, api_key: Option<String>) -> Result<Self, PeerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PeerError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { http, api_key })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(AUTHORIZATION, key),
            None => request,
        }
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, PeerError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|source| PeerError::Transport {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(PeerError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, PeerError> {
        let response = self.send(&url, self.http.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|source| PeerError::Transport { url, source })
    }

    /// PUTs specs as a JSON array of base64 blobs.
    pub async fn put_services(
        &self,
        base_url: &str,
        specs: &[ServiceSpec],
    ) -> Result<PutSummary, PeerError> {
        let blobs = specs
            .iter()
            .map(|spec| {
                spec.encode().map_err(|source| PeerError::Encode {
                    name: spec.name.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<String>, PeerError>>()?;
        let url = format!("{}/v1/services", base_url);
        let response = self.send(&url, self.http.put(&url).json(&blobs)).await?;
        response
            .json()
            .await
            .map_err(|source| PeerError::Transport { url, source })
    }

    pub async fn list_services(&self, base_url: &str) -> Result<Vec<ServiceSpec>, PeerError> {
        self.get_json(format!("{}/v1/services", base_url)).await
    }

    pub async fn get_service(
        &self,
        base_url: &str,
        name: &str,
    ) -> Result<Option<ServiceSpec>, PeerError> {
        let url = format!("{}/v1/services/{}", base_url, name);
        let response = match self.send(&url, self.http.get(&url)).await {
            Ok(response) => response,
            Err(PeerError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body = response
            .bytes()
            .await
            .map_err(|source| PeerError::Transport {
                url: url.clone(),
                source,
            })?;
        if body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|source| PeerError::Decode { url, source })
    }

    pub async fn pull(&self, base_url: &str, name: &str) -> Result<(), PeerError> {
        let url = format!("{}/v1/pull/{}", base_url, name);
        self.send(&url, self.http.get(&url)).await?;
        Ok(())
    }

    pub async fn propagate_and_pull(
        &self,
        base_url: &str,
        name: &str,
    ) -> Result<PullFanout, PeerError> {
        self.get_json(format!("{}/v1/propagate-and-pull/{}", base_url, name))
            .await
    }

    pub async fn members(&self, base_url: &str) -> Result<Vec<Member>, PeerError> {
        self.get_json(format!("{}/v1/members", base_url)).await
    }

    pub async fn health(&self, base_url: &str) -> Result<(), PeerError> {
        let url = format!("{}/v1/health", base_url);
        self.send(&url, self.http.get(&url)).await?;
        Ok(())
    }
}
