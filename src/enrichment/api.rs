//! Distance API seam and the Google Distance Matrix client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::error::DistanceApiError;
use crate::models::TravelMode;

pub const GOOGLE_DISTANCE_MATRIX_URL: &str = "https://maps.googleapis.com/maps/api/distancematrix/json";

/// Google caps a single request at 25 origins or 25 destinations.
pub const MAX_DIMENSION: usize = 25;

/// One grid request: every origin against every destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixRequest {
    pub origins: Vec<String>,
    pub destinations: Vec<String>,
    pub mode: TravelMode,
}

impl MatrixRequest {
    pub fn elements(&self) -> usize {
        self.origins.len() * self.destinations.len()
    }
}

/// Outcome for one origin/destination pair of a matrix response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementOutcome {
    Duration { seconds: u64 },
    /// The service has no route between the pair
    Unreachable,
    /// The pair failed on its own; the rest of the batch may still be good
    Failed(String),
}

/// `rows[i][j]` is origin `i` to destination `j`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatrixResponse {
    pub rows: Vec<Vec<ElementOutcome>>,
}

impl MatrixResponse {
    pub fn element(&self, origin: usize, destination: usize) -> Option<&ElementOutcome> {
        self.rows.get(origin)?.get(destination)
    }
}

#[async_trait]
pub trait DistanceApi: Send + Sync {
    /// Largest `origins x destinations` product one request may carry.
    fn max_elements(&self) -> usize {
        100
    }

    async fn matrix(&self, request: &MatrixRequest) -> std::result::Result<MatrixResponse, DistanceApiError>;
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    rows: Vec<GoogleRow>,
}

#[derive(Debug, Deserialize)]
struct GoogleRow {
    elements: Vec<GoogleElement>,
}

#[derive(Debug, Deserialize)]
struct GoogleElement {
    status: String,
    #[serde(default)]
    duration: Option<GoogleValue>,
}

#[derive(Debug, Deserialize)]
struct GoogleValue {
    value: u64,
}

/// Google Maps Distance Matrix client
pub struct GoogleDistanceMatrix {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl fmt::Debug for GoogleDistanceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleDistanceMatrix")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GoogleDistanceMatrix {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            base_url: GOOGLE_DISTANCE_MATRIX_URL.to_string(),
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Describe a transport error without the request URL, which carries the key.
fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else if err.is_decode() {
        "response body could not be decoded".to_string()
    } else {
        "request failed".to_string()
    }
}

fn element_outcome(element: &GoogleElement) -> ElementOutcome {
    match (element.status.as_str(), &element.duration) {
        ("OK", Some(duration)) => ElementOutcome::Duration {
            seconds: duration.value,
        },
        ("OK", None) => ElementOutcome::Failed("OK without a duration".to_string()),
        ("ZERO_RESULTS" | "NOT_FOUND" | "MAX_ROUTE_LENGTH_EXCEEDED", _) => ElementOutcome::Unreachable,
        (other, _) => ElementOutcome::Failed(other.to_string()),
    }
}

fn classify_status(status: &str, message: Option<String>) -> DistanceApiError {
    let detail = match message {
        Some(message) => format!("{status}: {message}"),
        None => status.to_string(),
    };
    match status {
        "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => DistanceApiError::Transient(detail),
        _ => DistanceApiError::Rejected(detail),
    }
}

#[async_trait]
impl DistanceApi for GoogleDistanceMatrix {
    async fn matrix(&self, request: &MatrixRequest) -> std::result::Result<MatrixResponse, DistanceApiError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("origins", request.origins.join("|")),
                ("destinations", request.destinations.join("|")),
                ("mode", request.mode.as_str().to_string()),
                ("units", "metric".to_string()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| DistanceApiError::Transient(describe_transport_error(&e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DistanceApiError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DistanceApiError::Rejected(format!("HTTP {status}")));
        }

        let body: GoogleResponse = response
            .json()
            .await
            .map_err(|e| DistanceApiError::Transient(describe_transport_error(&e)))?;

        if body.status != "OK" {
            return Err(classify_status(&body.status, body.error_message));
        }

        Ok(MatrixResponse {
            rows: body
                .rows
                .iter()
                .map(|row| row.elements.iter().map(element_outcome).collect())
                .collect(),
        })
    }
}
