//! HTTP clients for the Tasking Manager and fAIr APIs.
//!
//! This module provides:
//! - [`TaskingManagerClient`]: project listing and project detail
//! - [`FairClient`]: token validation, prediction artifacts, generation
//!   requests and job monitoring
//! - [`FgbPointIndex`]: bounding-box reads from a remote FlatGeobuf file
//!
//! Requests retry with exponential backoff on 429 and on connection errors.

use geo::{Geometry, Point};
use geojson::{FeatureCollection, GeoJson};
use geozero::ToGeo;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{AggregateResult, BboxPointSource};
use crate::config::ClientConfig;
use crate::generation::{GenerationRequest, JobHandle, JobStatus, JobStatusResponse};
use crate::project::{parse_project_list, Project, ProjectSummary};
use crate::session::{AuthService, UserProfile};
use crate::sources::{points_from_geojson, PredictionService};
use crate::{Bounds, Error, Result};

const MAX_RETRIES: u32 = 3;
const ACCESS_TOKEN_HEADER: &str = "access-token";

// =============================================================================
// Retry backoff
// =============================================================================

/// Tracks consecutive 429s across requests of one client.
#[derive(Debug, Default)]
struct Backoff {
    consecutive_429s: AtomicU32,
}

impl Backoff {
    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 1s, 2s, 4s max
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!("[Backoff] Got 429! Consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }

    fn for_request_error(retries: u32) -> Duration {
        Duration::from_millis(200 * (1 << retries.min(5)))
    }
}

fn build_client(config: &ClientConfig) -> Result<Client> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| Error::Request(format!("failed to create HTTP client: {}", e)))
}

/// Send with retries and return the body bytes of a successful response.
async fn fetch_bytes(
    backoff: &Backoff,
    url: &str,
    build: impl Fn() -> RequestBuilder,
) -> Result<Vec<u8>> {
    let mut retries = 0;
    let req_start = Instant::now();

    loop {
        // Phase 1: send request, receive headers
        let response = build().send().await;
        let headers_elapsed = req_start.elapsed();

        let resp = match response {
            Ok(resp) => resp,
            Err(e) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(Error::Request(format!("{}: {}", url, e)));
                }
                let wait = Backoff::for_request_error(retries);
                warn!("[Fetch] {} error: {}, retry {} after {:?}", url, e, retries, wait);
                tokio::time::sleep(wait).await;
                continue;
            }
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(Error::Http { status: status.as_u16(), url: url.to_string() });
            }
            let wait = backoff.record_429();
            warn!(
                "[Fetch] {} 429 Too Many Requests after {:?}, retry {} with {:?} backoff",
                url, headers_elapsed, retries, wait
            );
            tokio::time::sleep(wait).await;
            continue;
        }

        backoff.record_success();

        if !status.is_success() {
            debug!("[Fetch] {} -> HTTP {}", url, status);
            return Err(Error::Http { status: status.as_u16(), url: url.to_string() });
        }

        // Phase 2: body download
        let body_start = Instant::now();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Request(format!("body download from {}: {}", url, e)))?;

        debug!(
            "[Fetch] {} headers={:?} body={:?}({:.1}KB)",
            url,
            headers_elapsed,
            body_start.elapsed(),
            bytes.len() as f64 / 1024.0
        );
        return Ok(bytes.to_vec());
    }
}

fn decode<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(format!("{}: {}", url, e)))
}

// =============================================================================
// Tasking Manager
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectListResponse {
    map_results: FeatureCollection,
}

/// Read-only client for the Tasking Manager project API.
pub struct TaskingManagerClient {
    client: Client,
    base_url: String,
    backoff: Backoff,
}

impl TaskingManagerClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.tasking_manager_api_url.trim_end_matches('/').to_string(),
            backoff: Backoff::default(),
        })
    }

    /// All projects on the map listing.
    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let url = format!("{}/api/v2/projects/", self.base_url);
        let start = Instant::now();

        let bytes = fetch_bytes(&self.backoff, &url, || self.client.get(&url)).await?;
        let listing: ProjectListResponse = decode(&url, &bytes)?;
        let projects = parse_project_list(&listing.map_results);

        info!("[TaskingManager] Listed {} projects in {:?}", projects.len(), start.elapsed());
        Ok(projects)
    }

    /// Project detail including boundary and task grid.
    pub async fn get_project(&self, project_id: u64) -> Result<Project> {
        let url = format!("{}/api/v2/projects/{}/", self.base_url, project_id);
        let start = Instant::now();

        let bytes = fetch_bytes(&self.backoff, &url, || self.client.get(&url))
            .await
            .map_err(|e| match e {
                Error::Http { status: 404, .. } => Error::NotFound(format!("project {}", project_id)),
                other => other,
            })?;
        let project: Project = decode(&url, &bytes)?;

        info!(
            "[TaskingManager] Project {} ({} task features, {:.1}KB) in {:?}",
            project_id,
            project.tasks.features.len(),
            bytes.len() as f64 / 1024.0,
            start.elapsed()
        );
        Ok(project)
    }
}

// =============================================================================
// fAIr
// =============================================================================

/// Client for the fAIr prediction API.
pub struct FairClient {
    client: Client,
    config: ClientConfig,
    token: Option<String>,
    backoff: Backoff,
}

impl FairClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            config,
            token: None,
            backoff: Backoff::default(),
        })
    }

    /// Token sent with generation and job requests.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn base_url(&self) -> &str {
        self.config.fair_api_url.trim_end_matches('/')
    }

    fn require_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::Auth("no access token".into()))
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>> {
        fetch_bytes(&self.backoff, url, || {
            let request = self.client.get(url);
            match token {
                Some(token) => request.header(ACCESS_TOKEN_HEADER, token),
                None => request,
            }
        })
        .await
    }

    /// File names in the project's prediction folder.
    pub async fn list_prediction_files(&self, project_id: u64) -> Result<Vec<String>> {
        let url = self.config.prediction_folder_url(project_id);
        let bytes = self.get(&url, None).await?;
        let entries: Vec<serde_json::Value> = decode(&url, &bytes)?;

        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                serde_json::Value::String(name) => name,
                other => other.to_string(),
            })
            .collect())
    }

    /// Submit a prediction job.
    pub async fn submit_prediction(&self, request: &GenerationRequest) -> Result<JobHandle> {
        let token = self.require_token()?;
        let url = format!("{}/api/v1/prediction/", self.base_url());

        // Not retried: a repeated POST would queue a second job
        let response = self
            .client
            .post(&url)
            .header(ACCESS_TOKEN_HEADER, token)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Request(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!("prediction request rejected (HTTP {})", status)));
        }
        if !status.is_success() {
            return Err(Error::Http { status: status.as_u16(), url });
        }

        let handle: JobHandle = response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("{}: {}", url, e)))?;
        info!("[FairClient] Submitted prediction for folder {} as job {}", request.folder, handle.task_id);
        Ok(handle)
    }

    /// Current state of a prediction job.
    pub async fn job_status(&self, task_id: &str) -> Result<JobStatus> {
        let token = self.require_token()?;
        let url = format!("{}/api/v1/task/status/{}", self.base_url(), task_id);
        let bytes = self.get(&url, Some(token)).await?;
        let response: JobStatusResponse = decode(&url, &bytes)?;
        Ok(response.status)
    }

    /// Poll a job until it finishes or fails.
    ///
    /// Transient errors are retried at the poll interval without limit. After
    /// `finished` the monitor waits the configured settle delay before
    /// returning, so the result files are in place.
    pub async fn monitor_job(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
        mut on_status: impl FnMut(JobStatus),
    ) -> Result<JobStatus> {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            polls += 1;

            match self.job_status(task_id).await {
                Ok(status) => {
                    on_status(status);
                    match status {
                        JobStatus::Finished => {
                            info!(
                                "[JobMonitor] Job {} finished after {} polls in {:?}",
                                task_id,
                                polls,
                                start.elapsed()
                            );
                            sleep_or_cancel(self.config.finish_delay, cancel).await?;
                            return Ok(status);
                        }
                        JobStatus::Failed => {
                            warn!("[JobMonitor] Job {} failed after {} polls", task_id, polls);
                            return Ok(status);
                        }
                        JobStatus::Queued | JobStatus::Running => {
                            debug!("[JobMonitor] Job {} {:?} ({}%)", task_id, status, status.progress());
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("[JobMonitor] Status check for {} failed: {}, retrying", task_id, e);
                }
                Err(e) => return Err(e),
            }

            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

impl AuthService for FairClient {
    async fn current_user(&self, token: &str) -> Result<UserProfile> {
        let url = format!("{}/api/v1/auth/me/", self.base_url());
        let bytes = self.get(&url, Some(token)).await.map_err(|e| match e {
            Error::Http { status: 401 | 403, .. } => Error::Auth("invalid access token".into()),
            other => other,
        })?;
        decode(&url, &bytes)
    }
}

impl PredictionService for FairClient {
    type Index = FgbPointIndex;

    async fn task_statistics(&self, project_id: u64) -> Result<AggregateResult> {
        let url = self.config.stats_url(project_id);
        let bytes = self.get(&url, None).await?;
        decode(&url, &bytes)
    }

    async fn open_point_index(&self, project_id: u64) -> Result<FgbPointIndex> {
        FgbPointIndex::open(self.config.index_url(project_id)).await
    }

    async fn point_collection(&self, project_id: u64) -> Result<Vec<Point<f64>>> {
        let url = self.config.points_url(project_id);
        let start = Instant::now();
        let bytes = self.get(&url, None).await?;
        let geojson: GeoJson = decode(&url, &bytes)?;
        let points = points_from_geojson(&geojson);

        info!(
            "[FairClient] {} points ({:.1}KB) from {} in {:?}",
            points.len(),
            bytes.len() as f64 / 1024.0,
            url,
            start.elapsed()
        );
        Ok(points)
    }
}

// =============================================================================
// FlatGeobuf
// =============================================================================

/// Remote FlatGeobuf point file, read one bounding box at a time.
///
/// Each query opens the file again, re-reading the header, and then reads only
/// the index ranges and features that fall inside the box. No reader is held
/// between queries.
pub struct FgbPointIndex {
    url: String,
    queries: u32,
}

impl FgbPointIndex {
    /// Fail early when the file cannot be opened, so the loader moves on to the
    /// next source before any task is queried. The reader is not kept: every
    /// [`BboxPointSource::query_bbox`] call opens its own.
    pub async fn open(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        flatgeobuf::HttpFgbReader::open(&url)
            .await
            .map_err(|e| Error::Source(format!("{}: {}", url, e)))?;
        debug!("[FgbIndex] Opened {}", url);
        Ok(Self { url, queries: 0 })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn queries(&self) -> u32 {
        self.queries
    }
}

impl BboxPointSource for FgbPointIndex {
    async fn query_bbox(&mut self, bounds: &Bounds) -> Result<Vec<Point<f64>>> {
        self.queries += 1;
        let source_err = |e: flatgeobuf::Error| Error::Source(format!("{}: {}", self.url, e));

        let mut features = flatgeobuf::HttpFgbReader::open(&self.url)
            .await
            .map_err(source_err)?
            .select_bbox(bounds.min_lng, bounds.min_lat, bounds.max_lng, bounds.max_lat)
            .await
            .map_err(source_err)?;

        let mut points = Vec::new();
        while let Some(feature) = features.next().await.map_err(source_err)? {
            match feature.to_geo() {
                Ok(geometry) => collect_points(geometry, &mut points),
                Err(e) => debug!("[FgbIndex] Skipping undecodable feature: {}", e),
            }
        }
        Ok(points)
    }
}

/// Point and MultiPoint geometries become points; everything else is ignored.
fn collect_points(geometry: Geometry<f64>, points: &mut Vec<Point<f64>>) {
    match geometry {
        Geometry::Point(p) => points.push(p),
        Geometry::MultiPoint(mp) => points.extend(mp.0),
        Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                collect_points(g, points);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, GeometryCollection, MultiPoint};

    #[tokio::test]
    async fn test_unreachable_index_fails_on_open() {
        let result = FgbPointIndex::open("http://127.0.0.1:9/predictions.fgb").await;
        assert!(matches!(result, Err(Error::Source(ref msg)) if msg.contains("127.0.0.1:9")));
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let backoff = Backoff::default();
        assert_eq!(backoff.record_429(), Duration::from_millis(1000));
        assert_eq!(backoff.record_429(), Duration::from_millis(2000));
        assert_eq!(backoff.record_429(), Duration::from_millis(4000));
        assert_eq!(backoff.record_429(), Duration::from_millis(4000));

        backoff.record_success();
        assert_eq!(backoff.record_429(), Duration::from_millis(1000));
    }

    #[test]
    fn test_request_error_backoff() {
        assert_eq!(Backoff::for_request_error(1), Duration::from_millis(400));
        assert_eq!(Backoff::for_request_error(3), Duration::from_millis(1600));
    }

    #[test]
    fn test_project_list_response() {
        let listing: ProjectListResponse = serde_json::from_str(
            r#"{"mapResults": {"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"projectId": 12, "name": "Accra"},
                 "geometry": {"type": "Point", "coordinates": [-0.2, 5.6]}}
            ]}, "results": []}"#,
        )
        .unwrap();
        let projects = parse_project_list(&listing.map_results);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_id, 12);
    }

    #[test]
    fn test_statistics_payload() {
        let stats: AggregateResult = decode(
            "stats",
            br#"{"taskCounts": {"1": 4, "2": 6}, "maxCount": 6, "totalPredictions": 10,
                "tasksWithPredictions": 2, "totalTasks": 3}"#,
        )
        .unwrap();
        assert_eq!(stats.count_for(2), 6);
        assert!(stats.is_consistent());

        let err = decode::<AggregateResult>("stats", b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_collect_points() {
        let mut points = Vec::new();
        collect_points(Geometry::Point(point!(x: 1.0, y: 2.0)), &mut points);
        collect_points(
            Geometry::MultiPoint(MultiPoint::new(vec![point!(x: 3.0, y: 4.0)])),
            &mut points,
        );
        collect_points(
            Geometry::GeometryCollection(GeometryCollection::new_from(vec![
                Geometry::Point(point!(x: 5.0, y: 6.0)),
                Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]),
            ])),
            &mut points,
        );
        assert_eq!(points, vec![point!(x: 1.0, y: 2.0), point!(x: 3.0, y: 4.0), point!(x: 5.0, y: 6.0)]);
    }

    #[test]
    fn test_client_urls() {
        let config = ClientConfig::for_environment(crate::Environment::Dev);
        let client = FairClient::new(config).unwrap();
        assert_eq!(client.base_url(), "https://fair-dev.hotosm.org");
        assert!(matches!(client.require_token(), Err(Error::Auth(_))));

        let client = client.with_token("abc");
        assert_eq!(client.require_token().unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_monitor_respects_cancellation() {
        let client = FairClient::new(ClientConfig::default()).unwrap().with_token("abc");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.monitor_job("job", &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
