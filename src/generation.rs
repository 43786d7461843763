//! Prediction generation requests and job status.
//!
//! A request carries the project boundary normalized to one Polygon, the
//! model tunables and where the results should land in the workspace.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::geo_utils::polygon_to_geojson;
use crate::normalize::{normalize_geometry, Normalized};
use crate::project::Project;
use crate::{Error, Result};

// =============================================================================
// Imagery
// =============================================================================

const BING_TILES: &str = "https://ecn.t{s}.tiles.virtualearth.net/tiles/a{q}.jpeg?g=1";
const ESRI_TILES: &str = "https://services.arcgisonline.com/arcgis/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}?blankTile=false";
const MAXAR_STANDARD_TILES: &str =
    "https://services.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}";

fn mapbox_tiles(token: &str) -> String {
    format!(
        "https://{{s}}.tiles.mapbox.com/v4/mapbox.satellite/{{z}}/{{x}}/{{y}}@2x.jpg?access_token={}",
        token
    )
}

/// Tile URL template for a named imagery source.
///
/// Unknown names, and `Mapbox` without a token, resolve to Esri World Imagery.
pub fn imagery_tile_url(name: &str, mapbox_token: Option<&str>) -> String {
    match (name, mapbox_token) {
        ("Bing", _) => BING_TILES.to_string(),
        ("Mapbox", Some(token)) if !token.is_empty() => mapbox_tiles(token),
        ("Maxar-Standard", _) => MAXAR_STANDARD_TILES.to_string(),
        _ => ESRI_TILES.to_string(),
    }
}

/// Imagery value for a generation request.
///
/// The project's own imagery is used as-is, except `mapbox` (any case), which
/// becomes the Mapbox satellite template when a token is configured and Bing
/// otherwise. No project imagery means Bing.
pub fn resolve_source_imagery(project_imagery: Option<&str>, mapbox_token: Option<&str>) -> String {
    let Some(imagery) = project_imagery.map(str::trim).filter(|s| !s.is_empty()) else {
        return imagery_tile_url("Bing", None);
    };

    if imagery.eq_ignore_ascii_case("mapbox") {
        return match mapbox_token.filter(|t| !t.is_empty()) {
            Some(token) => mapbox_tiles(token),
            None => {
                warn!("[Generation] Mapbox imagery requested without a token, using Bing");
                imagery_tile_url("Bing", None)
            }
        };
    }
    imagery.to_string()
}

// =============================================================================
// Request
// =============================================================================

/// Tunable parameters of a prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Imagery tile URL template
    pub source: String,
    /// Model checkpoint name
    pub checkpoint: String,
    /// Minimum confidence, percent 0-100
    pub confidence: f64,
    /// Simplification tolerance
    pub tolerance: f64,
    /// Minimum footprint area
    pub area_threshold: u32,
    pub orthogonalize: bool,
    pub ortho_max_angle_change_deg: u32,
    pub zoom_level: u32,
    pub ortho_skew_tolerance_deg: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            source: imagery_tile_url("Bing", None),
            checkpoint: "ramp".to_string(),
            confidence: 50.0,
            tolerance: 0.5,
            area_threshold: 3,
            orthogonalize: true,
            ortho_max_angle_change_deg: 15,
            zoom_level: 20,
            ortho_skew_tolerance_deg: 15,
        }
    }
}

impl GenerationConfig {
    /// Defaults with the imagery taken from the project.
    pub fn for_project(project: &Project, mapbox_token: Option<&str>) -> Self {
        Self {
            source: resolve_source_imagery(project.imagery(), mapbox_token),
            ..Self::default()
        }
    }
}

/// Body of a prediction request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub geom: geojson::Geometry,
    pub config: GenerationConfig,
    pub description: String,
    pub folder: String,
}

impl GenerationRequest {
    /// Build a request for the project's area of interest.
    ///
    /// Fails with [`Error::Geometry`] only when the boundary yields no polygon
    /// at all; a failed union still produces a request over the bounding box.
    pub fn from_project(project: &Project, config: GenerationConfig) -> Result<Self> {
        let normalized = normalize_geometry(&project.area_of_interest).ok_or_else(|| {
            Error::Geometry(format!("project {} has no usable boundary", project.project_id))
        })?;

        match &normalized {
            Normalized::BoundingBox(_) => warn!(
                "[Generation] Project {} boundary could not be merged, requesting its bounding box",
                project.project_id
            ),
            Normalized::Unioned(_) => info!(
                "[Generation] Project {} boundary merged into one polygon",
                project.project_id
            ),
            Normalized::Unchanged(_) => {}
        }

        Ok(Self {
            geom: polygon_to_geojson(normalized.polygon()),
            config,
            description: default_description(project.project_id),
            folder: default_folder(project.project_id),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }
}

pub fn default_description(project_id: u64) -> String {
    format!("Tasking Manager Project {}", project_id)
}

pub fn default_folder(project_id: u64) -> String {
    format!("TM/{}", project_id)
}

/// Response to a submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobHandle {
    #[serde(deserialize_with = "string_or_number")]
    pub task_id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected task_id {}", other))),
    }
}

// =============================================================================
// Job status
// =============================================================================

/// State of a submitted prediction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        JobStatus::parse(&s)
    }
}

impl JobStatus {
    /// Anything not running, finished or failed is still queued.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            "running" => JobStatus::Running,
            _ => JobStatus::Queued,
        }
    }

    /// Progress bar position, percent.
    pub fn progress(&self) -> u8 {
        match self {
            JobStatus::Finished => 100,
            JobStatus::Running => 50,
            JobStatus::Queued | JobStatus::Failed => 10,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Finished => "Prediction completed!",
            JobStatus::Failed => "Prediction failed",
        }
    }
}

/// Body of the job status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(aoi: serde_json::Value) -> Project {
        serde_json::from_value(json!({
            "projectId": 9,
            "areaOfInterest": aoi,
            "tasks": {"type": "FeatureCollection", "features": []},
            "projectInfo": {"imagery": "mapbox"}
        }))
        .unwrap()
    }

    #[test]
    fn test_imagery_tile_url() {
        assert!(imagery_tile_url("Bing", None).contains("virtualearth"));
        assert!(imagery_tile_url("Mapbox", Some("pk.abc")).ends_with("access_token=pk.abc"));
        assert_eq!(imagery_tile_url("Mapbox", None), ESRI_TILES);
        assert_eq!(imagery_tile_url("Maxar-Standard", None), MAXAR_STANDARD_TILES);
        assert_eq!(imagery_tile_url("Nonsense", None), ESRI_TILES);
    }

    #[test]
    fn test_resolve_source_imagery() {
        assert_eq!(resolve_source_imagery(None, None), BING_TILES);
        assert_eq!(resolve_source_imagery(Some("  "), None), BING_TILES);
        assert_eq!(resolve_source_imagery(Some("MapBox"), None), BING_TILES);
        assert!(resolve_source_imagery(Some("mapbox"), Some("tok")).contains("mapbox.satellite"));
        assert_eq!(
            resolve_source_imagery(Some("https://tiles.example/{z}/{x}/{y}"), None),
            "https://tiles.example/{z}/{x}/{y}"
        );
    }

    #[test]
    fn test_request_from_multipolygon() {
        let p = project(json!({
            "type": "MultiPolygon",
            "coordinates": [
                [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]],
                [[[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0], [1.0, 1.0]]]
            ]
        }));
        let config = GenerationConfig::for_project(&p, Some("tok"));
        let request = GenerationRequest::from_project(&p, config).unwrap();

        assert!(matches!(request.geom.value, geojson::Value::Polygon(_)));
        assert_eq!(request.description, "Tasking Manager Project 9");
        assert_eq!(request.folder, "TM/9");
        assert!(request.config.source.contains("mapbox.satellite"));

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["geom"]["type"], "Polygon");
        assert_eq!(body["config"]["area_threshold"], 3);
        assert_eq!(body["config"]["orthogonalize"], true);
    }

    #[test]
    fn test_request_without_boundary_fails() {
        let p = project(json!({"type": "FeatureCollection", "features": []}));
        let err = GenerationRequest::from_project(&p, GenerationConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
    }

    #[test]
    fn test_request_overrides() {
        let p = project(json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        }));
        let request = GenerationRequest::from_project(&p, GenerationConfig::default())
            .unwrap()
            .with_description("rerun")
            .with_folder("TM/9/rerun");
        assert_eq!(request.description, "rerun");
        assert_eq!(request.folder, "TM/9/rerun");
    }

    #[test]
    fn test_job_status() {
        let response: JobStatusResponse = serde_json::from_value(json!({"status": "running"})).unwrap();
        assert_eq!(response.status, JobStatus::Running);
        assert_eq!(response.status.progress(), 50);
        assert!(!response.status.is_terminal());

        assert_eq!(JobStatus::parse("PENDING"), JobStatus::Queued);
        assert_eq!(JobStatus::parse("Finished").progress(), 100);
        assert!(JobStatus::parse("failed").is_terminal());
    }

    #[test]
    fn test_job_handle() {
        let handle: JobHandle = serde_json::from_value(json!({"task_id": "abc-123"})).unwrap();
        assert_eq!(handle.task_id, "abc-123");
        let handle: JobHandle = serde_json::from_value(json!({"task_id": 77})).unwrap();
        assert_eq!(handle.task_id, "77");
    }
}
