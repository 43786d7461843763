//! Service endpoints and tuning knobs.
//!
//! Everything here has a sensible [`Default`]; [`ClientConfig::from_env`]
//! layers the usual deployment variables on top.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which deployment of the project and prediction services to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Production,
}

impl Environment {
    /// Parse `dev`/`development`/`staging` or `prod`/`production` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "staging" => Some(Environment::Dev),
            "prod" | "production" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn fair_api_url(&self) -> &'static str {
        match self {
            Environment::Dev => "https://fair-dev.hotosm.org",
            Environment::Production => "https://api-prod.fair.hotosm.org",
        }
    }

    pub fn tasking_manager_api_url(&self) -> &'static str {
        match self {
            Environment::Dev => "https://tasking-manager-dev-api.hotosm.org",
            Environment::Production => "https://tasking-manager-production-api.hotosm.org",
        }
    }
}

/// Configuration for the REST clients and the job monitor.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub environment: Environment,
    /// Prediction service (fAIr) base URL, no trailing slash
    pub fair_api_url: String,
    /// Project service (Tasking Manager) base URL, no trailing slash
    pub tasking_manager_api_url: String,
    /// Per-request timeout (default: 30s)
    pub request_timeout: Duration,
    /// Delay between job status polls (default: 5s)
    pub poll_interval: Duration,
    /// Pause after a job reports `finished` before results are fetched (default: 2s)
    pub finish_delay: Duration,
    /// Precomputed per-task statistics artifact
    pub stats_file: String,
    /// FlatGeobuf point artifact (bbox-queryable)
    pub index_file: String,
    /// GeoJSON point artifact
    pub points_file: String,
    /// Needed to resolve `mapbox` imagery into a tile URL
    pub mapbox_access_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl ClientConfig {
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            fair_api_url: environment.fair_api_url().to_string(),
            tasking_manager_api_url: environment.tasking_manager_api_url().to_string(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            finish_delay: Duration::from_secs(2),
            stats_file: "prediction_stats.json".to_string(),
            index_file: "labels_points.fgb".to_string(),
            points_file: "labels_points.geojson".to_string(),
            mapbox_access_token: None,
        }
    }

    /// Build from `FAIR_ENV`, `FAIR_API_URL`, `TASKING_MANAGER_API_URL` and
    /// `MAPBOX_ACCESS_TOKEN`. Unset or empty variables keep the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = get("FAIR_ENV")
            .and_then(|v| Environment::parse(&v))
            .unwrap_or_default();
        let mut config = Self::for_environment(environment);

        if let Some(url) = get("FAIR_API_URL") {
            config.fair_api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = get("TASKING_MANAGER_API_URL") {
            config.tasking_manager_api_url = url.trim_end_matches('/').to_string();
        }
        config.mapbox_access_token = get("MAPBOX_ACCESS_TOKEN");
        config
    }

    /// Workspace folder that holds a project's prediction artifacts.
    pub fn prediction_folder_url(&self, project_id: u64) -> String {
        format!("{}/api/workspace/prediction/TM/{}", self.fair_api_url, project_id)
    }

    pub fn stats_url(&self, project_id: u64) -> String {
        format!("{}/{}", self.prediction_folder_url(project_id), self.stats_file)
    }

    pub fn index_url(&self, project_id: u64) -> String {
        format!("{}/{}", self.prediction_folder_url(project_id), self.index_file)
    }

    pub fn points_url(&self, project_id: u64) -> String {
        format!("{}/{}", self.prediction_folder_url(project_id), self.points_file)
    }
}

/// Chunk sizes for the cooperative aggregation scans.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Points processed between yields in batch mode (default: 500)
    pub point_chunk_size: usize,
    /// Tasks processed between yields in streaming mode (default: 10)
    pub task_chunk_size: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            point_chunk_size: 500,
            task_chunk_size: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("Production"), Some(Environment::Production));
        assert_eq!(Environment::parse(" dev "), Some(Environment::Dev));
        assert_eq!(Environment::parse("local"), None);
    }

    #[test]
    fn test_default_is_dev() {
        let config = ClientConfig::default();
        assert_eq!(config.environment, Environment::Dev);
        assert_eq!(config.fair_api_url, "https://fair-dev.hotosm.org");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FAIR_ENV", "production"),
            ("FAIR_API_URL", "http://localhost:8000/"),
            ("MAPBOX_ACCESS_TOKEN", ""),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.fair_api_url, "http://localhost:8000");
        assert_eq!(
            config.tasking_manager_api_url,
            "https://tasking-manager-production-api.hotosm.org"
        );
        assert!(config.mapbox_access_token.is_none());
    }

    #[test]
    fn test_artifact_urls() {
        let config = ClientConfig::default();
        assert_eq!(
            config.points_url(42),
            "https://fair-dev.hotosm.org/api/workspace/prediction/TM/42/labels_points.geojson"
        );
        assert!(config.index_url(42).ends_with("/TM/42/labels_points.fgb"));
    }

    #[test]
    fn test_aggregation_defaults() {
        let config = AggregationConfig::default();
        assert_eq!(config.point_chunk_size, 500);
        assert_eq!(config.task_chunk_size, 10);
    }
}
