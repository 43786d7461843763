//! Tasking Manager project model.
//!
//! Mirrors the subset of the `/api/v2/projects/{id}/` payload this crate
//! reads, plus the `mapResults` listing returned by `/api/v2/projects/`.

use geo::{MultiPolygon, Point};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, Value};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::geo_utils::geojson_bounds;
use crate::normalize::rings_to_polygon;
use crate::{Bounds, Task, TaskId, TaskStatus};

/// Free-text metadata block of a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub imagery: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

/// Project detail as served by the project service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub project_priority: Option<String>,
    #[serde(default)]
    pub percent_mapped: Option<f64>,
    #[serde(default)]
    pub percent_validated: Option<f64>,
    pub area_of_interest: GeoJson,
    pub tasks: FeatureCollection,
    #[serde(default)]
    pub project_info: ProjectInfo,
    #[serde(default)]
    pub imagery: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub license_id: Option<u64>,
}

impl Project {
    pub fn name(&self) -> String {
        self.project_info
            .name
            .clone()
            .unwrap_or_else(|| format!("Project {}", self.project_id))
    }

    /// Imagery from the project, then its info block.
    pub fn imagery(&self) -> Option<&str> {
        non_empty(self.imagery.as_deref()).or_else(|| non_empty(self.project_info.imagery.as_deref()))
    }

    /// Licence from the project, its info block, then the licence id.
    pub fn license(&self) -> Option<String> {
        non_empty(self.license.as_deref())
            .or_else(|| non_empty(self.project_info.license.as_deref()))
            .map(str::to_string)
            .or_else(|| self.license_id.map(|id| id.to_string()))
    }

    /// Extent of the area of interest, for fitting a map view.
    pub fn boundary_bounds(&self) -> Option<Bounds> {
        geojson_bounds(&self.area_of_interest)
    }

    /// Parse the task grid.
    ///
    /// Features without a numeric `taskId` are dropped. Tasks whose geometry is
    /// missing or malformed are kept with an empty geometry so they still count
    /// towards the project's task total, but they never contain a point.
    pub fn parse_tasks(&self) -> Vec<Task> {
        parse_tasks(&self.tasks)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a task FeatureCollection into [`Task`]s, preserving feature order.
pub fn parse_tasks(tasks: &FeatureCollection) -> Vec<Task> {
    let mut parsed = Vec::with_capacity(tasks.features.len());

    for (i, feature) in tasks.features.iter().enumerate() {
        let Some(task_id) = feature_task_id(feature) else {
            warn!("[Project] Task feature {} has no taskId, skipping", i);
            continue;
        };

        let status = feature
            .property("taskStatus")
            .and_then(|v| serde_json::from_value::<TaskStatus>(v.clone()).ok())
            .unwrap_or(TaskStatus::Unknown);

        let geometry = feature
            .geometry
            .as_ref()
            .and_then(|g| task_geometry(&g.value))
            .unwrap_or_else(|| {
                warn!("[Project] Task {} has no usable polygon geometry", task_id);
                MultiPolygon::new(vec![])
            });

        parsed.push(Task::new(task_id, status, geometry));
    }

    debug!("[Project] Parsed {} of {} task features", parsed.len(), tasks.features.len());
    parsed
}

pub(crate) fn feature_task_id(feature: &Feature) -> Option<TaskId> {
    property_u64(feature.properties.as_ref()?, "taskId")
}

fn property_u64(properties: &JsonObject, key: &str) -> Option<u64> {
    match properties.get(key)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn task_geometry(value: &Value) -> Option<MultiPolygon<f64>> {
    match value {
        Value::Polygon(rings) => rings_to_polygon(rings).map(|p| MultiPolygon::new(vec![p])),
        Value::MultiPolygon(polygons) => polygons
            .iter()
            .map(|rings| rings_to_polygon(rings))
            .collect::<Option<Vec<_>>>()
            .map(MultiPolygon::new),
        _ => None,
    }
}

/// Number of tasks per status, in status order.
pub fn task_status_breakdown(tasks: &[Task]) -> BTreeMap<TaskStatus, usize> {
    let mut stats = BTreeMap::new();
    for task in tasks {
        *stats.entry(task.status).or_insert(0) += 1;
    }
    stats
}

/// One entry of the project listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSummary {
    pub project_id: u64,
    pub name: Option<String>,
    /// Marker location, when the listing carries a point geometry
    pub location: Option<Point<f64>>,
}

impl ProjectSummary {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Project {}", self.project_id))
    }
}

/// Parse the `mapResults` FeatureCollection of the project listing.
pub fn parse_project_list(map_results: &FeatureCollection) -> Vec<ProjectSummary> {
    map_results
        .features
        .iter()
        .filter_map(|feature| {
            let properties = feature.properties.as_ref()?;
            let project_id = property_u64(properties, "projectId")?;
            let name = properties
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let location = feature.geometry.as_ref().and_then(|g| match &g.value {
                Value::Point(p) if p.len() >= 2 => Some(Point::new(p[0], p[1])),
                _ => None,
            });
            Some(ProjectSummary { project_id, name, location })
        })
        .collect()
}
