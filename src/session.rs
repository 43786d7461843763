//! Application state for one user working through projects.
//!
//! [`Session`] is the single owner of the current token, project and
//! prediction result. Scans run under the session's [`CancellationToken`].
//! Selecting another project cancels it and issues a new one. A scan borrows
//! the session mutably, so scans never overlap: a scan keeps the current token
//! and only replaces one that is already cancelled. A cancelled scan never
//! writes its result.

use geojson::FeatureCollection;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::aggregate::AggregateResult;
use crate::choropleth::{annotate_tasks, Choropleth};
use crate::project::Project;
use crate::sources::{load_predictions, PredictionData, PredictionService, SourceStrategy};
use crate::stats::{summarize, StatsSummary};
use crate::{AggregationConfig, Error, Result, Task};

/// Storage key of the access token.
pub const TOKEN_KEY: &str = "fairAccessToken";

// =============================================================================
// Token persistence
// =============================================================================

/// Durable storage for the access token.
pub trait TokenStore {
    fn load(&self) -> Result<Option<String>>;
    fn save(&mut self, token: &str) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

/// Token kept for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    token: Option<String>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }

    fn save(&mut self, token: &str) -> Result<()> {
        self.token = Some(token.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.token = None;
        Ok(())
    }
}

/// Token stored in a JSON object file under [`TOKEN_KEY`].
///
/// Other keys in the file are preserved. A missing file reads as no token.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, JsonValue>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Map::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &Map<String, JsonValue>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(map)?)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .read_map()?
            .get(TOKEN_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    fn save(&mut self, token: &str) -> Result<()> {
        let mut map = self.read_map()?;
        map.insert(TOKEN_KEY.to_string(), JsonValue::String(token.to_string()));
        self.write_map(&map)
    }

    fn clear(&mut self) -> Result<()> {
        let mut map = self.read_map()?;
        if map.remove(TOKEN_KEY).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// The signed-in user, as returned by the prediction service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub osm_id: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Token validation.
#[allow(async_fn_in_trait)]
pub trait AuthService {
    async fn current_user(&self, token: &str) -> Result<UserProfile>;
}

// =============================================================================
// Session
// =============================================================================

/// Prediction panel state for the current project.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PredictionState {
    #[default]
    Idle,
    Loading,
    Ready {
        result: AggregateResult,
        source: SourceStrategy,
    },
    Unavailable,
    Failed(String),
}

impl PredictionState {
    pub fn result(&self) -> Option<&AggregateResult> {
        match self {
            PredictionState::Ready { result, .. } => Some(result),
            _ => None,
        }
    }
}

pub struct Session<S, T> {
    service: S,
    store: T,
    config: AggregationConfig,
    strategies: Vec<SourceStrategy>,
    token: Option<String>,
    user: Option<UserProfile>,
    project: Option<Project>,
    tasks: Vec<Task>,
    predictions: PredictionState,
    scan: CancellationToken,
}

impl<S, T: TokenStore> Session<S, T> {
    pub fn new(service: S, store: T) -> Self {
        Self {
            service,
            store,
            config: AggregationConfig::default(),
            strategies: SourceStrategy::DEFAULT_ORDER.to_vec(),
            token: None,
            user: None,
            project: None,
            tasks: Vec::new(),
            predictions: PredictionState::Idle,
            scan: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: AggregationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<SourceStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn predictions(&self) -> &PredictionState {
        &self.predictions
    }

    /// Handle that cancels the running scan, or the next one if none is running.
    pub fn scan_handle(&self) -> CancellationToken {
        self.scan.clone()
    }

    // A cancelled token is spent; later scans get a new one.
    fn fresh_scan(&mut self) -> CancellationToken {
        if self.scan.is_cancelled() {
            self.scan = CancellationToken::new();
        }
        self.scan.clone()
    }

    /// Forget the token and the user.
    pub fn logout(&mut self) -> Result<()> {
        self.token = None;
        self.user = None;
        self.store.clear()?;
        info!("[Session] Logged out");
        Ok(())
    }

    /// Switch to another project. Any running scan is cancelled and the
    /// previous result discarded.
    pub fn select_project(&mut self, project: Project) {
        self.scan.cancel();
        self.scan = CancellationToken::new();
        self.tasks = project.parse_tasks();
        info!(
            "[Session] Selected project {} with {} tasks",
            project.project_id,
            self.tasks.len()
        );
        self.project = Some(project);
        self.predictions = PredictionState::Idle;
    }

    /// Drop the current project.
    pub fn clear_project(&mut self) {
        self.scan.cancel();
        self.scan = CancellationToken::new();
        self.project = None;
        self.tasks.clear();
        self.predictions = PredictionState::Idle;
    }

    pub fn summary(&self) -> Option<StatsSummary> {
        self.predictions.result().map(summarize)
    }

    pub fn choropleth(&self) -> Option<Choropleth> {
        self.predictions.result().map(Choropleth::from_result)
    }

    /// Task collection annotated with `predictionCount`, for export.
    pub fn annotated_tasks(&self) -> Option<FeatureCollection> {
        let project = self.project.as_ref()?;
        let result = self.predictions.result()?;
        Some(annotate_tasks(&project.tasks, result))
    }
}

impl<S: AuthService, T: TokenStore> Session<S, T> {
    /// Validate a token and persist it on success.
    ///
    /// A rejected token is never stored.
    pub async fn authenticate(&mut self, token: &str) -> Result<&UserProfile> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Auth("empty access token".into()));
        }

        let user = match self.service.current_user(token).await {
            Ok(user) => user,
            Err(e) => {
                warn!("[Session] Token rejected: {}", e);
                return Err(match e {
                    Error::Http { status: 401 | 403, .. } => Error::Auth("invalid access token".into()),
                    other => other,
                });
            }
        };

        self.store.save(token)?;
        self.token = Some(token.to_string());
        info!("[Session] Authenticated as {:?}", user.username);
        Ok(&*self.user.insert(user))
    }

    /// Re-validate a stored token. A token that fails validation is cleared.
    pub async fn restore(&mut self) -> Result<Option<&UserProfile>> {
        let Some(token) = self.store.load()? else {
            debug!("[Session] No stored token");
            return Ok(None);
        };

        match self.service.current_user(&token).await {
            Ok(user) => {
                self.token = Some(token);
                Ok(Some(&*self.user.insert(user)))
            }
            Err(e) => {
                warn!("[Session] Stored token no longer valid ({}), clearing", e);
                self.store.clear()?;
                self.token = None;
                self.user = None;
                Ok(None)
            }
        }
    }
}

impl<S: PredictionService, T: TokenStore> Session<S, T> {
    /// Load predictions for the selected project.
    ///
    /// Returns [`Error::Cancelled`] and leaves no result behind when the scan
    /// is cancelled through [`Session::scan_handle`] or a project switch.
    /// The `&mut self` borrow keeps scans from overlapping, so only a token
    /// that is already cancelled gets replaced.
    pub async fn load_predictions(&mut self) -> Result<&PredictionState> {
        let Some(project_id) = self.project.as_ref().map(|p| p.project_id) else {
            return Err(Error::NotFound("no project selected".into()));
        };

        let cancel = self.fresh_scan();
        self.predictions = PredictionState::Loading;

        let outcome = load_predictions(
            &self.service,
            project_id,
            &self.tasks,
            &self.strategies,
            &self.config,
            &cancel,
        )
        .await;

        if cancel.is_cancelled() || matches!(outcome, Err(Error::Cancelled)) {
            debug!("[Session] Scan for project {} cancelled, result dropped", project_id);
            self.predictions = PredictionState::Idle;
            return Err(Error::Cancelled);
        }

        self.predictions = match outcome {
            Ok(PredictionData::Ready { result, source }) => PredictionState::Ready { result, source },
            Ok(PredictionData::Unavailable) => PredictionState::Unavailable,
            Err(e) => PredictionState::Failed(e.to_string()),
        };
        Ok(&self.predictions)
    }
}
