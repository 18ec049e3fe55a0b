use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Normalize a key or name for uniqueness comparison: trim and lowercase.
///
/// Storage keeps the original casing for display; every lookup and duplicate
/// check goes through this form.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ============================================================================
// Credentials
// ============================================================================

/// AuthType distinguishes cookie/token credentials from API-key entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Cookie,
    Token,
    ApiKey,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Cookie => write!(f, "cookie"),
            AuthType::Token => write!(f, "token"),
            AuthType::ApiKey => write!(f, "api_key"),
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "cookie" => Ok(AuthType::Cookie),
            "token" => Ok(AuthType::Token),
            "api_key" => Ok(AuthType::ApiKey),
            _ => Err(format!("Invalid auth type: {}", s)),
        }
    }
}

impl TryFrom<String> for AuthType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// AuthCredential is a cookie- or token-bearing identity for one site.
///
/// `site_domain` is the natural key when present; API-key style entries with
/// an empty domain are disambiguated by `(name, auth_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCredential {
    pub id: Uuid,
    pub name: String,
    pub auth_type: AuthType,
    pub site_domain: String,
    pub service_type: String,
    pub base_url: String,
    pub user_agent: String,
    /// Opaque cookie blob, stored verbatim.
    pub cookies: String,
    pub tokens: HashMap<String, String>,
    pub data: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthCredential {
    /// Create a credential with a generated id and current timestamps.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            auth_type: AuthType::Cookie,
            site_domain: String::new(),
            service_type: String::new(),
            base_url: String::new(),
            user_agent: String::new(),
            cookies: String::new(),
            tokens: HashMap::new(),
            data: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the missing one of `site_domain` / `base_url` from the other.
    ///
    /// At least one of the two must be supplied; returns an error message
    /// suitable for the validation layer otherwise.
    pub fn derive_endpoints(&mut self) -> Result<(), String> {
        let has_domain = !self.site_domain.trim().is_empty();
        let has_url = !self.base_url.trim().is_empty();

        if !has_domain && !has_url {
            return Err(format!(
                "credential '{}' needs at least one of site_domain or base_url",
                self.name
            ));
        }

        if !has_url {
            self.base_url = format!("https://{}", self.site_domain.trim());
        }
        if !has_domain {
            let parsed = url::Url::parse(self.base_url.trim())
                .map_err(|e| format!("credential '{}': invalid base_url: {}", self.name, e))?;
            self.site_domain = parsed
                .host_str()
                .ok_or_else(|| format!("credential '{}': base_url has no host", self.name))?
                .to_string();
        }
        Ok(())
    }
}

// ============================================================================
// Key/value variables
// ============================================================================

/// KeyValueEntry is a secret or variable referenced by `{key}` placeholders
/// in job-definition config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueEntry {
    pub id: Uuid,
    /// Original-cased key, preserved for display.
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyValueEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            value: value.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Normalized form used for uniqueness and lookup.
    pub fn normalized_key(&self) -> String {
        normalize_key(&self.key)
    }
}

// ============================================================================
// Connectors
// ============================================================================

/// Known connector kinds; the kind selects the schema of the config JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Jira,
    Confluence,
    Github,
    Web,
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorType::Jira => write!(f, "jira"),
            ConnectorType::Confluence => write!(f, "confluence"),
            ConnectorType::Github => write!(f, "github"),
            ConnectorType::Web => write!(f, "web"),
        }
    }
}

impl FromStr for ConnectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jira" => Ok(ConnectorType::Jira),
            "confluence" => Ok(ConnectorType::Confluence),
            "github" => Ok(ConnectorType::Github),
            "web" => Ok(ConnectorType::Web),
            _ => Err(format!("Unknown connector type: {}", s)),
        }
    }
}

impl TryFrom<String> for ConnectorType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl ConnectorType {
    /// Config keys this connector kind requires before it can be persisted.
    pub fn required_config_keys(&self) -> &'static [&'static str] {
        match self {
            ConnectorType::Jira | ConnectorType::Confluence => &["base_url"],
            ConnectorType::Github => &["owner", "repo"],
            ConnectorType::Web => &["start_url"],
        }
    }
}

/// Connector is a persisted third-party integration config, one row per
/// case-insensitively unique name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    pub fn normalized_name(&self) -> String {
        normalize_key(&self.name)
    }
}

// ============================================================================
// Job definitions
// ============================================================================

/// Workflow category of a definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobDefinitionType {
    #[default]
    Crawler,
    Summarizer,
    Maintenance,
    Custom,
}

impl fmt::Display for JobDefinitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobDefinitionType::Crawler => write!(f, "crawler"),
            JobDefinitionType::Summarizer => write!(f, "summarizer"),
            JobDefinitionType::Maintenance => write!(f, "maintenance"),
            JobDefinitionType::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for JobDefinitionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawler" => Ok(JobDefinitionType::Crawler),
            "summarizer" => Ok(JobDefinitionType::Summarizer),
            "maintenance" => Ok(JobDefinitionType::Maintenance),
            "custom" => Ok(JobDefinitionType::Custom),
            _ => Err(format!("Invalid job definition type: {}", s)),
        }
    }
}

impl TryFrom<String> for JobDefinitionType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Who owns a definition. `system` definitions are read-only through user
/// APIs and are re-seeded at startup with DO NOTHING semantics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobOwner {
    System,
    #[default]
    User,
}

impl fmt::Display for JobOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOwner::System => write!(f, "system"),
            JobOwner::User => write!(f, "user"),
        }
    }
}

impl FromStr for JobOwner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(JobOwner::System),
            "" | "user" => Ok(JobOwner::User),
            _ => Err(format!("Invalid job owner: {}", s)),
        }
    }
}

impl TryFrom<String> for JobOwner {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Per-step error policy.
///
/// Accepted in TOML either as a bare string (`on_error = "continue"`) or as
/// a retry table (`on_error = { retry = { attempts = 3, backoff_seconds = 10 } }`).
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorPolicy {
    #[default]
    Fail,
    Continue,
    Retry {
        attempts: u32,
        backoff_seconds: u64,
    },
}

impl<'de> Deserialize<'de> for StepErrorPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RetrySpec {
            attempts: u32,
            #[serde(default = "default_retry_backoff")]
            backoff_seconds: u64,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Retry { retry: RetrySpec },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(s) => match s.as_str() {
                "fail" => Ok(StepErrorPolicy::Fail),
                "continue" => Ok(StepErrorPolicy::Continue),
                other => Err(serde::de::Error::custom(format!(
                    "invalid on_error policy: {}",
                    other
                ))),
            },
            Repr::Retry { retry } => Ok(StepErrorPolicy::Retry {
                attempts: retry.attempts,
                backoff_seconds: retry.backoff_seconds,
            }),
        }
    }
}

fn default_retry_backoff() -> u64 {
    5
}

/// JobStep is one element of a definition's workflow. `action` is a key into
/// the action registry; the engine treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub on_error: StepErrorPolicy,
}

/// Definition-level failure threshold, evaluated after each step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorTolerance {
    /// Fail the job once `failed_urls / total_urls` exceeds this ratio.
    pub max_failure_ratio: f64,
}

/// JobDefinition is a reusable workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub def_type: JobDefinitionType,
    #[serde(default)]
    pub job_type: JobOwner,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth_id: Option<Uuid>,
    pub steps: Vec<JobStep>,
    /// Standard 5-field cron expression; empty = manual-only.
    #[serde(default)]
    pub schedule: String,
    /// Duration string (`30m`, `1h15m`); empty = no job timeout.
    #[serde(default)]
    pub timeout: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub pre_jobs: Vec<String>,
    #[serde(default)]
    pub post_jobs: Vec<String>,
    #[serde(default)]
    pub error_tolerance: Option<ErrorTolerance>,
    /// Raw source text of the file section this definition was loaded from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_source: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl JobDefinition {
    /// Parsed job timeout, if configured.
    pub fn timeout_duration(&self) -> Result<Option<Duration>, String> {
        if self.timeout.trim().is_empty() {
            return Ok(None);
        }
        crate::schedule::parse_duration(&self.timeout)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Whether the scheduler should ever dispatch this definition on its own.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && (!self.schedule.trim().is_empty() || self.auto_start)
    }
}

// ============================================================================
// Job instances
// ============================================================================

/// Lifecycle of a single execution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses must carry `completed_at`; non-terminal must not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Aggregated crawl/step counters stored as a JSON column on the instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_urls: u64,
    pub completed_urls: u64,
    pub failed_urls: u64,
    pub pending_urls: u64,
    pub percentage: f64,
}

impl JobProgress {
    /// Recompute `percentage` as `(completed + failed) / total * 100`.
    pub fn recompute_percentage(&mut self) {
        if self.total_urls == 0 {
            self.percentage = 0.0;
        } else {
            self.percentage =
                (self.completed_urls + self.failed_urls) as f64 / self.total_urls as f64 * 100.0;
        }
    }
}

/// JobInstance is a single execution attempt of a definition, persisted in
/// the `jobs` table.
///
/// The scheduler creates instances; the executor is the only component that
/// mutates `status`, `progress`, heartbeats, counters, and the terminal
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Definition this run was instantiated from. Provenance only; carries
    /// no FK so definition deletion leaves history intact.
    pub definition_id: Option<String>,
    pub job_type: String,
    pub name: String,
    pub description: String,
    pub source_type: String,
    pub entity_type: String,
    pub config: Map<String, Value>,
    /// Definition config captured at creation; later edits to the definition
    /// do not perturb this run.
    pub source_config_snapshot: Value,
    /// Resolved credential captured at creation, if the definition had one.
    pub auth_snapshot: Option<Value>,
    pub refresh_source: bool,
    pub seed_urls: Vec<String>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_count: i64,
    pub failed_count: i64,
    pub depth: i64,
}

impl JobInstance {
    /// Instantiate a pending run from a definition, snapshotting its config
    /// and the resolved credential.
    pub fn from_definition(definition: &JobDefinition, auth: Option<&AuthCredential>) -> Self {
        let seed_urls = seed_urls_from_config(&definition.config)
            .or_else(|| {
                definition
                    .steps
                    .iter()
                    .find_map(|s| seed_urls_from_config(&s.config))
            })
            .unwrap_or_default();

        let refresh_source = definition
            .config
            .get("refresh_source")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            definition_id: Some(definition.id.clone()),
            job_type: definition.def_type.to_string(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            source_type: definition.source_type.clone(),
            entity_type: String::new(),
            config: definition.config.clone(),
            source_config_snapshot: Value::Object(definition.config.clone()),
            auth_snapshot: auth.map(|a| serde_json::to_value(a).unwrap_or(Value::Null)),
            refresh_source,
            seed_urls,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            finished_at: None,
            last_heartbeat: None,
            error: None,
            result_count: 0,
            failed_count: 0,
            depth: 0,
        }
    }
}

fn seed_urls_from_config(config: &Map<String, Value>) -> Option<Vec<String>> {
    let list = config
        .get("seed_urls")
        .or_else(|| config.get("start_urls"))?
        .as_array()?;
    Some(
        list.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

// ============================================================================
// Job logs
// ============================================================================

/// One log line attached to a run; unbounded, removed with the run (CASCADE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Documents
// ============================================================================

/// How much of the source a document row carries. `full` dominates
/// `summary` during upsert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    #[default]
    Full,
    Summary,
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailLevel::Full => write!(f, "full"),
            DetailLevel::Summary => write!(f, "summary"),
        }
    }
}

impl FromStr for DetailLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "full" => Ok(DetailLevel::Full),
            "summary" => Ok(DetailLevel::Summary),
            _ => Err(format!("Invalid detail level: {}", s)),
        }
    }
}

impl TryFrom<String> for DetailLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Normalized content row. Natural key is `(source_type, source_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub source_type: String,
    pub source_id: String,
    pub title: String,
    pub content_markdown: String,
    pub detail_level: DetailLevel,
    pub metadata: Value,
    pub url: String,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_type: source_type.into(),
            source_id: source_id.into(),
            title: String::new(),
            content_markdown: String::new(),
            detail_level: DetailLevel::Full,
            metadata: Value::Object(Map::new()),
            url: String::new(),
            synced: false,
            created_at: now,
            updated_at: now,
        }
    }
}
