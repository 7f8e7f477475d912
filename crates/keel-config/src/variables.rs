//! Variable interpolation for the build runtime environment.
//!
//! Supports variables like:
//! - `${build.id}` - Build surrogate id
//! - `${build.number}` - Per-repository build number
//! - `${build.event}` - Triggering event
//! - `${build.branch}` - Branch name (empty for tags and schedules)
//! - `${build.route}` - Worker route the build was dispatched on
//! - `${repo.id}` - Owning repository id
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Resolved secret value
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use keel_core::Build;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Build-related variables
    pub build: BuildContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Secrets (will be masked in logs)
    pub secrets: HashMap<String, String>,
}

/// Build context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub id: String,
    pub repo_id: String,
    pub number: i64,
    pub event: String,
    pub branch: String,
    pub route: String,
}

impl BuildContext {
    pub fn from_build(build: &Build) -> Self {
        Self {
            id: build.id.to_string(),
            repo_id: build.repo_id.to_string(),
            number: build.number,
            event: build.event.to_string(),
            branch: build.branch.clone(),
            route: build.route.clone(),
        }
    }
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variables every dispatched build receives.
    pub fn build_env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("BUILD_ID".to_string(), self.build.id.clone()),
            ("BUILD_NUMBER".to_string(), self.build.number.to_string()),
            ("BUILD_EVENT".to_string(), self.build.event.clone()),
            ("BUILD_BRANCH".to_string(), self.build.branch.clone()),
            ("BUILD_ROUTE".to_string(), self.build.route.clone()),
            ("REPO_ID".to_string(), self.build.repo_id.clone()),
        ])
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["build", "id"] => Some(self.build.id.clone()),
            ["build", "number"] => Some(self.build.number.to_string()),
            ["build", "event"] => Some(self.build.event.clone()),
            ["build", "branch"] => Some(self.build.branch.clone()),
            ["build", "route"] => Some(self.build.route.clone()),

            ["repo", "id"] => Some(self.build.repo_id.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left untouched.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a HashMap.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Full runtime environment for a dispatched build: build variables,
    /// the pipeline's interpolated `env`, then the resolved secrets.
    pub fn runtime_env(&self, pipeline_env: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = self.build_env();
        env.extend(self.interpolate_map(pipeline_env));
        env.extend(self.secrets.clone());
        env
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_build(mut self, build: &Build) -> Self {
        self.ctx.build = BuildContext::from_build(build);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.ctx.secrets.extend(secrets);
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
