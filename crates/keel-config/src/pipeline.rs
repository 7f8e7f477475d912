//! Pipeline compilation from KDL.
//!
//! ```kdl
//! pipeline "hello-world"
//! route "gpu"
//! secret "DOCKER_PASSWORD" key="octocat/hello-world/docker_password" scope="repo"
//! env {
//!     GOOS "linux"
//! }
//! step "test" {
//!     image "golang:1.22"
//!     run "go test ./..."
//! }
//! ```

use crate::nodes::{get_first_string_arg, get_string_map, get_string_prop};
use crate::{ConfigError, ConfigResult};
use keel_core::pipeline::{CompiledPipeline, Compiler, Step};
use keel_core::secret::{SecretRef, SecretScope};
use kdl::{KdlDocument, KdlNode};
use std::collections::{HashMap, HashSet};

/// Compiler for KDL pipeline definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct KdlCompiler;

impl KdlCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for KdlCompiler {
    fn name(&self) -> &'static str {
        "kdl"
    }

    fn compile(&self, raw: &str) -> keel_core::Result<CompiledPipeline> {
        Ok(parse_pipeline(raw)?)
    }
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<CompiledPipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut route = None;
    let mut secrets = Vec::new();
    let mut steps = Vec::new();
    let mut env = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "route" => {
                let value = get_first_string_arg(node)
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "route".to_string(),
                        message: "expected a non-empty route name".to_string(),
                    })?;
                route = Some(value);
            }
            "secret" => {
                secrets.push(parse_secret(node)?);
            }
            "step" => {
                steps.push(parse_step(node)?);
            }
            "env" => {
                env.extend(get_string_map(node));
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "at least one step in pipeline '{}'",
            name
        )));
    }

    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
        }
    }

    let mut seen = HashSet::new();
    for secret in &secrets {
        if !seen.insert(secret.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("secret '{}'", secret.name)));
        }
    }

    Ok(CompiledPipeline {
        name,
        route,
        secrets,
        env,
        steps,
    })
}

fn parse_secret(node: &KdlNode) -> ConfigResult<SecretRef> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("secret name".to_string()))?;

    let key = get_string_prop(node, "key").unwrap_or_else(|| name.clone());
    let scope = match get_string_prop(node, "scope") {
        Some(scope) => scope
            .parse::<SecretScope>()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("scope of secret '{}'", name),
                message: e.to_string(),
            })?,
        None => SecretScope::Repo,
    };

    Ok(SecretRef { name, key, scope })
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut image = String::new();
    let mut commands = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "env" => {
                    env.extend(get_string_map(child));
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for step '{}'",
            name
        )));
    }

    Ok(Step {
        name,
        image,
        commands,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let kdl = r#"
            pipeline "test-pipeline"

            step "build" {
                image "rust:1.85"
                run "cargo build"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.name, "test-pipeline");
        assert_eq!(pipeline.route, None);
        assert_eq!(pipeline.steps.len(), 1);
        assert_eq!(pipeline.steps[0].commands, vec!["cargo build"]);
    }

    #[test]
    fn test_parse_route_secrets_and_env() {
        let kdl = r#"
            pipeline "gpu-train"
            route "gpu"
            secret "DOCKER_PASSWORD" key="octocat/hello/docker_password" scope="org"
            secret "TOKEN"
            env {
                TAG "build-${build.number}"
            }

            step "train" {
                image "pytorch:latest"
                run "python train.py"
                env {
                    EPOCHS "10"
                }
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.route.as_deref(), Some("gpu"));
        assert_eq!(
            pipeline.secrets,
            vec![
                SecretRef::new(
                    "DOCKER_PASSWORD",
                    "octocat/hello/docker_password",
                    SecretScope::Org
                ),
                SecretRef::new("TOKEN", "TOKEN", SecretScope::Repo),
            ]
        );
        assert_eq!(pipeline.env["TAG"], "build-${build.number}");
        assert_eq!(pipeline.steps[0].env["EPOCHS"], "10");
    }

    #[test]
    fn test_missing_image() {
        let kdl = r#"
            pipeline "no-image"

            step "build" {
                run "make"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_duplicate_steps() {
        let kdl = r#"
            pipeline "dupes"

            step "build" {
                image "alpine"
            }

            step "build" {
                image "alpine"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_unknown_secret_scope() {
        let kdl = r#"
            pipeline "bad-scope"
            secret "X" scope="global"

            step "build" {
                image "alpine"
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_compiler_maps_errors_to_invalid_argument() {
        let err = KdlCompiler::new().compile("step \"x\" {").unwrap_err();
        assert!(matches!(err, keel_core::Error::InvalidArgument(_)));
    }
}
