//! Pipeline, stage and step definitions.
//!
//! This is the internal pipeline data model that parsers normalise into.
//! Steps are tagged variants rather than loose maps; validation happens
//! once at the parse boundary and downstream code operates on the typed
//! model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::policy::branch_matches;
use crate::{Error, Result};

/// A CI/CD pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "my-service").
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Parameter defaults; triggers may override individual values.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Triggers that can start a build of this pipeline.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Source repository to check out before running stages.
    pub source: Option<SourceSpec>,
    /// Ordered stages.
    pub stages: Vec<Stage>,
    /// Steps to run after the stage phase completes.
    #[serde(default)]
    pub post_actions: PostActions,
    /// Artifact glob patterns, relative to the workspace.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Notifier dispatch specs invoked at finalization.
    #[serde(default)]
    pub notify: Vec<NotifySpec>,
    /// Default container applied to steps that do not declare their own.
    pub container: Option<ContainerSpec>,
    /// Pipeline-level environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Labels an agent must advertise to run builds of this pipeline.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Name of a template this pipeline extends.
    pub extends: Option<String>,
}

/// Source repository specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub branch: Option<String>,
    /// Depth for shallow clone (None for full clone).
    pub depth: Option<u32>,
}

/// What triggers a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    /// Triggered on push to matching branches.
    Push { branches: Vec<String> },
    /// Triggered on a fixed interval.
    Schedule { interval_seconds: u64 },
    /// Triggered when another job's build completes successfully.
    Dependency { job: String },
    /// Manual trigger only.
    Manual,
}

/// A stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Run all steps concurrently instead of sequentially.
    #[serde(default)]
    pub parallel: bool,
    /// Conditional execution; a false condition skips the stage.
    pub condition: Option<Condition>,
    /// Container defaults merged into each step of this stage.
    pub container: Option<ContainerSpec>,
    /// Manual approval gate that must resolve before the stage runs.
    pub approval: Option<ApprovalSpec>,
    pub steps: Vec<Step>,
}

/// Manual approval requirement for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub required_role: String,
    /// Users allowed to respond; empty means any user with the role.
    #[serde(default)]
    pub approver_group: Vec<String>,
    pub min_approvals: u32,
    pub timeout_minutes: i64,
}

/// Condition evaluated against the build's branch and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Condition {
    /// True when the build's branch matches the pattern.
    Branch { pattern: String },
    /// True when the named parameter equals the given value.
    Param { name: String, equals: String },
}

impl Condition {
    pub fn evaluate(&self, branch: Option<&str>, parameters: &HashMap<String, String>) -> bool {
        match self {
            Condition::Branch { pattern } => match branch {
                Some(b) => branch_matches(b, std::slice::from_ref(pattern)),
                None => false,
            },
            Condition::Param { name, equals } => {
                parameters.get(name).map(|v| v == equals).unwrap_or(false)
            }
        }
    }
}

/// Image pull policy for containerised steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Container settings shared by containerised steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    pub workdir: Option<String>,
    pub network: Option<String>,
    /// Extra bind mounts in `host:container[:mode]` form.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Fields common to every step kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommon {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory relative to the workspace.
    pub dir: Option<String>,
    /// Per-step timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    pub condition: Option<Condition>,
    /// A failure of this step does not fail a sequential stage.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Secrets the step requires by name; each must resolve.
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// A unit of work that produces an exit code, stdout and stderr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Step {
    Shell(StepCommon),
    Container {
        #[serde(flatten)]
        common: StepCommon,
        container: ContainerSpec,
    },
    Compose {
        #[serde(flatten)]
        common: StepCommon,
        compose_file: String,
        service: String,
    },
}

impl Step {
    /// The registry key used to look up an executor for this step.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Shell(_) => "shell",
            Step::Container { .. } => "container",
            Step::Compose { .. } => "container-compose",
        }
    }

    pub fn common(&self) -> &StepCommon {
        match self {
            Step::Shell(common) => common,
            Step::Container { common, .. } => common,
            Step::Compose { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut StepCommon {
        match self {
            Step::Shell(common) => common,
            Step::Container { common, .. } => common,
            Step::Compose { common, .. } => common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// Image referenced by this step, if containerised.
    pub fn image(&self) -> Option<&str> {
        match self {
            Step::Container { container, .. } => Some(container.image.as_str()),
            _ => None,
        }
    }
}

/// Steps grouped by when they run after the stage phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostActions {
    #[serde(default)]
    pub always: Vec<Step>,
    #[serde(default)]
    pub on_success: Vec<Step>,
    #[serde(default)]
    pub on_failure: Vec<Step>,
}

impl PostActions {
    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

/// Notifier dispatch spec; `kind` selects the implementation from the
/// notifier registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifySpec {
    pub kind: String,
    /// Implementation-specific settings (webhook url, address, channel).
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Pipeline {
    /// Validate a parsed pipeline. Runs once at the parse boundary.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("pipeline name is empty".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::InvalidInput("pipeline has no stages".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.steps.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "stage {} has no steps",
                    stage.name
                )));
            }
            for step in &stage.steps {
                Self::validate_step(&stage.name, step)?;
            }
            if let Some(approval) = &stage.approval {
                if approval.min_approvals == 0 {
                    return Err(Error::InvalidInput(format!(
                        "stage {} approval requires min_approvals >= 1",
                        stage.name
                    )));
                }
            }
        }
        for step in self
            .post_actions
            .always
            .iter()
            .chain(&self.post_actions.on_success)
            .chain(&self.post_actions.on_failure)
        {
            Self::validate_step("post", step)?;
        }
        Ok(())
    }

    fn validate_step(stage: &str, step: &Step) -> Result<()> {
        let common = step.common();
        if common.name.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "stage {stage}: step name is empty"
            )));
        }
        if common.command.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "step {}: command is empty",
                common.name
            )));
        }
        if common.timeout_ms == Some(0) {
            return Err(Error::InvalidInput(format!(
                "step {}: timeout must be positive",
                common.name
            )));
        }
        Ok(())
    }

    /// All container images a build of this pipeline would use, for the
    /// pre-build image policy gate.
    pub fn referenced_images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        if let Some(container) = &self.container {
            images.push(container.image.as_str());
        }
        for stage in &self.stages {
            if let Some(container) = &stage.container {
                images.push(container.image.as_str());
            }
            for step in &stage.steps {
                if let Some(image) = step.image() {
                    images.push(image);
                }
            }
        }
        images.sort_unstable();
        images.dedup();
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_step(name: &str) -> Step {
        Step::Shell(StepCommon {
            name: name.to_string(),
            command: "true".to_string(),
            env: HashMap::new(),
            dir: None,
            timeout_ms: None,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        })
    }

    fn minimal_pipeline() -> Pipeline {
        Pipeline {
            name: "demo".into(),
            description: None,
            parameters: HashMap::new(),
            triggers: vec![],
            source: None,
            stages: vec![Stage {
                name: "build".into(),
                parallel: false,
                condition: None,
                container: None,
                approval: None,
                steps: vec![shell_step("compile")],
            }],
            post_actions: PostActions::default(),
            artifacts: vec![],
            notify: vec![],
            container: None,
            env: HashMap::new(),
            labels: vec![],
            extends: None,
        }
    }

    #[test]
    fn valid_pipeline_passes() {
        assert!(minimal_pipeline().validate().is_ok());
    }

    #[test]
    fn empty_stage_list_rejected() {
        let mut p = minimal_pipeline();
        p.stages.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut p = minimal_pipeline();
        p.stages[0].steps[0].common_mut().timeout_ms = Some(0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let mut p = minimal_pipeline();
        let dup = p.stages[0].clone();
        p.stages.push(dup);
        assert!(p.validate().is_err());
    }

    #[test]
    fn branch_condition_matches_glob() {
        let cond = Condition::Branch {
            pattern: "release/*".into(),
        };
        assert!(cond.evaluate(Some("release/1.2"), &HashMap::new()));
        assert!(!cond.evaluate(Some("main"), &HashMap::new()));
        assert!(!cond.evaluate(None, &HashMap::new()));
    }

    #[test]
    fn param_condition_compares_exactly() {
        let cond = Condition::Param {
            name: "deploy".into(),
            equals: "yes".into(),
        };
        let mut params = HashMap::new();
        assert!(!cond.evaluate(None, &params));
        params.insert("deploy".into(), "yes".into());
        assert!(cond.evaluate(None, &params));
    }

    #[test]
    fn referenced_images_deduplicates() {
        let mut p = minimal_pipeline();
        p.stages[0].steps = vec![
            Step::Container {
                common: shell_step("a").common().clone(),
                container: ContainerSpec {
                    image: "alpine:3".into(),
                    pull_policy: PullPolicy::default(),
                    workdir: None,
                    network: None,
                    volumes: vec![],
                    env: HashMap::new(),
                },
            },
            Step::Container {
                common: shell_step("b").common().clone(),
                container: ContainerSpec {
                    image: "alpine:3".into(),
                    pull_policy: PullPolicy::default(),
                    workdir: None,
                    network: None,
                    volumes: vec![],
                    env: HashMap::new(),
                },
            },
        ];
        assert_eq!(p.referenced_images(), vec!["alpine:3"]);
    }
}
