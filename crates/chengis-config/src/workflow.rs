//! YAML workflow parsing.
//!
//! Parses `.chengis/workflow.y(a)ml` / `chengis.y(a)ml` files into the
//! internal pipeline model. Workflow files are pure data: deserialization
//! goes straight into typed structs, so YAML tags and anchors resolving
//! to unexpected shapes are rejected, and files over 1 MiB are refused
//! before parsing.

use serde::Deserialize;
use std::collections::HashMap;

use chengis_core::pipeline::{
    ApprovalSpec, Condition, ContainerSpec, NotifySpec, Pipeline, PostActions, PullPolicy,
    SourceSpec, Stage, Step, StepCommon, Trigger,
};

use crate::{ConfigError, ConfigResult};

/// Maximum size of an in-repo workflow file.
pub const MAX_WORKFLOW_BYTES: usize = 1024 * 1024;

/// File names probed for an in-repo workflow, in order.
pub const WORKFLOW_FILE_CANDIDATES: &[&str] = &[
    ".chengis/workflow.yml",
    ".chengis/workflow.yaml",
    "chengis.yml",
    "chengis.yaml",
];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawWorkflow {
    name: String,
    description: Option<String>,
    container: Option<RawContainer>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    parameters: HashMap<String, String>,
    on: Option<RawTriggers>,
    source: Option<RawSource>,
    stages: Vec<RawStage>,
    post: Option<RawPost>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    notify: Vec<RawNotify>,
    #[serde(default)]
    labels: Vec<String>,
    extends: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawTriggers {
    push: Option<RawPush>,
    #[serde(default)]
    schedule: Vec<RawSchedule>,
    #[serde(default)]
    dependency: Vec<String>,
    #[serde(default)]
    manual: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPush {
    #[serde(default)]
    branches: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchedule {
    interval: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    url: String,
    branch: Option<String>,
    depth: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawContainer {
    image: String,
    pull_policy: Option<String>,
    workdir: Option<String>,
    network: Option<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawStage {
    name: String,
    #[serde(default)]
    parallel: bool,
    when: Option<RawCondition>,
    container: Option<RawContainer>,
    approval: Option<RawApproval>,
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawApproval {
    required_role: String,
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default = "default_min_approvals")]
    min_approvals: u32,
    #[serde(default = "default_approval_timeout")]
    timeout_minutes: i64,
}

fn default_min_approvals() -> u32 {
    1
}

fn default_approval_timeout() -> i64 {
    24 * 60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCondition {
    branch: Option<String>,
    param: Option<String>,
    equals: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawStep {
    name: String,
    run: String,
    image: Option<String>,
    container: Option<RawContainer>,
    #[serde(default)]
    env: HashMap<String, String>,
    dir: Option<String>,
    /// Milliseconds.
    timeout: Option<u64>,
    #[serde(default)]
    volumes: Vec<String>,
    workdir: Option<String>,
    network: Option<String>,
    pull_policy: Option<String>,
    when: Option<RawCondition>,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default)]
    secrets: Vec<String>,
    compose_file: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawPost {
    #[serde(default)]
    always: Vec<RawStep>,
    #[serde(default)]
    on_success: Vec<RawStep>,
    #[serde(default)]
    on_failure: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawNotify {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    settings: HashMap<String, String>,
}

/// Parse a workflow file into the internal pipeline model and validate it.
pub fn parse_workflow(text: &str) -> ConfigResult<Pipeline> {
    if text.len() > MAX_WORKFLOW_BYTES {
        return Err(ConfigError::FileTooLarge(text.len(), MAX_WORKFLOW_BYTES));
    }
    let raw: RawWorkflow = serde_yaml::from_str(text)?;
    let pipeline = normalise(raw)?;
    pipeline
        .validate()
        .map_err(|e| ConfigError::InvalidWorkflow(e.to_string()))?;
    Ok(pipeline)
}

fn normalise(raw: RawWorkflow) -> ConfigResult<Pipeline> {
    let mut triggers = Vec::new();
    if let Some(on) = raw.on {
        if let Some(push) = on.push {
            triggers.push(Trigger::Push {
                branches: push.branches,
            });
        }
        for schedule in on.schedule {
            triggers.push(Trigger::Schedule {
                interval_seconds: parse_interval(&schedule.interval)?,
            });
        }
        for job in on.dependency {
            triggers.push(Trigger::Dependency { job });
        }
        if on.manual {
            triggers.push(Trigger::Manual);
        }
    }

    let stages = raw
        .stages
        .into_iter()
        .map(normalise_stage)
        .collect::<ConfigResult<Vec<_>>>()?;

    let post_actions = match raw.post {
        Some(post) => PostActions {
            always: post
                .always
                .into_iter()
                .map(normalise_step)
                .collect::<ConfigResult<Vec<_>>>()?,
            on_success: post
                .on_success
                .into_iter()
                .map(normalise_step)
                .collect::<ConfigResult<Vec<_>>>()?,
            on_failure: post
                .on_failure
                .into_iter()
                .map(normalise_step)
                .collect::<ConfigResult<Vec<_>>>()?,
        },
        None => PostActions::default(),
    };

    Ok(Pipeline {
        name: raw.name,
        description: raw.description,
        parameters: raw.parameters,
        triggers,
        source: raw.source.map(|s| SourceSpec {
            url: s.url,
            branch: s.branch,
            depth: s.depth,
        }),
        stages,
        post_actions,
        artifacts: raw.artifacts,
        notify: raw
            .notify
            .into_iter()
            .map(|n| NotifySpec {
                kind: n.kind,
                settings: n.settings,
            })
            .collect(),
        container: raw.container.map(normalise_container).transpose()?,
        env: raw.env,
        labels: raw.labels,
        extends: raw.extends,
    })
}

fn normalise_stage(raw: RawStage) -> ConfigResult<Stage> {
    Ok(Stage {
        name: raw.name,
        parallel: raw.parallel,
        condition: raw.when.map(normalise_condition).transpose()?,
        container: raw.container.map(normalise_container).transpose()?,
        approval: raw.approval.map(|a| ApprovalSpec {
            required_role: a.required_role,
            approver_group: a.approvers,
            min_approvals: a.min_approvals,
            timeout_minutes: a.timeout_minutes,
        }),
        steps: raw
            .steps
            .into_iter()
            .map(normalise_step)
            .collect::<ConfigResult<Vec<_>>>()?,
    })
}

fn normalise_condition(raw: RawCondition) -> ConfigResult<Condition> {
    match (raw.branch, raw.param, raw.equals) {
        (Some(pattern), None, None) => Ok(Condition::Branch { pattern }),
        (None, Some(name), Some(equals)) => Ok(Condition::Param { name, equals }),
        _ => Err(ConfigError::InvalidWorkflow(
            "a when clause needs either branch or param+equals".into(),
        )),
    }
}

fn normalise_container(raw: RawContainer) -> ConfigResult<ContainerSpec> {
    Ok(ContainerSpec {
        image: raw.image,
        pull_policy: parse_pull_policy(raw.pull_policy.as_deref())?,
        workdir: raw.workdir,
        network: raw.network,
        volumes: raw.volumes,
        env: raw.env,
    })
}

fn normalise_step(raw: RawStep) -> ConfigResult<Step> {
    let common = StepCommon {
        name: raw.name,
        command: raw.run,
        env: raw.env,
        dir: raw.dir,
        timeout_ms: raw.timeout,
        condition: raw.when.map(normalise_condition).transpose()?,
        continue_on_error: raw.continue_on_error,
        secrets: raw.secrets,
    };

    if let Some(compose_file) = raw.compose_file {
        let service = raw.service.ok_or_else(|| {
            ConfigError::MissingField(format!("step {}: service", common.name))
        })?;
        return Ok(Step::Compose {
            common,
            compose_file,
            service,
        });
    }

    // A step with an image (direct or via container) is containerised;
    // otherwise it runs in a shell.
    let container = match (raw.container, raw.image) {
        (Some(c), _) => Some(normalise_container(c)?),
        (None, Some(image)) => Some(ContainerSpec {
            image,
            pull_policy: parse_pull_policy(raw.pull_policy.as_deref())?,
            workdir: raw.workdir,
            network: raw.network,
            volumes: raw.volumes,
            env: HashMap::new(),
        }),
        (None, None) => None,
    };

    Ok(match container {
        Some(container) => Step::Container { common, container },
        None => Step::Shell(common),
    })
}

fn parse_pull_policy(s: Option<&str>) -> ConfigResult<PullPolicy> {
    Ok(match s {
        None => PullPolicy::default(),
        Some("always") => PullPolicy::Always,
        Some("if-not-present") => PullPolicy::IfNotPresent,
        Some("never") => PullPolicy::Never,
        Some(other) => {
            return Err(ConfigError::InvalidWorkflow(format!(
                "unknown pull-policy: {other}"
            )));
        }
    })
}

/// Parse a schedule interval like `90`, `30s`, `15m` or `2h`.
pub fn parse_interval(s: &str) -> ConfigResult<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b's') => (&s[..s.len() - 1], 1),
        Some(b'm') => (&s[..s.len() - 1], 60),
        Some(b'h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidWorkflow(format!("bad interval: {s}")))?;
    if value == 0 {
        return Err(ConfigError::InvalidWorkflow("interval must be positive".into()));
    }
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
name: demo
description: demo pipeline
on:
  push:
    branches: [main, "release/*"]
  schedule:
    - interval: 15m
env:
  RUST_LOG: info
stages:
  - name: Build
    steps:
      - name: Compile
        run: make build
        timeout: 30000
  - name: Test
    parallel: true
    steps:
      - name: Unit
        run: make test
      - name: Lint
        run: make lint
        continue-on-error: true
  - name: Deploy
    when:
      branch: main
    approval:
      required-role: deployer
      approvers: [alice, bob, carol]
      min-approvals: 2
    steps:
      - name: Ship
        run: make deploy
        image: deployer:latest
post:
  always:
    - name: Cleanup
      run: make clean
artifacts:
  - dist/**
notify:
  - type: slack
    webhook-url: https://hooks.example.com/T000
"#;

    #[test]
    fn parses_full_workflow() {
        let p = parse_workflow(BASIC).unwrap();
        assert_eq!(p.name, "demo");
        assert_eq!(p.stages.len(), 3);
        assert!(p.stages[1].parallel);
        assert_eq!(
            p.triggers,
            vec![
                Trigger::Push {
                    branches: vec!["main".into(), "release/*".into()]
                },
                Trigger::Schedule {
                    interval_seconds: 900
                },
            ]
        );
        assert_eq!(p.stages[0].steps[0].common().timeout_ms, Some(30000));
        assert!(p.stages[1].steps[1].common().continue_on_error);
        let approval = p.stages[2].approval.as_ref().unwrap();
        assert_eq!(approval.min_approvals, 2);
        assert_eq!(approval.approver_group.len(), 3);
        assert_eq!(p.post_actions.always.len(), 1);
        assert_eq!(p.notify[0].kind, "slack");
        assert_eq!(
            p.notify[0].settings.get("webhook-url").map(String::as_str),
            Some("https://hooks.example.com/T000")
        );
    }

    #[test]
    fn image_makes_a_container_step() {
        let p = parse_workflow(BASIC).unwrap();
        assert_eq!(p.stages[2].steps[0].kind(), "container");
        assert_eq!(p.stages[0].steps[0].kind(), "shell");
    }

    #[test]
    fn oversized_file_rejected() {
        let big = format!("name: x\nstages: []\n# {}", "y".repeat(MAX_WORKFLOW_BYTES));
        let err = parse_workflow(&big).unwrap_err();
        assert!(matches!(err, ConfigError::FileTooLarge(_, _)));
    }

    #[test]
    fn empty_stages_rejected() {
        let err = parse_workflow("name: x\nstages: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWorkflow(_)));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = parse_workflow("name: x\nbogus: 1\nstages: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn tagged_values_rejected() {
        let text = "name: !!python/object x\nstages: []\n";
        assert!(parse_workflow(text).is_err());
    }

    #[test]
    fn interval_suffixes() {
        assert_eq!(parse_interval("90").unwrap(), 90);
        assert_eq!(parse_interval("30s").unwrap(), 30);
        assert_eq!(parse_interval("15m").unwrap(), 900);
        assert_eq!(parse_interval("2h").unwrap(), 7200);
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn compose_step_requires_service() {
        let text = r#"
name: x
stages:
  - name: S
    steps:
      - name: up
        run: echo
        compose-file: docker-compose.yml
"#;
        let err = parse_workflow(text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }
}
