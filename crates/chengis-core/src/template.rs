//! Template resolution for `extends`.
//!
//! A pipeline may extend a named template, which may itself extend
//! another (at most three hops, cycles detected). Resolution is a pure
//! recursive merge:
//!
//! - stages: a stage whose name matches a base stage replaces it in
//!   place; new stages are appended.
//! - top-level scalar fields: the extension wins where it sets a value.
//! - env and post-actions: merged (base first, extension overlays).
//! - artifacts and notify: unioned.
//!
//! Resolution is idempotent: a resolved pipeline has no `extends` left,
//! so resolving it again returns it unchanged.

use std::collections::{HashMap, HashSet};

use crate::pipeline::{Pipeline, PostActions};
use crate::{Error, Result};

pub const MAX_EXTENDS_DEPTH: usize = 3;

/// Resolve `extends` against a set of templates keyed by name.
pub fn resolve_extends(pipeline: Pipeline, templates: &HashMap<String, Pipeline>) -> Result<Pipeline> {
    let mut visiting = HashSet::new();
    visiting.insert(pipeline.name.clone());
    resolve_inner(pipeline, templates, &mut visiting, 0)
}

fn resolve_inner(
    pipeline: Pipeline,
    templates: &HashMap<String, Pipeline>,
    visiting: &mut HashSet<String>,
    depth: usize,
) -> Result<Pipeline> {
    let Some(template_name) = pipeline.extends.clone() else {
        return Ok(pipeline);
    };
    if depth >= MAX_EXTENDS_DEPTH {
        return Err(Error::InvalidInput(format!(
            "template chain exceeds {MAX_EXTENDS_DEPTH} hops at {template_name}"
        )));
    }
    if !visiting.insert(template_name.clone()) {
        return Err(Error::InvalidInput(format!(
            "template cycle involving {template_name}"
        )));
    }
    let template = templates
        .get(&template_name)
        .ok_or_else(|| Error::NotFound(format!("template {template_name}")))?
        .clone();
    let base = resolve_inner(template, templates, visiting, depth + 1)?;
    Ok(merge(base, pipeline))
}

/// Merge an extension onto its resolved base.
fn merge(base: Pipeline, extension: Pipeline) -> Pipeline {
    let mut stages = base.stages;
    for stage in extension.stages {
        match stages.iter_mut().find(|s| s.name == stage.name) {
            Some(existing) => *existing = stage,
            None => stages.push(stage),
        }
    }

    let mut env = base.env;
    env.extend(extension.env);

    let mut parameters = base.parameters;
    parameters.extend(extension.parameters);

    let mut artifacts = base.artifacts;
    for pattern in extension.artifacts {
        if !artifacts.contains(&pattern) {
            artifacts.push(pattern);
        }
    }

    let mut notify = base.notify;
    for spec in extension.notify {
        if !notify.contains(&spec) {
            notify.push(spec);
        }
    }

    let post_actions = PostActions {
        always: chain(base.post_actions.always, extension.post_actions.always),
        on_success: chain(base.post_actions.on_success, extension.post_actions.on_success),
        on_failure: chain(base.post_actions.on_failure, extension.post_actions.on_failure),
    };

    Pipeline {
        name: extension.name,
        description: extension.description.or(base.description),
        parameters,
        triggers: if extension.triggers.is_empty() {
            base.triggers
        } else {
            extension.triggers
        },
        source: extension.source.or(base.source),
        stages,
        post_actions,
        artifacts,
        notify,
        container: extension.container.or(base.container),
        env,
        labels: if extension.labels.is_empty() {
            base.labels
        } else {
            extension.labels
        },
        extends: None,
    }
}

fn chain<T>(mut base: Vec<T>, extension: Vec<T>) -> Vec<T> {
    base.extend(extension);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, Step, StepCommon};

    fn step(name: &str, command: &str) -> Step {
        Step::Shell(StepCommon {
            name: name.into(),
            command: command.into(),
            env: HashMap::new(),
            dir: None,
            timeout_ms: None,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        })
    }

    fn stage(name: &str, steps: Vec<Step>) -> Stage {
        Stage {
            name: name.into(),
            parallel: false,
            condition: None,
            container: None,
            approval: None,
            steps,
        }
    }

    fn pipeline(name: &str, stages: Vec<Stage>, extends: Option<&str>) -> Pipeline {
        Pipeline {
            name: name.into(),
            description: None,
            parameters: HashMap::new(),
            triggers: vec![],
            source: None,
            stages,
            post_actions: PostActions::default(),
            artifacts: vec![],
            notify: vec![],
            container: None,
            env: HashMap::new(),
            labels: vec![],
            extends: extends.map(String::from),
        }
    }

    fn templates(entries: Vec<Pipeline>) -> HashMap<String, Pipeline> {
        entries.into_iter().map(|p| (p.name.clone(), p)).collect()
    }

    #[test]
    fn replaces_matching_stage_and_appends_new() {
        let t = pipeline(
            "T",
            vec![
                stage("Build", vec![step("compile", "make")]),
                stage("Test", vec![step("unit", "make test")]),
            ],
            None,
        );
        let p = pipeline(
            "P",
            vec![
                stage("Test", vec![step("integration", "make it")]),
                stage("Deploy", vec![step("ship", "make deploy")]),
            ],
            Some("T"),
        );

        let resolved = resolve_extends(p, &templates(vec![t])).unwrap();
        let names: Vec<&str> = resolved.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Build", "Test", "Deploy"]);
        // Test stage came from P, not T.
        assert_eq!(resolved.stages[1].steps[0].name(), "integration");
        assert!(resolved.extends.is_none());
    }

    #[test]
    fn env_merges_extension_wins() {
        let mut t = pipeline("T", vec![stage("S", vec![step("a", "true")])], None);
        t.env.insert("A".into(), "base".into());
        t.env.insert("B".into(), "base".into());
        let mut p = pipeline("P", vec![], Some("T"));
        p.env.insert("B".into(), "ext".into());

        let resolved = resolve_extends(p, &templates(vec![t])).unwrap();
        assert_eq!(resolved.env["A"], "base");
        assert_eq!(resolved.env["B"], "ext");
    }

    #[test]
    fn artifacts_and_notify_union() {
        let mut t = pipeline("T", vec![stage("S", vec![step("a", "true")])], None);
        t.artifacts = vec!["dist/**".into()];
        let mut p = pipeline("P", vec![], Some("T"));
        p.artifacts = vec!["dist/**".into(), "reports/*.xml".into()];

        let resolved = resolve_extends(p, &templates(vec![t])).unwrap();
        assert_eq!(resolved.artifacts, vec!["dist/**", "reports/*.xml"]);
    }

    #[test]
    fn cycle_detected() {
        let mut a = pipeline("A", vec![stage("S", vec![step("x", "true")])], Some("B"));
        a.extends = Some("B".into());
        let b = pipeline("B", vec![stage("S", vec![step("x", "true")])], Some("A"));

        let err = resolve_extends(a, &templates(vec![b])).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn depth_limit_enforced() {
        let p = pipeline("P", vec![], Some("T1"));
        let t1 = pipeline("T1", vec![], Some("T2"));
        let t2 = pipeline("T2", vec![], Some("T3"));
        let t3 = pipeline("T3", vec![], Some("T4"));
        let t4 = pipeline("T4", vec![stage("S", vec![step("x", "true")])], None);

        let err = resolve_extends(p, &templates(vec![t1, t2, t3, t4])).unwrap_err();
        assert!(err.to_string().contains("hops"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let t = pipeline("T", vec![stage("Build", vec![step("compile", "make")])], None);
        let p = pipeline("P", vec![stage("Deploy", vec![step("ship", "go")])], Some("T"));

        let once = resolve_extends(p, &templates(vec![t])).unwrap();
        let twice = resolve_extends(once.clone(), &HashMap::new()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_template_is_an_error() {
        let p = pipeline("P", vec![], Some("nope"));
        assert!(resolve_extends(p, &HashMap::new()).is_err());
    }
}
