//! Policy gate.
//!
//! Evaluates an org's policies in ascending priority (creation order as
//! the tie-break) against a build about to run. The first deny stops the
//! build. The same gate implements the image check consulted by
//! containerised executors before pulling.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use chengis_core::policy::{
    ImagePattern, ImagePolicyCheck, PolicyAction, PolicyDenial, PolicyRule, branch_matches,
    evaluate_image_patterns, in_time_window,
};
use chengis_core::{Error, ResourceId, Result};
use chengis_db::PolicyRepo;

/// What the pre-build gate evaluates against.
#[derive(Debug, Clone, Default)]
pub struct PolicyInput<'a> {
    pub branch: Option<&'a str>,
    pub images: Vec<&'a str>,
    pub plugins: Vec<&'a str>,
}

pub struct PolicyGate {
    repo: Arc<PolicyRepo>,
}

impl PolicyGate {
    pub fn new(repo: Arc<PolicyRepo>) -> Self {
        Self { repo }
    }

    /// Run the pre-build gate. `None` means the build may proceed.
    pub async fn evaluate(
        &self,
        org_id: ResourceId,
        input: &PolicyInput<'_>,
    ) -> Result<Option<PolicyDenial>> {
        let records = self
            .repo
            .list_for_org(org_id)
            .await
            .map_err(chengis_core::Error::from)?;
        let mut rules = Vec::with_capacity(records.len());
        for record in &records {
            rules.push((
                ResourceId::from_uuid(record.id),
                record.rule().map_err(chengis_core::Error::from)?,
            ));
        }
        Ok(evaluate_rules(&rules, input))
    }
}

/// Pure evaluation over rules already in priority order.
pub fn evaluate_rules(
    rules: &[(ResourceId, PolicyRule)],
    input: &PolicyInput<'_>,
) -> Option<PolicyDenial> {
    // Docker-image policies: lower priority wins, so only the first one
    // in order applies.
    let image_policy: Option<(&ResourceId, &Vec<ImagePattern>)> =
        rules.iter().find_map(|(id, rule)| match rule {
            PolicyRule::DockerImage { patterns } => Some((id, patterns)),
            _ => None,
        });

    for (policy_id, rule) in rules {
        match rule {
            PolicyRule::BranchRestriction { branches, action } => {
                let Some(branch) = input.branch else { continue };
                let matched = branch_matches(branch, branches);
                match action {
                    PolicyAction::Deny if matched => {
                        return Some(PolicyDenial {
                            policy_id: *policy_id,
                            reason: format!("branch {branch} is denied"),
                        });
                    }
                    PolicyAction::Allow if !matched => {
                        return Some(PolicyDenial {
                            policy_id: *policy_id,
                            reason: format!("branch {branch} is not in the allow list"),
                        });
                    }
                    _ => {}
                }
            }
            PolicyRule::TimeWindow {
                deny_start_minutes,
                deny_end_minutes,
                utc_offset_minutes,
            } => {
                if in_time_window(
                    Utc::now(),
                    *deny_start_minutes,
                    *deny_end_minutes,
                    *utc_offset_minutes,
                ) {
                    return Some(PolicyDenial {
                        policy_id: *policy_id,
                        reason: "builds are denied in the current time window".into(),
                    });
                }
            }
            PolicyRule::PluginTrust { .. } | PolicyRule::DockerImage { .. } => {
                // Handled below from the aggregate views.
            }
        }
    }

    // Docker images: allowed by default only when no image policy exists
    // for the org.
    if let Some((policy_id, patterns)) = image_policy {
        for image in &input.images {
            if evaluate_image_patterns(image, patterns) == PolicyAction::Deny {
                return Some(PolicyDenial {
                    policy_id: *policy_id,
                    reason: format!("image {image} is not permitted"),
                });
            }
        }
    }

    // Plugins load only with an explicit allowed=true rule.
    for plugin in &input.plugins {
        let allowed = rules.iter().any(|(_, rule)| {
            matches!(rule, PolicyRule::PluginTrust { plugin: p, allowed: true } if p == plugin)
        });
        if !allowed {
            let policy_id = rules
                .iter()
                .find_map(|(id, rule)| match rule {
                    PolicyRule::PluginTrust { plugin: p, .. } if p == plugin => Some(*id),
                    _ => None,
                })
                .unwrap_or_default();
            return Some(PolicyDenial {
                policy_id,
                reason: format!("plugin {plugin} is not trusted"),
            });
        }
    }

    None
}

#[async_trait]
impl ImagePolicyCheck for PolicyGate {
    async fn allow_image(&self, org_id: ResourceId, image: &str) -> Result<()> {
        let input = PolicyInput {
            branch: None,
            images: vec![image],
            plugins: vec![],
        };
        match self.evaluate(org_id, &input).await? {
            Some(denial) => Err(Error::PolicyDenied {
                policy_id: denial.policy_id.to_string(),
                reason: denial.reason,
            }),
            None => Ok(()),
        }
    }
}
