//! Label taxonomy and naming

use std::collections::BTreeMap;

use super::{CompilationContext, ComponentIdentity, ComponentKind};
use crate::{
    LABEL_COMPONENT_NAME, LABEL_COMPONENT_TYPE, LABEL_JOB_ID, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_TRELLIS, LABEL_SERVING_ID, LABEL_TASK_NAME,
};

pub(crate) const MAX_DNS_LABEL: usize = 63;

/// Lower-case, replace invalid characters with `-`, trim to 63 characters
pub fn sanitize_dns_label(raw: &str) -> String {
    bounded_dns_label(raw, MAX_DNS_LABEL)
}

/// [`sanitize_dns_label`] with a tighter length bound
pub(crate) fn bounded_dns_label(raw: &str, max: usize) -> String {
    let mut out: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    out.truncate(max.min(MAX_DNS_LABEL));
    out.trim_matches('-').to_string()
}

/// Environment variable prefix for a resource or volume name
pub(crate) fn env_prefix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Labels that select this component's pods across builds
///
/// The job id is left out: selectors of deployments are immutable and live
/// replicas of an older build must still be found to be replaced.
pub(crate) fn selector_labels(
    ctx: &CompilationContext<'_>,
    id: &ComponentIdentity<'_>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT_NAME.to_string(), id.object_name(ctx)),
        (
            LABEL_COMPONENT_TYPE.to_string(),
            id.kind.as_str().to_string(),
        ),
    ])
}

/// Full label set stamped on every object of a component
pub(crate) fn component_labels(
    ctx: &CompilationContext<'_>,
    id: &ComponentIdentity<'_>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = ctx.app_labels.clone();
    labels.extend(extra.clone());
    labels.extend(selector_labels(ctx, id));
    labels.insert(
        LABEL_JOB_ID.to_string(),
        sanitize_label_value(&ctx.config.build_id),
    );
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_TRELLIS.to_string(),
    );
    if let Some(task) = id.task {
        labels.insert(LABEL_TASK_NAME.to_string(), sanitize_label_value(task));
    }
    if id.kind == ComponentKind::Serving {
        labels.insert(LABEL_SERVING_ID.to_string(), id.object_name(ctx));
    }
    labels
}

fn sanitize_label_value(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(MAX_DNS_LABEL);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
