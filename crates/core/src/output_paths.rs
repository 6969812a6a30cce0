//! Output path resolution from run configuration.
//!
//! Workflows declare where their runs write files either as named templates,
//! as a single legacy pattern, or not at all. In the last case the step
//! configs themselves are scanned for well-known path keys.

use std::collections::HashSet;

use serde_json::Value;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::warn;

use runsync_storage::{OutputLocation, OutputPathSpec};

use crate::template::{substitute, TemplateVars};

/// Identifier keys lifted from step configs into the template variables.
pub const KNOWN_VARIABLES: [&str; 4] = ["workflow_id", "run_uuid", "batch_name", "created_at"];

/// Step-config keys that name an output file when the workflow declares no
/// output paths.
pub const FALLBACK_PATH_KEYS: [&str; 5] = [
    "output_path",
    "aggregated_output_path",
    "detailed_output_path",
    "receipt_path",
    "transformed_file_path",
];

/// Sections of the run config holding per-step configs, newest name first.
const STEP_SECTIONS: [&str; 2] = ["ops", "solids"];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ResolveError {
    #[error("run config is not a JSON object")]
    ConfigNotObject,

    #[error("run config section '{section}' is not an object")]
    MalformedSection { section: String },
}

/// One step's `config` object, with the step's name.
struct StepConfig<'a> {
    step: &'a str,
    config: &'a serde_json::Map<String, Value>,
}

/// Resolve output locations against the current time. Never fails: errors
/// are logged and yield an empty list.
pub fn resolve(run_config: &Value, spec: &OutputPathSpec) -> Vec<OutputLocation> {
    resolve_at(run_config, spec, OffsetDateTime::now_utc())
}

/// Like [`resolve`], with an explicit clock for `created_at`.
pub fn resolve_at(
    run_config: &Value,
    spec: &OutputPathSpec,
    now: OffsetDateTime,
) -> Vec<OutputLocation> {
    match try_resolve_at(run_config, spec, now) {
        Ok(locations) => locations,
        Err(e) => {
            warn!(error = %e, "output path resolution failed; recording no locations");
            Vec::new()
        }
    }
}

/// Resolve output locations, reporting malformed run configs as errors.
pub fn try_resolve_at(
    run_config: &Value,
    spec: &OutputPathSpec,
    now: OffsetDateTime,
) -> Result<Vec<OutputLocation>, ResolveError> {
    let steps = step_configs(run_config)?;
    let vars = template_vars(run_config, &steps, now);

    let locations = match spec {
        OutputPathSpec::Templates { templates } => templates
            .iter()
            .map(|t| OutputLocation {
                path: path_string(substitute(&t.path_template, &vars)),
                name: Some(t.name.clone()),
                description: t.description.clone(),
            })
            .collect(),
        OutputPathSpec::Pattern { pattern } => vec![OutputLocation {
            path: path_string(substitute(&Value::String(pattern.clone()), &vars)),
            name: None,
            description: None,
        }],
        OutputPathSpec::Absent => scan_step_paths(&steps, &vars),
    };
    Ok(locations)
}

/// Collect template variables from every step config.
///
/// Known identifier keys and `template_vars` entries are taken in step
/// order; the first occurrence of a name wins. A `template_vars` object at
/// the root of the run config fills names no step provided. `created_at`
/// falls back to `now` as `YYYYMMDD_HHMMSS`.
pub fn extract_template_vars(
    run_config: &Value,
    now: OffsetDateTime,
) -> Result<TemplateVars, ResolveError> {
    Ok(template_vars(run_config, &step_configs(run_config)?, now))
}

fn template_vars(
    run_config: &Value,
    steps: &[StepConfig<'_>],
    now: OffsetDateTime,
) -> TemplateVars {
    let mut vars = TemplateVars::new();
    for step in steps {
        for key in KNOWN_VARIABLES {
            if let Some(value) = step.config.get(key) {
                if !value.is_null() && !vars.contains_key(key) {
                    vars.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(Value::Object(extra)) = step.config.get("template_vars") {
            merge_missing(&mut vars, extra);
        }
    }
    if let Some(Value::Object(run_level)) = run_config.get("template_vars") {
        merge_missing(&mut vars, run_level);
    }

    if !vars.contains_key("created_at") {
        let format = format_description!("[year][month][day]_[hour][minute][second]");
        if let Ok(stamp) = now.format(format) {
            vars.insert("created_at".to_string(), Value::String(stamp));
        }
    }
    vars
}

fn merge_missing(vars: &mut TemplateVars, extra: &TemplateVars) {
    for (key, value) in extra {
        if !vars.contains_key(key) {
            vars.insert(key.clone(), value.clone());
        }
    }
}

fn step_configs(run_config: &Value) -> Result<Vec<StepConfig<'_>>, ResolveError> {
    let root = run_config.as_object().ok_or(ResolveError::ConfigNotObject)?;

    let mut steps = Vec::new();
    for section in STEP_SECTIONS {
        let Some(value) = root.get(section) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let entries = value
            .as_object()
            .ok_or_else(|| ResolveError::MalformedSection {
                section: section.to_string(),
            })?;
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        for name in names {
            if let Some(Value::Object(config)) = entries.get(name).and_then(|s| s.get("config")) {
                steps.push(StepConfig { step: name, config });
            }
        }
    }
    Ok(steps)
}

fn scan_step_paths(steps: &[StepConfig<'_>], vars: &TemplateVars) -> Vec<OutputLocation> {
    let mut seen = HashSet::new();
    let mut locations = Vec::new();
    for step in steps {
        for key in FALLBACK_PATH_KEYS {
            let Some(raw) = step.config.get(key) else {
                continue;
            };
            if raw.is_null() || raw.as_str().is_some_and(|s| s.trim().is_empty()) {
                continue;
            }
            let path = path_string(substitute(raw, vars));
            if !seen.insert(path.clone()) {
                continue;
            }
            let label = key.strip_suffix("_path").unwrap_or(key);
            locations.push(OutputLocation {
                path,
                name: Some(title_case(label)),
                description: Some(format!(
                    "{} written by step '{}'",
                    sentence_case(label),
                    step.step
                )),
            });
        }
    }
    locations
}

/// Resolved path as text: strings raw, anything else as compact JSON.
fn path_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn title_case(label: &str) -> String {
    label
        .split('_')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn sentence_case(label: &str) -> String {
    capitalize(&label.replace('_', " "))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_storage::OutputTemplate;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-05 14:07:09 UTC);

    #[test]
    fn fallback_scan_substitutes_template_vars() {
        let config = json!({
            "ops": {"save": {"config": {
                "output_path": "out/{workflow_id}.json",
                "template_vars": {"workflow_id": 7},
            }}}
        });
        let locations = try_resolve_at(&config, &OutputPathSpec::Absent, NOW).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].path, "out/7.json");
        assert_eq!(locations[0].name.as_deref(), Some("Output"));
        assert_eq!(
            locations[0].description.as_deref(),
            Some("Output written by step 'save'")
        );
    }

    #[test]
    fn fallback_names_and_dedupes_in_step_order() {
        let config = json!({
            "ops": {
                "zeta": {"config": {"receipt_path": "r/{batch_name}.txt"}},
                "save": {"config": {
                    "batch_name": "b1",
                    "aggregated_output_path": "agg/{batch_name}.csv",
                    "receipt_path": "r/{batch_name}.txt",
                }},
            }
        });
        let locations = try_resolve_at(&config, &OutputPathSpec::Absent, NOW).unwrap();
        let paths: Vec<&str> = locations.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, ["agg/b1.csv", "r/b1.txt"]);
        assert_eq!(locations[0].name.as_deref(), Some("Aggregated Output"));
        assert_eq!(
            locations[0].description.as_deref(),
            Some("Aggregated output written by step 'save'")
        );
        assert_eq!(
            locations[1].description.as_deref(),
            Some("Receipt written by step 'save'")
        );
    }

    #[test]
    fn first_occurrence_of_a_variable_wins() {
        let config = json!({
            "ops": {
                "a": {"config": {"batch_name": "first", "template_vars": {"batch_name": "tv"}}},
                "b": {"config": {"batch_name": "second"}},
            }
        });
        let vars = extract_template_vars(&config, NOW).unwrap();
        assert_eq!(vars["batch_name"], json!("first"));
    }

    #[test]
    fn run_level_template_vars_fill_gaps() {
        let config = json!({
            "template_vars": {"batch_name": "run-level", "region": "eu"},
            "ops": {"save": {"config": {
                "batch_name": "step-level",
                "output_path": "out/{region}/{batch_name}.csv",
            }}}
        });
        let vars = extract_template_vars(&config, NOW).unwrap();
        assert_eq!(vars["batch_name"], json!("step-level"));
        assert_eq!(vars["region"], json!("eu"));

        let locations = try_resolve_at(&config, &OutputPathSpec::Absent, NOW).unwrap();
        assert_eq!(locations[0].path, "out/eu/step-level.csv");

        let pattern = OutputPathSpec::Pattern {
            pattern: "p/{region}.json".into(),
        };
        let only_run_level = json!({"template_vars": {"region": "us"}});
        let locations = try_resolve_at(&only_run_level, &pattern, NOW).unwrap();
        assert_eq!(locations[0].path, "p/us.json");
    }

    #[test]
    fn created_at_falls_back_to_clock() {
        let vars = extract_template_vars(&json!({}), NOW).unwrap();
        assert_eq!(vars["created_at"], json!("20240305_140709"));

        let config = json!({"ops": {"a": {"config": {"created_at": "given"}}}});
        let vars = extract_template_vars(&config, NOW).unwrap();
        assert_eq!(vars["created_at"], json!("given"));
    }

    #[test]
    fn legacy_solids_section_is_read() {
        let config = json!({"solids": {"old": {"config": {"run_uuid": "u-1"}}}});
        let spec = OutputPathSpec::Pattern {
            pattern: "legacy/{run_uuid}/{created_at}".into(),
        };
        let locations = try_resolve_at(&config, &spec, NOW).unwrap();
        assert_eq!(locations[0].path, "legacy/u-1/20240305_140709");
        assert_eq!(locations[0].name, None);
    }

    #[test]
    fn named_templates_keep_names_and_render_structured_results() {
        let config = json!({"ops": {"s": {"config": {"workflow_id": 7, "batch_name": "b"}}}});
        let spec = OutputPathSpec::Templates {
            templates: vec![
                OutputTemplate {
                    name: "report".into(),
                    path_template: json!("reports/{batch_name}.csv"),
                    description: Some("Daily report".into()),
                },
                OutputTemplate {
                    name: "manifest".into(),
                    path_template: json!({"bucket": "b", "key": "{workflow_id}"}),
                    description: None,
                },
            ],
        };
        let locations = try_resolve_at(&config, &spec, NOW).unwrap();
        assert_eq!(locations[0].path, "reports/b.csv");
        assert_eq!(locations[0].name.as_deref(), Some("report"));
        assert_eq!(locations[1].path, r#"{"bucket":"b","key":7}"#);
    }

    #[test]
    fn malformed_configs_error_but_resolve_returns_empty() {
        assert_eq!(
            try_resolve_at(&json!([1, 2]), &OutputPathSpec::Absent, NOW),
            Err(ResolveError::ConfigNotObject)
        );
        assert_eq!(
            try_resolve_at(&json!({"ops": "nope"}), &OutputPathSpec::Absent, NOW),
            Err(ResolveError::MalformedSection {
                section: "ops".into()
            })
        );
        assert!(resolve_at(&json!("text"), &OutputPathSpec::Absent, NOW).is_empty());
    }

    #[test]
    fn resolution_is_deterministic_for_fixed_clock() {
        let config = json!({"ops": {"save": {"config": {"output_path": "o/{created_at}"}}}});
        let a = resolve_at(&config, &OutputPathSpec::Absent, NOW);
        let b = resolve_at(&config, &OutputPathSpec::Absent, NOW);
        assert_eq!(a, b);
    }
}
