//! Placeholder interpolation for stage inputs.
//!
//! Two syntaxes are accepted: `${...}` and the older `{{...}}`. Unresolved
//! references never fail a render; they are replaced by a bracketed marker so
//! a broken template is visible in the stage input.
//!
//! | placeholder | resolves to |
//! |---|---|
//! | `${stages.<id>.output}`, `{{context.stageResults.<id>.output}}` | stage output |
//! | `${context.sharedState.<key>}` | shared state value |
//! | `${context.metadata.<key>}` | run metadata value |
//! | `${context.allOutputs}`, `${context.successfulOutputs}` | concatenated outputs |
//! | `${pipeline.name}`, `${pipeline.id}` | run identity |
//! | `${env.<VAR>}` | process environment |
//! | `${item}` | current MAP item |

use conductor_types::ContextSnapshot;

/// Shared-state key holding the current MAP item.
pub const ITEM_KEY: &str = "item";
/// Shared-state key holding the current MAP item index.
pub const ITEM_INDEX_KEY: &str = "itemIndex";

enum Resolution {
    Value(String),
    Missing(String),
    Unknown,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Dollar,
    Braces,
}

/// Render `template` against `ctx`.
pub fn interpolate(template: &str, ctx: &ContextSnapshot) -> String {
    let mut out = String::with_capacity(template.len());
    for_each_placeholder(template, |piece| match piece {
        Piece::Text(text) => out.push_str(text),
        Piece::Placeholder { raw, expr, syntax } => match resolve(expr, ctx) {
            Resolution::Value(v) | Resolution::Missing(v) => out.push_str(&v),
            Resolution::Unknown if syntax == Syntax::Dollar => {
                out.push_str(&format!("[unknown placeholder: {expr}]"));
            }
            Resolution::Unknown => out.push_str(raw),
        },
    });
    out
}

/// List the placeholders of `template` that would not resolve against `ctx`.
pub fn validate_template(template: &str, ctx: &ContextSnapshot) -> Vec<String> {
    let mut problems = Vec::new();
    for_each_placeholder(template, |piece| {
        if let Piece::Placeholder { expr, syntax, .. } = piece {
            match resolve(expr, ctx) {
                Resolution::Value(_) => {}
                Resolution::Missing(marker) => problems.push(marker),
                Resolution::Unknown if syntax == Syntax::Dollar => {
                    problems.push(format!("[unknown placeholder: {expr}]"));
                }
                Resolution::Unknown => {}
            }
        }
    });
    problems
}

/// Stage ids referenced through `${stages.<id>.output}` or the older form.
pub fn referenced_stages(template: &str) -> Vec<String> {
    let mut stages = Vec::new();
    for_each_placeholder(template, |piece| {
        if let Piece::Placeholder { expr, .. } = piece {
            if let Some(id) = stage_output_ref(expr) {
                if !stages.iter().any(|s| s == id) {
                    stages.push(id.to_string());
                }
            }
        }
    });
    stages
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

enum Piece<'a> {
    Text(&'a str),
    Placeholder {
        raw: &'a str,
        expr: &'a str,
        syntax: Syntax,
    },
}

fn for_each_placeholder<'a>(template: &'a str, mut f: impl FnMut(Piece<'a>)) {
    let mut rest = template;
    loop {
        let dollar = rest.find("${").map(|i| (i, Syntax::Dollar));
        let braces = rest.find("{{").map(|i| (i, Syntax::Braces));
        let next = match (dollar, braces) {
            (Some(d), Some(b)) => Some(if d.0 <= b.0 { d } else { b }),
            (d, b) => d.or(b),
        };
        let Some((start, syntax)) = next else {
            break;
        };
        let (open, close) = match syntax {
            Syntax::Dollar => ("${", "}"),
            Syntax::Braces => ("{{", "}}"),
        };
        let body_start = start + open.len();
        let Some(body_len) = rest[body_start..].find(close) else {
            break;
        };
        let end = body_start + body_len + close.len();

        if start > 0 {
            f(Piece::Text(&rest[..start]));
        }
        f(Piece::Placeholder {
            raw: &rest[start..end],
            expr: rest[body_start..body_start + body_len].trim(),
            syntax,
        });
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        f(Piece::Text(rest));
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn stage_output_ref(expr: &str) -> Option<&str> {
    expr.strip_prefix("stages.")
        .or_else(|| expr.strip_prefix("context.stageResults."))
        .and_then(|rest| rest.strip_suffix(".output"))
        .filter(|id| !id.is_empty())
}

fn resolve(expr: &str, ctx: &ContextSnapshot) -> Resolution {
    if let Some(id) = stage_output_ref(expr) {
        return match ctx.stage_output(id) {
            Some(out) => Resolution::Value(out.to_string()),
            None => Resolution::Missing(format!("[stage:{id} output not found]")),
        };
    }
    if let Some(key) = expr.strip_prefix("context.sharedState.") {
        return match ctx.shared_state.get(key) {
            Some(v) => Resolution::Value(render_json(v)),
            None => Resolution::Missing(format!("[sharedState:{key} missing]")),
        };
    }
    if let Some(key) = expr.strip_prefix("context.metadata.") {
        return match ctx.metadata.get(key) {
            Some(v) => Resolution::Value(v.clone()),
            None => Resolution::Missing(format!("[metadata:{key} missing]")),
        };
    }
    if let Some(var) = expr.strip_prefix("env.") {
        return match std::env::var(var) {
            Ok(v) => Resolution::Value(v),
            Err(_) => Resolution::Missing(format!("[env:{var} not found]")),
        };
    }
    match expr {
        "context.allOutputs" => Resolution::Value(ctx.all_outputs()),
        "context.successfulOutputs" => Resolution::Value(ctx.successful_outputs()),
        "pipeline.name" => Resolution::Value(ctx.pipeline_name.clone()),
        "pipeline.id" => Resolution::Value(ctx.pipeline_id.clone()),
        ITEM_KEY | ITEM_INDEX_KEY => match ctx.shared_state.get(expr) {
            Some(v) => Resolution::Value(render_json(v)),
            None => Resolution::Missing(format!("[sharedState:{expr} missing]")),
        },
        _ => Resolution::Unknown,
    }
}

/// Strings render raw; everything else as compact JSON.
pub fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{AgentResult, PipelineContext};
    use serde_json::json;

    async fn sample() -> ContextSnapshot {
        let ctx = PipelineContext::new("pid", "demo");
        ctx.add_stage_result("stage1", AgentResult::success("echo", "Stage one output"))
            .await;
        ctx.add_stage_result("stage2", AgentResult::failure("echo", "bad"))
            .await;
        ctx.set_shared("goal", json!("Ship feature")).await;
        ctx.set_shared("limits", json!({"max": 3})).await;
        ctx.set_metadata("owner", "codex").await;
        ctx.snapshot().await
    }

    #[tokio::test]
    async fn renders_legacy_placeholders() {
        let snap = sample().await;
        let template = "{{context.stageResults.stage1.output}}\nOwner: {{context.metadata.owner}}\nGoal: {{ context.sharedState.goal }}";
        let rendered = interpolate(template, &snap);
        assert_eq!(
            rendered,
            "Stage one output\nOwner: codex\nGoal: Ship feature"
        );
    }

    #[tokio::test]
    async fn renders_dollar_placeholders() {
        let snap = sample().await;
        assert_eq!(
            interpolate("Review: ${stages.stage1.output} for ${pipeline.name}/${pipeline.id}", &snap),
            "Review: Stage one output for demo/pid"
        );
        assert_eq!(
            interpolate("${context.sharedState.limits}", &snap),
            r#"{"max":3}"#
        );
    }

    #[tokio::test]
    async fn missing_references_render_markers() {
        let snap = sample().await;
        assert_eq!(
            interpolate("${stages.ghost.output}", &snap),
            "[stage:ghost output not found]"
        );
        assert_eq!(
            interpolate("{{context.stageResults.stage2.output}}", &snap),
            "[stage:stage2 output not found]"
        );
        assert_eq!(
            interpolate("{{context.sharedState.nope}}", &snap),
            "[sharedState:nope missing]"
        );
        assert_eq!(
            interpolate("${context.metadata.nope}", &snap),
            "[metadata:nope missing]"
        );
        assert_eq!(
            interpolate("${env.CONDUCTOR_TEMPLATE_TEST_UNSET_VAR}", &snap),
            "[env:CONDUCTOR_TEMPLATE_TEST_UNSET_VAR not found]"
        );
        assert_eq!(
            interpolate("${weird.thing}", &snap),
            "[unknown placeholder: weird.thing]"
        );
    }

    #[tokio::test]
    async fn unknown_brace_text_is_left_alone() {
        let snap = sample().await;
        assert_eq!(interpolate("keep {{ this }} as is", &snap), "keep {{ this }} as is");
        assert_eq!(interpolate("unclosed ${stages.stage1", &snap), "unclosed ${stages.stage1");
    }

    #[tokio::test]
    async fn aggregate_outputs() {
        let snap = sample().await;
        assert_eq!(
            interpolate("{{context.successfulOutputs}}", &snap),
            "[stage1]\nStage one output"
        );
        assert_eq!(interpolate("${context.allOutputs}", &snap), snap.all_outputs());
    }

    #[tokio::test]
    async fn item_placeholder() {
        let ctx = PipelineContext::new("pid", "demo");
        ctx.set_shared(ITEM_KEY, json!("src/lib.rs")).await;
        ctx.set_shared(ITEM_INDEX_KEY, json!(4)).await;
        let snap = ctx.snapshot().await;
        assert_eq!(interpolate("lint ${item} (#${itemIndex})", &snap), "lint src/lib.rs (#4)");
    }

    #[tokio::test]
    async fn validate_lists_unresolved() {
        let snap = sample().await;
        let problems = validate_template(
            "${stages.stage1.output} ${stages.ghost.output} {{context.metadata.nope}} ${bogus}",
            &snap,
        );
        assert_eq!(
            problems,
            vec![
                "[stage:ghost output not found]".to_string(),
                "[metadata:nope missing]".to_string(),
                "[unknown placeholder: bogus]".to_string(),
            ]
        );
    }

    #[test]
    fn referenced_stage_ids() {
        let refs = referenced_stages(
            "${stages.a.output} {{context.stageResults.b-2.output}} ${stages.a.output}",
        );
        assert_eq!(refs, vec!["a", "b-2"]);
    }
}
