//! Prompt rendering for the three movement phases (spec §4.3, §9).
//!
//! A pure function from a context struct to a `String`. Placeholders use
//! `{…}`; dynamic content substituted into a placeholder has its own `{`/`}`
//! characters escaped to fullwidth equivalents first, so a value cannot
//! introduce a placeholder that gets re-expanded.

/// Context available when rendering a Phase-1 instruction template.
#[derive(Debug, Clone, Copy)]
pub struct InstructionContext<'a> {
    pub task: &'a str,
    pub iteration: u32,
    pub max_movements: u32,
    pub movement_iteration: u32,
    pub previous_response: Option<&'a str>,
    /// Already newline-joined (spec §4.7).
    pub user_inputs: &'a str,
    pub report_dir: &'a str,
}

/// Replace `{` and `}` in dynamic content with their fullwidth equivalents.
pub fn escape_dynamic(content: &str) -> String {
    content.replace('{', "｛").replace('}', "｝")
}

/// Render `template` against `ctx`, expanding `{task}`, `{iteration}`,
/// `{max_movements}`, `{movement_iteration}`, `{previous_response}`,
/// `{user_inputs}`, `{report_dir}`, and `{report:<filename>}`. Unknown
/// placeholders are left untouched.
pub fn render(template: &str, ctx: &InstructionContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut cursor = 0usize;
    while let Some(rel_start) = template[cursor..].find('{') {
        let start = cursor + rel_start;
        out.push_str(&template[cursor..start]);
        let Some(rel_end) = template[start..].find('}') else {
            out.push_str(&template[start..]);
            cursor = template.len();
            break;
        };
        let end = start + rel_end;
        let name = &template[start + 1..end];
        out.push_str(&resolve(name, ctx));
        cursor = end + 1;
    }
    out.push_str(&template[cursor..]);
    out
}

fn resolve(name: &str, ctx: &InstructionContext<'_>) -> String {
    if let Some(file_name) = name.strip_prefix("report:") {
        return format!("{}/{}", ctx.report_dir, file_name);
    }
    match name {
        "task" => escape_dynamic(ctx.task),
        "iteration" => ctx.iteration.to_string(),
        "max_movements" => ctx.max_movements.to_string(),
        "movement_iteration" => ctx.movement_iteration.to_string(),
        "previous_response" => ctx.previous_response.map(escape_dynamic).unwrap_or_default(),
        "user_inputs" => escape_dynamic(ctx.user_inputs),
        "report_dir" => ctx.report_dir.to_string(),
        unknown => format!("{{{unknown}}}"),
    }
}
