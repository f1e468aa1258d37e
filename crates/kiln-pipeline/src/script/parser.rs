use std::collections::HashSet;
use std::time::Duration;

use kiln_core::ContentHasher;

use super::{CompiledScript, Line, Segment, Statement, Template};
use crate::error::Diagnostic;

/// Compile `content` against `imports`.
///
/// Either the whole script compiles or every diagnostic found is returned.
pub fn compile(
    content: &str,
    name: &str,
    imports: &[String],
) -> Result<CompiledScript, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    // Imports apply to the whole script regardless of where they appear.
    let mut active_imports: Vec<String> = Vec::with_capacity(imports.len());
    for import in imports {
        push_unique(&mut active_imports, import);
    }
    for (idx, raw) in content.lines().enumerate() {
        if let Some((keyword, rest, rest_col)) = split_statement(raw)
            && keyword == "import"
        {
            if is_import_path(rest) {
                push_unique(&mut active_imports, rest);
            } else {
                diagnostics.push(Diagnostic::new(
                    format!("invalid import '{rest}'"),
                    idx + 1,
                    rest_col,
                ));
            }
        }
    }

    let mut lines = Vec::new();
    let mut required_libraries: Vec<String> = Vec::new();
    let mut bound: HashSet<String> = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let number = idx + 1;
        let Some((keyword, rest, rest_col)) = split_statement(raw) else {
            continue;
        };
        let keyword_col = keyword_column(raw);

        let statement = match keyword {
            "import" => continue,
            "echo" => parse_template(rest, number, rest_col, &bound, &mut diagnostics)
                .map(Statement::Echo),
            "fail" => parse_template(rest, number, rest_col, &bound, &mut diagnostics)
                .map(Statement::Fail),
            "set" => parse_set(rest, number, rest_col, &mut bound, &mut diagnostics),
            "require" => {
                if is_library_name(rest) {
                    push_unique(&mut required_libraries, rest);
                    Some(Statement::Require(rest.to_string()))
                } else {
                    diagnostics.push(Diagnostic::new(
                        format!("invalid library name '{rest}'"),
                        number,
                        rest_col,
                    ));
                    None
                }
            }
            "invoke" => parse_invoke(
                rest,
                number,
                rest_col,
                &active_imports,
                &bound,
                &mut diagnostics,
            ),
            "sleep" => match rest.parse::<u64>() {
                Ok(ms) => Some(Statement::Sleep(Duration::from_millis(ms))),
                Err(_) => {
                    diagnostics.push(Diagnostic::new(
                        format!("sleep expects milliseconds, got '{rest}'"),
                        number,
                        rest_col,
                    ));
                    None
                }
            },
            other => {
                diagnostics.push(Diagnostic::new(
                    format!("unknown statement '{other}'"),
                    number,
                    keyword_col,
                ));
                None
            }
        };

        if let Some(statement) = statement {
            lines.push(Line { number, statement });
        }
    }

    if !diagnostics.is_empty() {
        diagnostics.sort_by_key(|d| (d.line, d.column));
        return Err(diagnostics);
    }

    Ok(CompiledScript {
        name: name.to_string(),
        fingerprint: ContentHasher::fingerprint_str(content),
        lines,
        imports: active_imports,
        required_libraries,
    })
}

/// Resolve an `invoke` target to a fully qualified import.
///
/// Matches, in order: an exact import, a `package.*` wildcard covering a
/// qualified symbol, or the last segment of exactly one explicit import.
pub fn resolve_symbol(symbol: &str, imports: &[String]) -> Result<String, String> {
    if imports.iter().any(|i| i == symbol) {
        return Ok(symbol.to_string());
    }

    if let Some((package, _)) = symbol.rsplit_once('.') {
        let wildcard = format!("{package}.*");
        if imports.iter().any(|i| *i == wildcard) {
            return Ok(symbol.to_string());
        }
        return Err(format!("unresolved symbol '{symbol}'"));
    }

    let candidates: Vec<&String> = imports
        .iter()
        .filter(|i| !i.ends_with(".*"))
        .filter(|i| i.rsplit('.').next() == Some(symbol))
        .collect();
    match candidates.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(format!("unresolved symbol '{symbol}'")),
        many => Err(format!(
            "ambiguous symbol '{symbol}' (matches {})",
            many.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )),
    }
}

/// Split a raw line into `(keyword, rest, rest_column)`; `None` for blank and
/// comment lines.
fn split_statement(raw: &str) -> Option<(&str, &str, usize)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let start = raw.len() - raw.trim_start().len();
    let body = raw[start..].trim_end();
    let (keyword, rest_offset) = match body.find(char::is_whitespace) {
        Some(pos) => {
            let after = &body[pos..];
            let skipped = after.len() - after.trim_start().len();
            (&body[..pos], start + pos + skipped)
        }
        None => (body, start + body.len()),
    };
    let rest = raw[rest_offset.min(raw.len())..].trim_end();
    Some((keyword, rest, column_of(raw, rest_offset)))
}

fn keyword_column(raw: &str) -> usize {
    column_of(raw, raw.len() - raw.trim_start().len())
}

/// 1-based character column of a byte offset.
fn column_of(raw: &str, byte_offset: usize) -> usize {
    raw[..byte_offset.min(raw.len())].chars().count() + 1
}

fn parse_set(
    rest: &str,
    line: usize,
    rest_col: usize,
    bound: &mut HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Statement> {
    let Some(eq) = rest.find('=') else {
        diagnostics.push(Diagnostic::new("set expects 'name = value'", line, rest_col));
        return None;
    };
    let name = rest[..eq].trim();
    if !is_identifier(name) {
        diagnostics.push(Diagnostic::new(
            format!("invalid variable name '{name}'"),
            line,
            rest_col,
        ));
        return None;
    }
    let after = &rest[eq + 1..];
    let value_offset = eq + 1 + (after.len() - after.trim_start().len());
    let value_col = rest_col + rest[..value_offset].chars().count();
    let value = parse_template(after.trim_start(), line, value_col, bound, diagnostics)?;
    bound.insert(name.to_string());
    Some(Statement::Set {
        name: name.to_string(),
        value,
    })
}

fn parse_invoke(
    rest: &str,
    line: usize,
    rest_col: usize,
    imports: &[String],
    bound: &HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Statement> {
    let mut tokens = tokens_with_columns(rest, rest_col).into_iter();
    let Some((symbol, symbol_col)) = tokens.next() else {
        diagnostics.push(Diagnostic::new("invoke expects a symbol", line, rest_col));
        return None;
    };

    let resolved = match resolve_symbol(symbol, imports) {
        Ok(resolved) => Some(resolved),
        Err(message) => {
            diagnostics.push(Diagnostic::new(message, line, symbol_col));
            None
        }
    };

    let mut args = Vec::new();
    let mut ok = true;
    for (token, col) in tokens {
        match parse_template(token, line, col, bound, diagnostics) {
            Some(t) => args.push(t),
            None => ok = false,
        }
    }

    match (resolved, ok) {
        (Some(symbol), true) => Some(Statement::Invoke { symbol, args }),
        _ => None,
    }
}

fn tokens_with_columns(text: &str, base_col: usize) -> Vec<(&str, usize)> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                tokens.push((&text[s..idx], base_col + text[..s].chars().count()));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((&text[s..], base_col + text[..s].chars().count()));
    }
    tokens
}

fn parse_template(
    text: &str,
    line: usize,
    col: usize,
    bound: &HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Template> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut ok = true;
    let mut rest = text;
    let mut consumed = 0usize;

    while let Some(pos) = rest.find("${") {
        literal.push_str(&rest[..pos]);
        let marker_col = col + text[..consumed + pos].chars().count();
        let after = &rest[pos + 2..];
        let Some(end) = after.find('}') else {
            diagnostics.push(Diagnostic::new("unterminated '${'", line, marker_col));
            return None;
        };
        let var = &after[..end];
        if !is_identifier(var) {
            diagnostics.push(Diagnostic::new(
                format!("invalid variable reference '${{{var}}}'"),
                line,
                marker_col,
            ));
            ok = false;
        } else if !bound.contains(var) {
            diagnostics.push(Diagnostic::new(
                format!("undefined variable '{var}'"),
                line,
                marker_col,
            ));
            ok = false;
        } else {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Variable(var.to_string()));
        }
        let advance = pos + 2 + end + 1;
        consumed += advance;
        rest = &rest[advance..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    ok.then_some(Template { segments })
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_import_path(s: &str) -> bool {
    let body = s.strip_suffix(".*").unwrap_or(s);
    !body.is_empty() && body.split('.').all(|segment| is_identifier(segment))
}

fn is_library_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
