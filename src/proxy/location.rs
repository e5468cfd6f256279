//! Location block emission and rule checks.

use std::collections::BTreeMap;

use crate::spec::{LocationRule, ProxyTarget, ServiceSpec};

use super::CompileError;

const BODY_INDENT: &str = "        ";
const MODIFIERS: [&str; 4] = ["=", "~", "~*", "^~"];

/// Returns the directives that forward a request to `target`.
pub(super) fn proxy_directives(target: &str) -> String {
    format!(
        concat!(
            "        proxy_pass {target};\n",
            "        proxy_set_header Host $host;\n",
            "        proxy_set_header X-Real-IP $remote_addr;\n",
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n",
            "        proxy_set_header X-Forwarded-Proto $scheme;\n",
        ),
        target = target
    )
}

/// Wraps `body` in a `location` block at `path`.
pub(super) fn block(path: &str, body: &str) -> String {
    format!("    location {path} {{\n{body}    }}\n")
}

/// Checks and emits every extra location in payload order.
pub(super) fn compile_extra_locations(spec: &ServiceSpec) -> Result<Vec<String>, CompileError> {
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();
    claimed.insert(String::from("/"), String::from("the default location"));
    for health in [spec.health_path.clone(), format!("= {}", spec.health_path)] {
        claimed.insert(health, String::from("the health check location"));
    }

    let mut blocks = Vec::with_capacity(spec.locations.len());
    for (index, rule) in spec.locations.iter().enumerate() {
        let path = normalise_path(index, &rule.path)?;
        if let Some(conflict) = claimed.get(&path) {
            return Err(CompileError::DuplicateLocation {
                index,
                path,
                conflict: conflict.clone(),
            });
        }
        blocks.push(compile_rule(index, &path, rule, spec)?);
        claimed.insert(path, format!("locations[{index}]"));
    }
    Ok(blocks)
}

fn compile_rule(
    index: usize,
    path: &str,
    rule: &LocationRule,
    spec: &ServiceSpec,
) -> Result<String, CompileError> {
    let mut body = String::new();

    let target = match &rule.proxy_pass {
        ProxyTarget::Disabled => None,
        ProxyTarget::Upstream => Some(spec.upstream_url()),
        ProxyTarget::Explicit(target) => {
            check_target(index, target)?;
            Some(target.clone())
        }
    };
    if let Some(resolved) = target {
        let forwarded = if rule.strip_prefix && !resolved.ends_with('/') {
            format!("{resolved}/")
        } else {
            resolved
        };
        body.push_str(&proxy_directives(&forwarded));
    }

    check_braces(index, &rule.extra)?;
    for line in rule.extra.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            body.push('\n');
        } else {
            body.push_str(BODY_INDENT);
            body.push_str(trimmed);
            body.push('\n');
        }
    }

    Ok(block(path, &body))
}

/// Collapses whitespace between an optional match modifier and its pattern.
fn normalise_path(index: usize, raw: &str) -> Result<String, CompileError> {
    let invalid = |reason: &str| CompileError::InvalidLocationPath {
        index,
        path: raw.to_owned(),
        reason: reason.to_owned(),
    };

    let mut parts = raw.split_whitespace();
    let (modifier, pattern) = match (parts.next(), parts.next(), parts.next()) {
        (Some(pattern), None, None) => (None, pattern),
        (Some(modifier), Some(pattern), None) if MODIFIERS.contains(&modifier) => {
            (Some(modifier), pattern)
        }
        (None, _, _) => return Err(invalid("must not be empty")),
        _ => return Err(invalid("expected an optional modifier and one pattern")),
    };

    if pattern.contains(['{', '}', ';']) {
        return Err(invalid("must not contain '{', '}', or ';'"));
    }
    let is_regex = matches!(modifier, Some("~" | "~*"));
    if !is_regex && !pattern.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }

    Ok(modifier.map_or_else(
        || pattern.to_owned(),
        |prefix| format!("{prefix} {pattern}"),
    ))
}

fn check_target(index: usize, target: &str) -> Result<(), CompileError> {
    let invalid = |reason: &str| CompileError::InvalidProxyTarget {
        index,
        target: target.to_owned(),
        reason: reason.to_owned(),
    };

    let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    else {
        return Err(invalid("must start with http:// or https://"));
    };
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid("must name a host"));
    }
    if target
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, ';' | '{' | '}'))
    {
        return Err(invalid("must not contain whitespace, ';', '{', or '}'"));
    }
    Ok(())
}

fn check_braces(index: usize, extra: &str) -> Result<(), CompileError> {
    let mut depth: usize = 0;
    for ch in extra.chars() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(CompileError::UnbalancedExtra { index })?;
            }
            _ => {}
        }
    }
    if depth == 0 {
        Ok(())
    } else {
        Err(CompileError::UnbalancedExtra { index })
    }
}
