//! Profile loading with `--set` overrides
//!
//! A profile is one TOML file describing one side of an experiment. Overrides
//! arrive as `key=value` strings in dot notation and are spliced into the
//! parsed TOML before deserialization, so an overridden value passes through
//! exactly the same typing and validation as the file itself.

use anyhow::{bail, Context, Result};
use phloem_core::config::HarnessConfig;
use std::path::Path;

/// Load a profile, apply `key=value` overrides, validate the result
pub fn load<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<HarnessConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile: {}", path.display()))?;

    let mut value: toml::Value = toml::from_str(&content)
        .with_context(|| format!("Failed to parse profile: {}", path.display()))?;

    for override_str in overrides {
        let (key, val) = split_override(override_str)?;
        set_path(&mut value, key, val)
            .with_context(|| format!("Failed to apply override: {override_str}"))?;
    }

    let config: HarnessConfig = value
        .try_into()
        .with_context(|| format!("Invalid profile: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn split_override(override_str: &str) -> Result<(&str, &str)> {
    match override_str.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => bail!("Invalid override format '{override_str}'. Expected 'key=value'"),
    }
}

/// Walk a dot-notation path and set the final key, creating intermediate
/// tables as needed. Profiles are tables all the way down, so every path
/// segment names a table key.
fn set_path(root: &mut toml::Value, path: &str, value_str: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        bail!("Empty override path");
    }

    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let toml::Value::Table(table) = current else {
            bail!("Cannot set '{segment}' inside a non-table value");
        };
        if i == segments.len() - 1 {
            table.insert((*segment).to_string(), parse_value(value_str));
            return Ok(());
        }
        current = table
            .entry((*segment).to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }
    Ok(())
}

/// Infer a TOML type from an override value. Durations ("90s") and socket
/// addresses stay strings; quoting forces string where a bare value would
/// read as a number.
fn parse_value(value_str: &str) -> toml::Value {
    let trimmed = value_str.trim();

    if trimmed == "true" {
        return toml::Value::Boolean(true);
    }
    if trimmed == "false" {
        return toml::Value::Boolean(false);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return toml::Value::Integer(int_val);
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        return toml::Value::Float(float_val);
    }

    let unquoted = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    toml::Value::String(unquoted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_inference() {
        assert_eq!(parse_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_value("false"), toml::Value::Boolean(false));
        assert_eq!(parse_value("42"), toml::Value::Integer(42));
        assert_eq!(parse_value("-1"), toml::Value::Integer(-1));
        assert_eq!(parse_value("0.5"), toml::Value::Float(0.5));
        assert_eq!(parse_value("90s"), toml::Value::String("90s".to_string()));
        assert_eq!(parse_value("\"1000\""), toml::Value::String("1000".to_string()));
        assert_eq!(
            parse_value("127.0.0.1:14002"),
            toml::Value::String("127.0.0.1:14002".to_string())
        );
    }

    #[test]
    fn test_set_path_creates_missing_tables() {
        let mut value: toml::Value = toml::from_str("[experiment]\nname = \"x\"").unwrap();
        set_path(&mut value, "pacing.ticks_per_sec", "500").unwrap();
        assert_eq!(value["pacing"]["ticks_per_sec"], toml::Value::Integer(500));

        set_path(&mut value, "experiment.name", "y").unwrap();
        assert_eq!(value["experiment"]["name"], toml::Value::String("y".to_string()));
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut value: toml::Value = toml::from_str("role = \"provider\"").unwrap();
        assert!(set_path(&mut value, "role.deeper", "1").is_err());
    }

    #[test]
    fn test_split_override_shapes() {
        assert!(split_override("no-equals-here").is_err());
        assert!(split_override("=value").is_err());
        let (key, value) = split_override("a.b=c=d").unwrap();
        assert_eq!(key, "a.b");
        assert_eq!(value, "c=d");
    }
}
