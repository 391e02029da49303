//! Parse a single profile file into a [`ProfileSource`] and run the
//! load-time validations that don't require the rest of the registry
//! (dependency-graph validation happens in [`super::graph`]).

use std::path::Path;

use super::types::ProfileSource;
use crate::error::{Error, Result};
use crate::policy::expr;

/// Parse one profile file. Accepts YAML (`.yaml`/`.yml`) or JSON (`.json`)
/// by extension; extensionless files try YAML then JSON.
pub fn parse_profile_file(path: &Path, contents: &str) -> Result<ProfileSource> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let unit = || format!("profile:{}", path.display());
    let source: ProfileSource = match ext.as_deref() {
        Some("json") => serde_json::from_str(contents).map_err(|e| Error::validation(unit(), format!("malformed json: {e}")))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(contents).map_err(|e| Error::validation(unit(), format!("malformed yaml: {e}")))?,
        _ => match serde_yaml::from_str(contents) {
            Ok(source) => source,
            Err(_) => serde_json::from_str(contents).map_err(|e| Error::validation(unit(), format!("malformed profile: {e}")))?,
        },
    };

    validate_source(&source)?;
    Ok(source)
}

/// Validations that a single profile file must satisfy on its own, before
/// it's placed in the dependency graph: non-empty identity fields,
/// well-formed version, sane numeric ranges, and syntactically valid
/// expressions. A malformed profile never reaches the registry's graph
/// step; it's quarantined right here.
fn validate_source(source: &ProfileSource) -> Result<()> {
    let unit = || format!("profile:{}", source.id);

    if source.id.trim().is_empty() {
        return Err(Error::validation(unit(), "id must be non-empty"));
    }

    if parse_version(&source.version).is_none() {
        return Err(Error::validation(
            unit(),
            format!("version '{}' does not parse as MAJOR.MINOR[.PATCH]", source.version),
        ));
    }

    if let Some(model) = &source.model_params.model {
        if model.trim().is_empty() {
            return Err(Error::validation(unit(), "model must be non-empty when set"));
        }
    }

    if let Some(temp) = source.model_params.temperature {
        if !(0.0..=2.0).contains(&temp) {
            return Err(Error::validation(
                unit(),
                format!("temperature {temp} out of range [0, 2]"),
            ));
        }
    }

    if let Some(timeout) = source.model_params.per_call_timeout_ms {
        if timeout == 0 {
            return Err(Error::validation(unit(), "per_call_timeout_ms must be > 0"));
        }
    }

    if let Some(schema) = &source.response_schema {
        if let Some((low, high)) = schema.confidence_range {
            if low > high || !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) {
                return Err(Error::validation(
                    unit(),
                    format!("confidence_range ({low}, {high}) is not monotonic within [0, 1]"),
                ));
            }
        }
    }

    for condition in &source.policy {
        expr::parse(&condition.expression)
            .map_err(|e| Error::validation(unit(), format!("malformed policy expression: {e}")))?;
    }

    if let Some(cond) = &source.conditional_execution {
        expr::parse(&cond.when)
            .map_err(|e| Error::validation(unit(), format!("malformed conditional_execution: {e}")))?;
    }

    Ok(())
}

pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}
