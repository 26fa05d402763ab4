//! Config get/set command.

use std::path::Path;

use anyhow::{Context, Result};
use pipeauth_core::Config;

use crate::ui;

/// Config command arguments.
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Get a specific key.
    pub get: Option<String>,
    /// Set a key-value pair (key=value).
    pub set: Option<String>,
    /// Show full config.
    pub show: bool,
    /// Validate configuration.
    pub validate: bool,
}

/// Run the config command.
pub fn run_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    if args.validate {
        return validate_config(config_path);
    }

    if let Some(key) = args.get {
        return get_config_value(config_path, &key);
    }

    if let Some(kv) = args.set {
        return set_config_value(config_path, &kv);
    }

    show_config(config_path)
}

/// Show the effective configuration, defaults filled in.
fn show_config(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let mut value = serde_json::to_value(&config)?;
    redact(&mut value);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Blank out credentials before printing.
fn redact(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if matches!(key.as_str(), "password" | "guestToken") && entry.is_string() {
                    *entry = serde_json::Value::String("[REDACTED]".to_string());
                } else {
                    redact(entry);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Get a specific config value by path.
fn get_config_value(config_path: &Path, key: &str) -> Result<()> {
    let config = super::load_config(config_path)?;
    let value = serde_json::to_value(&config)?;

    let mut current = &value;
    for part in key.split('.') {
        let next = match current {
            serde_json::Value::Object(map) => map.get(part),
            serde_json::Value::Array(arr) => part.parse::<usize>().ok().and_then(|idx| arr.get(idx)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => {
                ui::error(&format!("Key not found: {key}"));
                return Ok(());
            }
        }
    }

    match current {
        serde_json::Value::String(s) => println!("{s}"),
        serde_json::Value::Number(n) => println!("{n}"),
        serde_json::Value::Bool(b) => println!("{b}"),
        serde_json::Value::Null => println!("null"),
        _ => println!("{}", serde_json::to_string_pretty(current)?),
    }

    Ok(())
}

/// Set a config value and save it if the result still validates.
fn set_config_value(config_path: &Path, kv: &str) -> Result<()> {
    let Some((key, new_value)) = kv.split_once('=') else {
        anyhow::bail!("Invalid format. Use: key=value or key.nested=value");
    };

    let mut config: serde_json::Value = if config_path.exists() {
        let content = std::fs::read_to_string(config_path)?;
        json5::from_str(&content)?
    } else {
        serde_json::json!({})
    };

    let path_parts: Vec<&str> = key.split('.').collect();
    set_nested_value(&mut config, &path_parts, new_value);

    let updated: Config = serde_json::from_value(config).context("value does not fit the configuration")?;
    updated.validate()?;
    updated.save(config_path)?;

    ui::success(&format!("Set {key} = {new_value}"));
    Ok(())
}

/// Set a nested value in a JSON object, creating objects along the way.
fn set_nested_value(root: &mut serde_json::Value, path: &[&str], value: &str) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for part in parents {
        if !current.is_object() {
            *current = serde_json::json!({});
        }
        current = &mut current[*part];
    }
    if !current.is_object() {
        *current = serde_json::json!({});
    }

    // Try to parse value as JSON, fall back to string
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    current[*last] = parsed;
}

/// Validate the configuration.
fn validate_config(config_path: &Path) -> Result<()> {
    ui::header("Validating Configuration");

    if !config_path.exists() {
        ui::error(&format!("Config file not found: {}", config_path.display()));
        return Ok(());
    }

    let content = std::fs::read_to_string(config_path)?;

    match json5::from_str::<serde_json::Value>(&content) {
        Ok(value) => {
            ui::success("Syntax: Valid JSON5");

            for section in ["endpoint", "client", "crypto"] {
                if value.get(section).is_none() {
                    ui::warning(&format!("Missing '{section}' section, defaults apply"));
                }
            }

            match Config::load(config_path) {
                Ok(config) => {
                    ui::success("Schema: Configuration is valid");
                    ui::kv("Endpoint", &config.endpoint.name);
                    ui::kv("Routes", &config.routes.len().to_string());
                }
                Err(e) => ui::error(&format!("Schema error: {e}")),
            }
        }
        Err(e) => ui::error(&format!("Syntax error: {e}")),
    }

    Ok(())
}
