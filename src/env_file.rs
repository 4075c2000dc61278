//! `.env` loading, done before logging is initialised so `RUST_LOG` can come from the file.
//!
//! Supported syntax: `KEY=value`, optional `export ` prefix, `#` comments (full
//! line or after an unquoted value), single quotes (literal) and double quotes
//! (with `\n`, `\r`, `\t`, `\\` and `\"` escapes).

use std::fs;
use std::path::Path;

/// Load `path` into the process environment without overriding variables that
/// are already set. Returns how many variables were applied.
pub fn load(path: &Path) -> Result<usize, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    let mut applied = 0;
    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) = parse_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Mutating the environment is only sound while no other thread reads it;
        // this runs at startup before any thread is spawned.
        unsafe {
            std::env::set_var(&key, value);
        }
        applied += 1;
    }
    Ok(applied)
}

/// Parse one line; blank lines and comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let mut chars = raw.chars();
    match chars.next() {
        None => Ok(String::new()),
        Some('\'') => {
            let rest = chars.as_str();
            let end = rest.find('\'').ok_or_else(|| "unterminated single-quoted value".to_string())?;
            ensure_only_comment(&rest[end + 1..])?;
            Ok(rest[..end].to_string())
        }
        Some('"') => {
            let mut value = String::new();
            let mut escape = false;
            for (i, ch) in chars.as_str().char_indices() {
                if escape {
                    value.push(match ch {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                    escape = false;
                } else if ch == '\\' {
                    escape = true;
                } else if ch == '"' {
                    ensure_only_comment(&chars.as_str()[i + 1..])?;
                    return Ok(value);
                } else {
                    value.push(ch);
                }
            }
            Err("unterminated double-quoted value".to_string())
        }
        Some(_) => Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string()),
    }
}

fn ensure_only_comment(rest: &str) -> Result<(), String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err("unexpected characters after closing quote".to_string())
    }
}
