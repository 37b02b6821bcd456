use std::env;
use std::path::PathBuf;

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_xdg_state_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_STATE_HOME").ok()) {
        return Some(path);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("state"))
}

pub fn resolve_base_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("APIFORGE_HOME").ok()) {
        return path;
    }
    if let Some(path) = resolve_xdg_state_dir() {
        return path.join("apiforge");
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_vault_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("APIFORGE_VAULT_PATH").ok()) {
        return path;
    }
    resolve_base_dir().join("vault.json")
}

pub fn resolve_vault_key_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("APIFORGE_VAULT_KEY_PATH").ok()) {
        return path;
    }
    resolve_base_dir().join("vault.key")
}

#[cfg(test)]
mod tests {
    use super::normalize_env_path;
    use std::path::PathBuf;

    #[test]
    fn normalize_env_path_ignores_placeholders() {
        assert_eq!(normalize_env_path(Some("  ".to_string())), None);
        assert_eq!(normalize_env_path(Some("null".to_string())), None);
        assert_eq!(
            normalize_env_path(Some("/tmp/forge".to_string())),
            Some(PathBuf::from("/tmp/forge"))
        );
    }
}
