pub fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

pub fn parent(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    match path.rsplit_once('/') {
        Some((parent, _)) => Some(parent.to_string()),
        None => Some(String::new()),
    }
}

pub fn ancestors(path: &str) -> Vec<String> {
    let mut ancestors = Vec::new();
    let mut current = path.to_string();
    while let Some(up) = parent(&current) {
        ancestors.push(up.clone());
        current = up;
    }
    ancestors
}

pub fn display_name(path: &str) -> &str {
    if path.is_empty() {
        return "Unknown";
    }
    path.rsplit('/').next().unwrap_or(path)
}

// Reload condition after a write to `target` while viewing `current`:
// same path, descendant, ancestor, or the root view (which summarizes
// everything below it).
pub fn affects_view(current: &str, target: &str) -> bool {
    current == target
        || current.starts_with(&format!("{target}/"))
        || target.starts_with(&format!("{current}/"))
        || current.is_empty()
}
