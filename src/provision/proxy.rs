use std::collections::BTreeMap;

pub const HTTP_PROXY: &str = "HTTP_PROXY";
pub const HTTPS_PROXY: &str = "HTTPS_PROXY";
pub const NO_PROXY: &str = "NO_PROXY";

/// Proxy settings from the host environment, keyed by both the upper and
/// lower case variable names. When both spellings are set on the host the
/// upper case value wins.
pub fn proxy_env<F>(lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();
    for name in [HTTP_PROXY, HTTPS_PROXY, NO_PROXY] {
        let value = lookup(name)
            .filter(|v| !v.is_empty())
            .or_else(|| lookup(&name.to_lowercase()).filter(|v| !v.is_empty()));
        if let Some(value) = value {
            env.insert(name.to_lowercase(), value.clone());
            env.insert(name.to_string(), value);
        }
    }
    env
}

/// Append `extra` entries to NO_PROXY in both spellings. A no-op when no
/// proxy is configured at all.
pub fn extend_no_proxy(env: &mut BTreeMap<String, String>, extra: &[String]) {
    if env.is_empty() || extra.is_empty() {
        return;
    }
    let mut entries: Vec<String> = env
        .get(NO_PROXY)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for e in extra {
        if !entries.contains(e) {
            entries.push(e.clone());
        }
    }
    let joined = entries.join(",");
    env.insert(NO_PROXY.to_lowercase(), joined.clone());
    env.insert(NO_PROXY.to_string(), joined);
}
