//! Small URL helpers shared by the handlers and the config downloader.

use crate::error::{Result, SonaError};

/// Strip trailing slashes so path joining stays predictable.
pub fn sanitize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Join a base URL and a path, tolerating slashes on either side.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", sanitize_base_url(base), path.trim_start_matches('/'))
}

/// Extract the `scheme://authority` part of a URL, dropping any path.
pub fn origin(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| SonaError::configuration(format!("invalid api url '{url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SonaError::configuration(format!("api url '{url}' has no host")))?;
    match parsed.port() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}

/// Rewrite an http(s) origin to its websocket equivalent.
pub fn to_ws_url(base: &str, path: &str) -> String {
    let joined = join_url(base, path);
    if let Some(rest) = joined.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = joined.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a.example/", "/api/v1"), "https://a.example/api/v1");
        assert_eq!(join_url("https://a.example", "api/v1"), "https://a.example/api/v1");
    }

    #[test]
    fn test_origin() {
        assert_eq!(
            origin("https://a.example/profile/123?x=1").unwrap(),
            "https://a.example"
        );
        assert_eq!(
            origin("http://localhost:3000/cfg").unwrap(),
            "http://localhost:3000"
        );
        assert!(origin("not a url").is_err());
    }

    #[test]
    fn test_to_ws_url() {
        assert_eq!(
            to_ws_url("https://a.example", "conversation"),
            "wss://a.example/conversation"
        );
        assert_eq!(
            to_ws_url("http://localhost:3000", "/stt"),
            "ws://localhost:3000/stt"
        );
    }
}
