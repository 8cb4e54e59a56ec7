use crate::error::{ChatError, Result};
use url::Url;

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Websocket endpoint of the realtime service for a backend base URL.
/// `https` maps to `wss`, anything else to `ws`.
pub fn realtime_url(base_url: &str, api_key: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_url(base_url))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot use {} with {}", scheme, base_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// Name of the realtime channel carrying inserts for one conversation.
pub fn channel_name(conversation_id: &str) -> String {
    format!("chat-{}", conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_https_when_scheme_missing() {
        assert_eq!(normalize_url(" api.pawtalk.dev/ "), "https://api.pawtalk.dev");
        assert_eq!(normalize_url("http://localhost:54321"), "http://localhost:54321");
    }

    #[test]
    fn realtime_url_swaps_scheme_and_sets_path() {
        let url = realtime_url("https://abc.example.co", "anon").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = realtime_url("http://127.0.0.1:54321", "k").unwrap();
        assert_eq!(local.scheme(), "ws");
        assert_eq!(local.port(), Some(54321));
    }

    #[test]
    fn channel_is_keyed_by_conversation() {
        assert_eq!(channel_name("c1"), "chat-c1");
    }
}
