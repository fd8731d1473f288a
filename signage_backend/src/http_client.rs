use std::time::Duration;

const USER_AGENT: &str = concat!("signage/", env!("CARGO_PKG_VERSION"));

pub fn build_http_client() -> reqwest::Client {
    build_http_client_with_timeout(None)
}

/// Build the reqwest client shared by the weather collector, the ComfyUI
/// client and the controller.
///
/// System proxy discovery is opt-in through `SIGNAGE_ENABLE_SYSTEM_PROXY`;
/// when it is enabled but the builder fails, we fall back to a direct client.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let use_system_proxy = proxy_discovery_enabled(
        std::env::var("SIGNAGE_ENABLE_SYSTEM_PROXY").ok().as_deref(),
    );

    if use_system_proxy {
        match client_builder(timeout).build() {
            Ok(client) => return client,
            Err(error) => tracing::warn!(
                "HTTP client with system proxy discovery failed ({}); using a direct client",
                error
            ),
        }
    }

    client_builder(timeout)
        .no_proxy()
        .build()
        .unwrap_or_else(|error| {
            tracing::error!("Direct HTTP client could not be built: {}", error);
            reqwest::Client::new()
        })
}

fn client_builder(timeout: Option<Duration>) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder().user_agent(USER_AGENT);
    match timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder,
    }
}

fn proxy_discovery_enabled(raw: Option<&str>) -> bool {
    raw.map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_discovery_is_opt_in() {
        assert!(!proxy_discovery_enabled(None));
        assert!(!proxy_discovery_enabled(Some("yes")));
        assert!(proxy_discovery_enabled(Some("1")));
        assert!(proxy_discovery_enabled(Some("TRUE")));
    }
}
