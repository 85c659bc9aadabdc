use weft_core::config::GatewayConfig;

/// Bearer header first, then `?token=` (browsers cannot set headers on a
/// WebSocket upgrade). With no token configured every request is accepted.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>, query_token: Option<&str>) -> bool {
    let Some(expected) = config.token.as_deref() else {
        return true;
    };
    match bearer {
        Some(value) => value == expected,
        None => query_token == Some(expected),
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some(val) = pair.strip_prefix("token=") {
            return Some(val);
        }
    }
    None
}
