/// Release builds set `EDGE_SYNC_BUILD_VERSION` (for example a git describe);
/// otherwise the crate version is reported.
pub const VERSION: &str = match option_env!("EDGE_SYNC_BUILD_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// `User-Agent` sent to the proxy runtime API.
pub fn user_agent() -> String {
    format!("{}/{VERSION}", env!("CARGO_PKG_NAME"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_the_binary_and_version() {
        let ua = user_agent();
        assert!(ua.starts_with("edge-sync/"));
        assert!(ua.ends_with(VERSION));
        assert!(!VERSION.is_empty());
    }
}
