use std::{net::SocketAddr, path::PathBuf};

const DEFAULT_BIND: &str = "0.0.0.0:8080";

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Process-level settings. Worker and client settings live in
/// `submit_worker::config`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind: SocketAddr,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            env_str("DATABASE_URL").ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;
        let bind = parse_bind(env_str("SUBMIT_BIND").as_deref())?;
        Ok(Self {
            database_url,
            bind,
            log_dir: env_str("SUBMIT_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_bind(raw: Option<&str>) -> anyhow::Result<SocketAddr> {
    let raw = raw.unwrap_or(DEFAULT_BIND);
    raw.parse()
        .map_err(|e| anyhow::anyhow!("SUBMIT_BIND {raw:?} is not a socket address: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_and_validates() {
        assert_eq!(parse_bind(None).unwrap().port(), 8080);
        assert_eq!(
            parse_bind(Some("127.0.0.1:9000")).unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind(Some("localhost")).is_err());
    }
}
