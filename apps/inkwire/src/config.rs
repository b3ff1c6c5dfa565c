use std::env;
#[cfg(test)]
use std::sync::Mutex;

use crate::session::store::LruEviction;

/// Which cache discipline the session store runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDiscipline {
    /// LRU-bounded cache; evicted documents are rebuilt on next use.
    Bounded,
    /// One live session per open tab until the tab closes explicitly.
    Unbounded,
}

/// Collaboration client configuration
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// WebSocket endpoint of the collaboration server
    pub collab_url: String,
    /// Bounded-mode session cache capacity
    pub session_capacity: usize,
    pub discipline: CacheDiscipline,
}

impl CollabConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let url = env::var("INKWIRE_COLLAB_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8787/collab".to_string());
        let session_capacity = env::var("INKWIRE_SESSION_CAP")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(LruEviction::DEFAULT_CAPACITY);
        let discipline = match env::var("INKWIRE_SESSION_MODE").ok().as_deref() {
            Some("unbounded") => CacheDiscipline::Unbounded,
            _ => CacheDiscipline::Bounded,
        };
        Self {
            collab_url: normalize_url(&url),
            session_capacity,
            discipline,
        }
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            collab_url: "ws://127.0.0.1:8787/collab".to_string(),
            session_capacity: LruEviction::DEFAULT_CAPACITY,
            discipline: CacheDiscipline::Bounded,
        }
    }
}

// Accept a bare host:port from the environment; the transport dials ws URLs.
fn normalize_url(raw: &str) -> String {
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        unsafe {
            env::remove_var("INKWIRE_COLLAB_URL");
            env::remove_var("INKWIRE_SESSION_CAP");
            env::remove_var("INKWIRE_SESSION_MODE");
        }
    }

    #[test]
    fn test_default_config() {
        let config = CollabConfig::default();
        assert_eq!(config.collab_url, "ws://127.0.0.1:8787/collab");
        assert_eq!(config.session_capacity, 8);
        assert_eq!(config.discipline, CacheDiscipline::Bounded);
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = CollabConfig::from_env();
        assert_eq!(config.collab_url, "ws://127.0.0.1:8787/collab");
        assert_eq!(config.session_capacity, 8);
        assert_eq!(config.discipline, CacheDiscipline::Bounded);
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        unsafe {
            env::set_var("INKWIRE_COLLAB_URL", "collab.example.com:9000");
            env::set_var("INKWIRE_SESSION_CAP", "4");
            env::set_var("INKWIRE_SESSION_MODE", "unbounded");
        }
        let config = CollabConfig::from_env();
        assert_eq!(config.collab_url, "ws://collab.example.com:9000");
        assert_eq!(config.session_capacity, 4);
        assert_eq!(config.discipline, CacheDiscipline::Unbounded);

        clear_env();
    }

    #[test]
    fn test_explicit_scheme_is_preserved() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        unsafe {
            env::set_var("INKWIRE_COLLAB_URL", "wss://collab.example.com/collab");
        }
        let config = CollabConfig::from_env();
        assert_eq!(config.collab_url, "wss://collab.example.com/collab");

        clear_env();
    }

    #[test]
    fn test_garbage_capacity_falls_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        unsafe {
            env::set_var("INKWIRE_SESSION_CAP", "many");
        }
        let config = CollabConfig::from_env();
        assert_eq!(config.session_capacity, 8);

        clear_env();
    }
}
