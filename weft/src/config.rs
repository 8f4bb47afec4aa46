use std::sync::Arc;

use crate::io::TlsAcceptor;

/// A single listen address. `index` is assigned densely at registration
/// time and used as a table key throughout the engine (route scoping,
/// acceptor dispatch).
#[derive(Clone)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
    pub tls: Option<Arc<dyn TlsAcceptor>>,
    pub reuse_addr: bool,
    pub(crate) index: usize,
}

impl ListenAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ListenAddr {
            host: host.into(),
            port,
            tls: None,
            reuse_addr: true,
            index: 0,
        }
    }

    pub fn with_tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenAddr")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("index", &self.index)
            .finish()
    }
}

/// Server options, passed explicitly at construction time. Nothing here is
/// process-global mutable state.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen addresses. Indexes are assigned in order at `Server::serve`.
    pub listens: Vec<ListenAddr>,

    /// Worker thread count. Defaults to the number of CPUs.
    pub num_threads: usize,

    /// Hard cap on concurrent connections; the acceptor stops accepting
    /// while the cap is reached.
    pub max_connections: usize,

    /// Idle timeout in seconds. Negative disables the sweep.
    pub timeout: i64,

    /// Per-client read/write buffer size in bytes.
    pub buf_size: usize,

    /// Mask SIGPIPE at startup so broken pipes surface as EPIPE.
    pub mask_sigpipe: bool,

    /// Hard cap on keep-alive requests per connection.
    pub keep_alive_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listens: Vec::new(),
            num_threads: num_cpus::get(),
            max_connections: 10_000,
            timeout: 30,
            buf_size: 8 * 1024,
            mask_sigpipe: true,
            keep_alive_limit: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from environment variables. Unset or malformed
    /// values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("WEFT_THREADS") {
            if let Ok(n) = v.parse() {
                cfg.num_threads = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_TIMEOUT") {
            if let Ok(n) = v.parse() {
                cfg.timeout = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_BUF_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.buf_size = n;
            }
        }
        cfg
    }

    pub fn listen(mut self, addr: ListenAddr) -> Self {
        self.listens.push(addr);
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.num_threads = n.max(1);
        self
    }

    pub fn idle_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    pub(crate) fn idle(&self) -> Option<std::time::Duration> {
        if self.timeout < 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.timeout as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert!(cfg.num_threads >= 1);
        assert_eq!(cfg.timeout, 30);
        assert!(cfg.mask_sigpipe);
    }

    #[test]
    fn test_negative_timeout_disables_idle() {
        let cfg = ServerConfig::new().idle_timeout(-1);
        assert!(cfg.idle().is_none());
        let cfg = ServerConfig::new().idle_timeout(5);
        assert_eq!(cfg.idle(), Some(std::time::Duration::from_secs(5)));
    }
}
