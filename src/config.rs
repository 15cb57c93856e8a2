use std::env;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::Error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;

/// Connection settings shared by [`crate::Connection`], [`crate::AsyncConnector`] and
/// [`crate::Subscriber`].
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Wrap the TCP stream in TLS after connecting. Needs the `tls` feature.
    pub tls: bool,
    /// Replayed once as `AUTH <password>` right after connecting.
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Bound on every frame read. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Size of one pooled transfer buffer used by the async connector.
    pub transfer_buffer_size: usize,
    /// Number of pooled transfer buffers; bounds the commands being serialized at once.
    pub transfer_buffer_count: usize,
    /// Capacity of the bounded event channel.
    pub event_capacity: usize,
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: false,
            password: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            transfer_buffer_size: 64 * 1024,
            transfer_buffer_count: 16,
            event_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_TLS`,
    /// `REDIS_READ_TIMEOUT_MS` and `MAX_FRAME_SIZE`.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(host) = env::var("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var("REDIS_PORT")? {
            config.port = port;
        }
        if let Ok(password) = env::var("REDIS_PASSWORD") {
            config.password = Some(password);
        }
        if let Some(tls) = parse_var("REDIS_TLS")? {
            config.tls = tls;
        }
        if let Some(ms) = parse_var::<u64>("REDIS_READ_TIMEOUT_MS")? {
            config.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(size) = parse_var("MAX_FRAME_SIZE")? {
            config.max_frame_size = size;
        }

        Ok(config)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transfer_buffers(mut self, size: usize, count: usize) -> Self {
        self.transfer_buffer_size = size;
        self.transfer_buffer_count = count;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.transfer_buffer_count == 0 || self.transfer_buffer_size == 0 {
            return Err(Error::Usage(
                "transfer buffer size and count must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Usage("event capacity must be positive".to_string()));
        }
        if self.tls && !cfg!(feature = "tls") {
            return Err(Error::Usage(
                "TLS requested but the crate was built without the `tls` feature".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::Usage(format!("{} must be a valid value, got {:?}", name, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.addr(), "127.0.0.1:6379");
        assert!(config.password.is_none());
        assert!(config.read_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = Config::new("cache.local", 6380)
            .with_password("secret")
            .with_read_timeout(Duration::from_millis(250))
            .with_transfer_buffers(1024, 2);

        assert_eq!(config.addr(), "cache.local:6380");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.transfer_buffer_size, 1024);
        assert_eq!(config.transfer_buffer_count, 2);
    }

    #[test]
    fn rejects_empty_buffer_pool() {
        let config = Config::default().with_transfer_buffers(1024, 0);
        assert!(matches!(config.validate(), Err(Error::Usage(_))));
    }
}
