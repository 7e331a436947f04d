//! Pool options.

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Default number of connections that may be checked out at once.
pub const DEFAULT_MAX_OPEN_CONNS: usize = 2;

/// Options for a connection pool.
///
/// The data source name handed to the driver is kept in `dsn`. When the
/// DSN is a URL, pool settings may be given as `pool_*` query parameters;
/// they are removed before the DSN reaches the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Data source name passed verbatim to the driver.
    ///
    /// Default: `""`
    pub dsn: String,

    /// Maximum number of connections checked out at once.
    ///
    /// Default: `2`
    pub max_open_conns: usize,

    /// Maximum number of idle connections kept for reuse (0 disables reuse).
    /// The pool never keeps more idle connections than `max_open_conns`, so a
    /// larger value only matters after the open limit is raised.
    ///
    /// Default: same as `max_open_conns`
    pub max_idle_conns: usize,

    /// Upper bound on how long an operation waits for a free connection slot.
    ///
    /// Default: `None` (wait until the context is done)
    pub usage_timeout: Option<Duration>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_OPEN_CONNS,
            usage_timeout: None,
        }
    }
}

impl Opts {
    /// Check the options for values the pool cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_open_conns == 0 {
            return Err(Error::InvalidUsage(
                "max_open_conns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse pool settings out of a URL data source name.
    ///
    /// Supported query parameters:
    /// - `pool_max_open_conns`: maximum checked-out connections (positive integer)
    /// - `pool_max_idle_conns`: maximum idle connections (integer)
    /// - `pool_usage_timeout_ms`: slot wait limit in milliseconds (integer)
    ///
    /// Every other parameter is left in the DSN for the driver.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        let mut opts = Opts::default();
        let mut idle_given = false;
        let mut passthrough = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "pool_max_open_conns" => {
                    opts.max_open_conns = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("invalid pool_max_open_conns: {}", value))
                    })?;
                }
                "pool_max_idle_conns" => {
                    opts.max_idle_conns = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("invalid pool_max_idle_conns: {}", value))
                    })?;
                    idle_given = true;
                }
                "pool_usage_timeout_ms" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("invalid pool_usage_timeout_ms: {}", value))
                    })?;
                    opts.usage_timeout = Some(Duration::from_millis(millis));
                }
                _ => passthrough.push((key.into_owned(), value.into_owned())),
            }
        }

        if !idle_given {
            opts.max_idle_conns = opts.max_open_conns;
        }

        let mut dsn = url.clone();
        if passthrough.is_empty() {
            dsn.set_query(None);
        } else {
            dsn.query_pairs_mut().clear().extend_pairs(passthrough);
        }
        opts.dsn = dsn.into();

        opts.validate()?;
        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    /// Parse a data source name.
    ///
    /// Strings that are not URLs (e.g. `host=db user=app`) are passed to the
    /// driver unchanged and use the default pool settings.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match Url::parse(s) {
            Ok(url) if url.has_host() || url.query().is_some() => Self::try_from(&url),
            _ => Ok(Self {
                dsn: s.to_owned(),
                ..Self::default()
            }),
        }
    }
}
