use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Kind};
use crate::lock::DEFAULT_TIMEOUT;

/// Settings the runner is constructed with: where migrations live, what the ledger
/// table is called, how long to wait for the migration lock, and how to reach the
/// database. Can be built programmatically or loaded from a TOML file.
///
/// Instanced with [`Settings::new`] or [`Settings::from_file_location`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    main: Main,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Main {
    migrations_dir: PathBuf,
    table_name: String,
    lock_timeout_ms: u64,
    database_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            main: Main {
                migrations_dir: PathBuf::from("./prisma/migrations"),
                table_name: "_prisma_migrations".to_string(),
                lock_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
                database_url: None,
            },
        }
    }
}

impl Settings {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Settings {
        Settings {
            main: Main {
                migrations_dir: migrations_dir.into(),
                ..Settings::default().main
            },
        }
    }

    /// Load settings from a TOML file on disk.
    pub fn from_file_location<T: AsRef<Path>>(location: T) -> Result<Settings, Error> {
        let file = std::fs::read_to_string(&location)
            .map_err(|err| Error::new(Kind::ConfigError(format!("could not open config file, {err}")), None))?;

        let settings: Settings = toml::from_str(&file)
            .map_err(|err| Error::new(Kind::ConfigError(format!("could not parse config file, {err}")), None))?;

        Ok(settings)
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.main.migrations_dir
    }

    pub fn table_name(&self) -> &str {
        &self.main.table_name
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.main.lock_timeout_ms)
    }

    /// `database_url` as given, falling back to the `DATABASE_URL` environment variable.
    pub fn resolved_database_url(&self) -> Result<String, Error> {
        self.main
            .database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                Error::new(
                    Kind::ConfigError("no database_url in settings and DATABASE_URL is unset".to_string()),
                    None,
                )
            })
    }

    pub fn set_table_name(self, table_name: &str) -> Settings {
        Settings {
            main: Main {
                table_name: table_name.to_string(),
                ..self.main
            },
        }
    }

    pub fn set_lock_timeout(self, timeout: Duration) -> Settings {
        Settings {
            main: Main {
                lock_timeout_ms: timeout.as_millis() as u64,
                ..self.main
            },
        }
    }

    pub fn set_database_url(self, database_url: &str) -> Settings {
        Settings {
            main: Main {
                database_url: Some(database_url.to_string()),
                ..self.main
            },
        }
    }
}
