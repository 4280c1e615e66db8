use serde::Deserialize;

/// Process configuration, loaded from environment variables prefixed
/// `GUETZLI_` via `envy`. Provide defaults via `.env` for local development;
/// override via real env vars in production.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base directory under which every content entry gets its own
    /// subdirectory. Defaults to `<home>/.guetzli-data` when unset.
    #[serde(default)]
    pub storage_base: Option<String>,

    /// Name (or path) of the quality-probe executable on `PATH`.
    #[serde(default = "default_probe_cmd")]
    pub probe_cmd: String,

    /// Name (or path) of the recompressor executable on `PATH`.
    #[serde(default = "default_recompress_cmd")]
    pub recompress_cmd: String,
}

fn default_port() -> u16 {
    8080
}

fn default_probe_cmd() -> String {
    "identify".to_string()
}

fn default_recompress_cmd() -> String {
    "guetzli".to_string()
}

impl Config {
    /// Loads configuration from the current process environment.
    ///
    /// Panics with a clear message if a variable fails to parse into its
    /// declared type — unlike the teacher's config there are no strictly
    /// required variables, so a missing var never panics here.
    pub fn from_env() -> Self {
        envy::prefixed("GUETZLI_")
            .from_env::<Config>()
            .unwrap_or_else(|err| {
                panic!("configuration error: {err}\ncheck GUETZLI_* environment variables");
            })
    }

    /// Resolves the base storage directory, falling back to
    /// `<home>/.guetzli-data` when `storage_base` was not configured.
    pub fn resolved_storage_base(&self) -> std::path::PathBuf {
        match &self.storage_base {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                let home = dirs_home().unwrap_or_else(|| std::path::PathBuf::from("."));
                home.join(".guetzli-data")
            }
        }
    }
}

/// Minimal home-directory lookup — avoids pulling in the `dirs` crate for a
/// single environment variable read, consistent with the original Java
/// service's use of `user.home`.
fn dirs_home() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}
