use serde::Deserialize;
use url::Url;

/// Server configuration, read from `config.toml` and overridable with
/// `SLIDEMARK_*` environment variables. Database credentials come from the
/// `POSTGRES_*` environment variables instead (see [`crate::db::create_url`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Port the HTTP server binds on.
    pub port: u16,
    /// Tracing filter directives, e.g. `info,slidemark_server=debug`.
    pub log_filter: String,
    /// When enabled, updates archive the previous header version and deletes
    /// keep the header around inactive. When disabled, old versions are
    /// removed eagerly and deletes are physical.
    pub annotation_history: bool,
    /// URLs that receive a POST with the annotation header after every save.
    #[serde(default)]
    pub webhooks: Vec<Url>,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("port", 8080_i64)?
            .set_default("log_filter", "info")?
            .set_default("annotation_history", true)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("SLIDEMARK"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            log_filter: "info".into(),
            annotation_history: true,
            webhooks: Vec::new(),
        }
    }
}
