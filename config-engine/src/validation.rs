use crate::{
    error::{ConfigError, Result},
    RebacConfig,
};

impl RebacConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(ConfigError::Validation(message.to_string()));

        if self.database.max_connections == 0 {
            return fail("database.max_connections must be at least 1");
        }
        if matches!(self.database.url.as_deref(), Some(url) if url.trim().is_empty()) {
            return fail("database.url is blank");
        }

        let engine = &self.engine;
        if engine.max_schema_depth == 0 {
            return fail("engine.max_schema_depth must be at least 1");
        }
        if engine.default_page_size == 0 || engine.max_page_size == 0 {
            return fail("engine page sizes must be at least 1");
        }
        if engine.default_page_size > engine.max_page_size {
            return fail("engine.default_page_size exceeds engine.max_page_size");
        }
        if engine.intersection_cache && engine.intersection_cache_capacity == 0 {
            return fail("engine.intersection_cache_capacity must be positive when the cache is enabled");
        }

        if self.logging.level.trim().is_empty() {
            return fail("logging.level is blank");
        }
        Ok(())
    }
}
