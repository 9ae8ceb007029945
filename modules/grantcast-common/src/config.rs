use anyhow::Result;

/// Application configuration loaded from environment variables.
/// Secrets and env-specific values only; queue topology and model chains
/// are fixed in code.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database (also backs the KV cache and job queue)
    pub database_url: String,

    // AI providers
    pub openai_api_key: String,
    pub anthropic_api_key: Option<String>,

    // Video analysis provider (Google file API or compatible)
    pub video_analysis_api_key: Option<String>,

    // Result cache switch. Dedup state is always on; this only gates the
    // read-through caches for AI analyses and media descriptions.
    pub cache_enabled: bool,

    // Inbound API
    pub api_host: String,
    pub api_port: u16,
    pub job_api_key: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")?,
            openai_api_key: std::env::var("OPENAI_API_KEY")?,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            video_analysis_api_key: std::env::var("VIDEO_ANALYSIS_API_KEY").ok(),
            cache_enabled: std::env::var("CACHE_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            api_host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3030".to_string())
                .parse()
                .unwrap_or(3030),
            job_api_key: std::env::var("JOB_API_KEY")?,
        };

        config.log_redacted();
        Ok(config)
    }

    fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!(
            openai = %preview(&self.openai_api_key),
            anthropic = %preview_opt(&self.anthropic_api_key),
            video = %preview_opt(&self.video_analysis_api_key),
            cache_enabled = self.cache_enabled,
            "Config loaded"
        );
    }
}

/// First few characters of a secret for log output. Counts characters,
/// not bytes, so multibyte values never split mid-character.
fn preview(val: &str) -> String {
    let head: String = val.chars().take(5).collect();
    format!("{}...({} chars)", head, val.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_only_a_short_head() {
        assert_eq!(preview("sk-proj-abcdef"), "sk-pr...(14 chars)");
        assert_eq!(preview("ab"), "ab...(2 chars)");
    }

    #[test]
    fn preview_handles_multibyte_values() {
        // A byte-indexed slice would panic on this input.
        assert_eq!(preview("秘密のかぎです"), "秘密のかぎ...(7 chars)");
    }
}
