use serde::Deserialize;

/// Runtime environment the gateway itself runs in.
///
/// `test` puts the mock provider first in the dispatch order so that
/// `test-model` / `mock-*` requests never leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Development,
    Staging,
    Production,
    Test,
}

impl RuntimeEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnv::Development => "development",
            RuntimeEnv::Staging => "staging",
            RuntimeEnv::Production => "production",
            RuntimeEnv::Test => "test",
        }
    }

    fn parse(s: &str) -> RuntimeEnv {
        match s {
            "production" => RuntimeEnv::Production,
            "staging" => RuntimeEnv::Staging,
            "test" => RuntimeEnv::Test,
            _ => RuntimeEnv::Development,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub environment: RuntimeEnv,
    /// 64-char hex key for decrypting `enc:`-prefixed passthrough provider keys.
    pub master_key: String,
    pub openai_api_url: Option<String>,
    pub anthropic_api_url: Option<String>,
    pub ollama_api_url: Option<String>,
    pub lmstudio_api_url: Option<String>,
}

const PLACEHOLDER_MASTER_KEY: &str = "CHANGE_ME_32_BYTE_HEX_KEY";

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let environment = RuntimeEnv::parse(
        &std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),
    );

    let master_key =
        std::env::var("GATEWAY_MASTER_KEY").unwrap_or_else(|_| PLACEHOLDER_MASTER_KEY.into());

    if master_key == PLACEHOLDER_MASTER_KEY {
        if environment == RuntimeEnv::Production {
            anyhow::bail!(
                "GATEWAY_MASTER_KEY is still the insecure placeholder. \
                 Set a proper 64-char hex key before running in production."
            );
        }
        tracing::warn!(
            "GATEWAY_MASTER_KEY is not set — encrypted passthrough keys will not decrypt"
        );
    }

    Ok(Config {
        port: std::env::var("GATEWAY_PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse()
            .unwrap_or(8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/modelgate".into()),
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        environment,
        master_key,
        openai_api_url: std::env::var("OPENAI_API_URL").ok(),
        anthropic_api_url: std::env::var("ANTHROPIC_API_URL").ok(),
        ollama_api_url: std::env::var("OLLAMA_API_URL").ok(),
        lmstudio_api_url: std::env::var("LMSTUDIO_API_URL").ok(),
    })
}
