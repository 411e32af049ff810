use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: String, // "duckdb"
    pub connection_string: String,
    pub pool_size: usize,
    pub query_timeout_secs: u64,
    pub max_result_rows: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// Settings for a single LLM provider. A provider without credentials
/// (or, for ollama, without `enabled`) is left out of the fallback chain.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    // Fallback order is fixed: anthropic, then openai, then ollama.
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub ollama: ProviderConfig,
    pub retry_attempts: u32,
    pub retry_min_wait_ms: u64,
    pub retry_max_wait_ms: u64,
    pub temperature: f32,
    pub max_tokens: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    #[default]
    None,
    Keyword,
    Llm,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchemaConfig {
    pub cache_ttl_secs: u64,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub descriptions_path: Option<PathBuf>,
    pub selection_mode: SelectionMode,
    pub max_selected_tables: usize,
    /// Token budget shared by schema DDL and conversation history.
    pub context_token_budget: usize,
    /// Fraction of the budget reserved for conversation history.
    pub history_share: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String, // "memory" or "duckdb"
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnomalyConfig {
    pub flag_empty_aggregates: bool,
    pub aggregate_functions: Vec<String>,
    pub non_negative_columns: Vec<String>,
    pub flag_limit_mismatch: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_correction_attempts: u32,
    pub max_tool_iterations: u32,
    pub max_plan_steps: usize,
    pub max_synthesis_attempts: u32,
    /// Rows kept per analytical step result.
    pub step_row_cap: usize,
    pub top_k: usize,
    pub anomaly: AnomalyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
    /// Key clients on the `x-client-id` header instead of the peer address.
    /// Only safe behind a proxy that sets the header itself.
    pub trust_client_header: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String, // "text" or "json"
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub schema: SchemaConfig,
    pub storage: StorageConfig,
    pub query_cache: QueryCacheConfig,
    pub pipeline: PipelineConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-sql/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NLSQL__LLM__ANTHROPIC__API_KEY=... and friends
        config_builder = config_builder.add_source(
            Environment::with_prefix("NLSQL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("schema.include_tables")
                .with_list_parse_key("schema.exclude_tables")
                .with_list_parse_key("pipeline.anomaly.non_negative_columns")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }

        Ok(config)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: "duckdb".to_string(),
            connection_string: "nl-sql.duckdb".to_string(),
            pool_size: 5,
            query_timeout_secs: 30,
            max_result_rows: 1000,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig {
                model: "claude-sonnet-4-5".to_string(),
                ..ProviderConfig::default()
            },
            openai: ProviderConfig {
                model: "gpt-4o".to_string(),
                ..ProviderConfig::default()
            },
            ollama: ProviderConfig {
                model: "qwen2.5-coder".to_string(),
                ..ProviderConfig::default()
            },
            retry_attempts: 3,
            retry_min_wait_ms: 2000,
            retry_max_wait_ms: 10_000,
            temperature: 0.0,
            max_tokens: 4096,
            request_timeout_secs: 60,
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            descriptions_path: None,
            selection_mode: SelectionMode::None,
            max_selected_tables: 15,
            context_token_budget: 8000,
            history_share: 0.25,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: "pipeline.duckdb".to_string(),
        }
    }
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 86_400,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            flag_empty_aggregates: true,
            aggregate_functions: ["COUNT(", "SUM(", "AVG(", "MIN(", "MAX("]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            non_negative_columns: [
                "count", "total", "amount", "price", "age", "quantity", "sum", "avg",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            flag_limit_mismatch: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_correction_attempts: 2,
            max_tool_iterations: 8,
            max_plan_steps: 7,
            max_synthesis_attempts: 1,
            step_row_cap: 20,
            top_k: 100,
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
            trust_client_header: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
        }
    }
}
