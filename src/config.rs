// ─────────────────────────────────────────────────────────────────────────────
// config.rs — environment-loaded settings
//
// Settings loading itself is out of scope (spec §1); this struct is only the
// concrete shape the out-of-scope loader must produce, per the enumerated
// variables in spec §6.
// ─────────────────────────────────────────────────────────────────────────────
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(v) => v == "true" || v == "1",
        None => default,
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_url: String,
    pub stream_url: String,
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct RedisConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Default)]
pub struct RabbitMqConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_expire_delta_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub redis: RedisConfig,
    pub mongo: MongoConfig,
    pub rabbitmq: RabbitMqConfig,
    pub bot: BotConfig,
    pub file_cache_dir: String,
    pub test: bool,
    pub debug: bool,
}

impl Config {
    /// Loads settings the way `main.rs` expects them to already be loaded —
    /// not a generic parser, just the fields this engine core needs.
    pub fn from_env() -> Self {
        Config {
            exchange: ExchangeConfig {
                api_url: env_var("API_URL").unwrap_or_else(|| "https://api.binance.com".to_string()),
                stream_url: env_var("STREAM_URL")
                    .unwrap_or_else(|| "wss://stream.binance.com:443/stream".to_string()),
                api_key: env_var("API_KEY").unwrap_or_default(),
                secret_key: env_var("SECRET_KEY").unwrap_or_default(),
            },
            redis: RedisConfig {
                host: env_var("REDIS_HOST"),
                port: env_var("REDIS_PORT").and_then(|v| v.parse().ok()),
                db: env_var("REDIS_DB").and_then(|v| v.parse().ok()),
            },
            mongo: MongoConfig {
                host: env_var("MONGO_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: env_var("MONGO_PORT").and_then(|v| v.parse().ok()).unwrap_or(27017),
                username: env_var("MONGO_USERNAME").unwrap_or_default(),
                password: env_var("MONGO_PASSWORD").unwrap_or_default(),
                database: env_var("MONGO_DATABASE").unwrap_or_else(|| "analyst".to_string()),
            },
            rabbitmq: RabbitMqConfig {
                host: env_var("RABBITMQ_HOST"),
                port: env_var("RABBITMQ_PORT").and_then(|v| v.parse().ok()),
                username: env_var("RABBITMQ_USERNAME"),
                password: env_var("RABBITMQ_PASSWORD"),
            },
            bot: BotConfig {
                server_host: env_var("BOT_SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                server_port: env_var("BOT_SERVER_PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
                jwt_secret: env_var("BOT_JWT_SECRET").unwrap_or_default(),
                jwt_algorithm: env_var("BOT_JWT_ALGORITHM").unwrap_or_else(|| "HS256".to_string()),
                jwt_expire_delta_seconds: env_var("BOT_JWT_EXPIRE_DELTA_SECONDS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            },
            file_cache_dir: env_var("FILE_CACHE_DIR").unwrap_or_else(|| "./cache".to_string()),
            test: env_bool("TEST", false),
            debug: env_bool("DEBUG", false),
        }
    }

    /// `test=true` routes Repository to `test_*` collections.
    pub fn strategies_collection(&self) -> &'static str {
        if self.test { "test_strategies" } else { "strategies" }
    }

    pub fn orders_collection(&self) -> &'static str {
        if self.test { "test_orders" } else { "orders" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_production_collections() {
        let cfg = Config {
            exchange: ExchangeConfig {
                api_url: String::new(),
                stream_url: String::new(),
                api_key: String::new(),
                secret_key: String::new(),
            },
            redis: RedisConfig::default(),
            mongo: MongoConfig {
                host: "x".into(),
                port: 27017,
                username: String::new(),
                password: String::new(),
                database: "x".into(),
            },
            rabbitmq: RabbitMqConfig::default(),
            bot: BotConfig {
                server_host: "x".into(),
                server_port: 0,
                jwt_secret: String::new(),
                jwt_algorithm: "HS256".into(),
                jwt_expire_delta_seconds: 0,
            },
            file_cache_dir: "x".into(),
            test: false,
            debug: false,
        };
        assert_eq!(cfg.strategies_collection(), "strategies");
        assert_eq!(cfg.orders_collection(), "orders");
    }
}
