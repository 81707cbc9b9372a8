use crate::clickhouse_client::ClickHouseSettings;
use std::env;
use std::time::Duration;

/// Databases never listed to clients
pub const DEFAULT_EXCLUDED_DATABASES: [&str; 7] = [
    "system.indexes",
    "production",
    "local",
    "simprod_filecatalog",
    "config",
    "token_service",
    "admin",
];

#[derive(Debug, Clone)]
pub struct Config {
    // REST server
    pub rest_host: String,
    pub rest_port: u16,

    // ClickHouse configuration; the in-memory store is used when unset
    pub clickhouse: Option<ClickHouseSettings>,

    // Static bearer tokens
    pub production_token: String,
    pub web_token: String,

    pub excluded_databases: Vec<String>,

    // Per-test bound for the comparison endpoint
    pub test_timeout: Duration,
}

fn required(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("{} environment variable is required", name))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn mask(secret: &str, shown: usize) -> String {
    format!("{}***", secret.chars().take(shown).collect::<String>())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let clickhouse = env::var("MAD_DASH_CLICKHOUSE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| ClickHouseSettings {
                url,
                user: env::var("MAD_DASH_CLICKHOUSE_USER").ok(),
                password: env::var("MAD_DASH_CLICKHOUSE_PASSWORD").ok(),
                database: env::var("MAD_DASH_CLICKHOUSE_DATABASE")
                    .unwrap_or_else(|_| "default".to_string()),
            });

        let excluded_databases = match env::var("MAD_DASH_EXCLUDE_DBS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|db| !db.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => DEFAULT_EXCLUDED_DATABASES
                .iter()
                .map(|db| db.to_string())
                .collect(),
        };

        let production_token = required("MAD_DASH_PRODUCTION_TOKEN")?;
        let web_token = required("MAD_DASH_WEB_TOKEN")?;
        if production_token == web_token {
            return Err("MAD_DASH_PRODUCTION_TOKEN and MAD_DASH_WEB_TOKEN must differ".to_string());
        }

        Ok(Config {
            rest_host: env::var("MAD_DASH_REST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            rest_port: parsed("MAD_DASH_REST_PORT", 8080)?,
            clickhouse,
            production_token,
            web_token,
            excluded_databases,
            test_timeout: Duration::from_millis(parsed("MAD_DASH_TEST_TIMEOUT_MS", 10_000)?),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.rest_host, self.rest_port)
    }

    pub fn log_config(&self) {
        tracing::info!("📋 Configuration:");
        tracing::info!("   REST address: {}", self.bind_address());
        match &self.clickhouse {
            Some(clickhouse) => {
                tracing::info!("   ClickHouse URL: {}", clickhouse.url);
                if let Some(user) = &clickhouse.user {
                    tracing::info!("   ClickHouse User: {}", user);
                }
                if let Some(password) = &clickhouse.password {
                    tracing::info!("   ClickHouse Password: {}", mask(password, 2));
                }
                tracing::info!("   ClickHouse Database: {}", clickhouse.database);
            }
            None => tracing::info!("   Store: in-memory"),
        }
        tracing::info!("   Production Token: {}", mask(&self.production_token, 4));
        tracing::info!("   Web Token: {}", mask(&self.web_token, 4));
        tracing::info!("   Excluded Databases: {:?}", self.excluded_databases);
        tracing::info!("   Test Timeout: {:?}", self.test_timeout);
    }
}
