use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "boltcard-server")]
#[command(about = "Boltcard tap-authorization and LNURL withdraw/pay server")]
#[command(version)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Public domain for LNURL callbacks (e.g., "cards.example.com")
    #[arg(long, env = "DOMAIN")]
    pub domain: String,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://boltcards.db")]
    pub database_url: String,

    /// Transaction limit in sats applied when a card is created without one
    #[arg(long, env = "DEFAULT_TX_LIMIT", default_value = "100000")]
    pub default_tx_limit: i64,

    /// Daily limit in sats applied when a card is created without one
    #[arg(long, env = "DEFAULT_DAY_LIMIT", default_value = "1000000")]
    pub default_day_limit: i64,

    /// Monthly limit in sats applied when a card is created without one
    #[arg(long, env = "DEFAULT_MONTH_LIMIT", default_value = "10000000")]
    pub default_month_limit: i64,
}

impl Config {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn withdraw_callback_url(&self, hit_id: &str) -> String {
        format!("https://{}/lnurl/cb/{}", self.domain, hit_id)
    }

    pub fn pay_callback_url(&self, hit_id: &str) -> String {
        format!("https://{}/lnurlp/cb/{}", self.domain, hit_id)
    }

    /// lnurlp:// form of the refund endpoint, for LUD-19 payLink fields.
    pub fn pay_link(&self, hit_id: &str) -> String {
        format!("lnurlp://{}/lnurlp/{}", self.domain, hit_id)
    }

    /// lnurlw:// base handed to the programming app during provisioning.
    pub fn scan_base(&self, external_id: &str) -> String {
        format!("lnurlw://{}/scan/{}", self.domain, external_id)
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        domain: "cards.test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        default_tx_limit: 100_000,
        default_day_limit: 1_000_000,
        default_month_limit: 10_000_000,
    }
}
