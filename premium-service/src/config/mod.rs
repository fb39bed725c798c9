use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{Money, Plan, Provider};

#[derive(Clone, Debug)]
pub struct Config {
    pub common: core_config::Config,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub signature: ServiceSignatureConfig,
    pub paypal: PaypalConfig,
    pub mpesa: MpesaConfig,
    pub pricing: PlanPricing,
    pub providers: ProviderHttpConfig,
    pub sweep: SweepConfig,
    pub service_name: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

#[derive(Clone, Debug)]
pub struct ServiceSignatureConfig {
    pub enabled: bool,
    pub secret: Secret<String>,
    pub expiry_seconds: usize,
}

#[derive(Clone, Debug)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    /// Webhook id registered with PayPal; required to verify callbacks.
    pub webhook_id: Option<String>,
    pub api_base_url: String,
    pub brand_name: String,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub passkey: Secret<String>,
    pub shortcode: String,
    pub api_base_url: String,
    /// Public URL Daraja posts STK results to (without the token query).
    pub callback_url: String,
    /// Shared secret appended to the callback URL as `?token=`.
    pub callback_secret: Secret<String>,
    pub currency: String,
    pub transaction_desc: String,
}

#[derive(Clone, Debug)]
pub struct ProviderPrices {
    pub monthly: Money,
    pub annual: Money,
}

impl ProviderPrices {
    pub fn for_plan(&self, plan: Plan) -> &Money {
        match plan {
            Plan::Monthly => &self.monthly,
            Plan::Annual => &self.annual,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlanPricing {
    pub paypal: ProviderPrices,
    pub mpesa: ProviderPrices,
}

impl PlanPricing {
    pub fn price(&self, provider: Provider, plan: Plan) -> Money {
        match provider {
            Provider::Paypal => self.paypal.for_plan(plan).clone(),
            Provider::Mpesa => self.mpesa.for_plan(plan).clone(),
        }
    }
}

impl Default for PlanPricing {
    fn default() -> Self {
        Self {
            paypal: ProviderPrices {
                monthly: Money::new(999, "USD"),
                annual: Money::new(9999, "USD"),
            },
            mpesa: ProviderPrices {
                monthly: Money::from_major(1299, "KES"),
                annual: Money::from_major(12999, "KES"),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderHttpConfig {
    /// Whole-request timeout for every provider call. Expiry is reported as
    /// `ProviderUnavailable`, never as a payment failure.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on backoff retries when starting a charge.
    pub charge_retry_max_elapsed: Duration,
}

impl Default for ProviderHttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            charge_retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub paypal_grace: chrono::Duration,
    pub mpesa_grace: chrono::Duration,
    /// Pending longer than this raises an operator alert.
    pub alert_after: chrono::Duration,
    /// Pending longer than this (and still pending at the provider) is
    /// cancelled. `None` keeps such attempts pending.
    pub abandon_after: Option<chrono::Duration>,
    pub batch_size: i64,
}

impl SweepConfig {
    pub fn grace_for(&self, provider: Provider) -> chrono::Duration {
        match provider {
            Provider::Paypal => self.paypal_grace,
            Provider::Mpesa => self.mpesa_grace,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            paypal_grace: chrono::Duration::minutes(15),
            mpesa_grace: chrono::Duration::minutes(15),
            alert_after: chrono::Duration::hours(24),
            abandon_after: None,
            batch_size: 100,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} has an invalid value", key))),
        Err(_) => Ok(default),
    }
}

fn price_var(key: &str, currency: &str, default: &Money) -> Result<Money, AppError> {
    match env::var(key) {
        Ok(raw) => Money::parse(&raw, currency)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e))),
        Err(_) => Ok(Money::new(default.minor_units, currency)),
    }
}

fn paypal_base_url(environment: &str) -> &'static str {
    if environment == "production" {
        "https://api-m.paypal.com"
    } else {
        "https://api-m.sandbox.paypal.com"
    }
}

fn mpesa_base_url(environment: &str) -> &'static str {
    if environment == "production" {
        "https://api.safaricom.co.ke"
    } else {
        "https://sandbox.safaricom.co.ke"
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let mut common = core_config::Config::load()?;
        if let Ok(level) = env::var("LOG_LEVEL") {
            common.log_level = level;
        }
        if let Ok(endpoint) = env::var("OTLP_ENDPOINT") {
            common.otlp_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }

        let host = var_or("PREMIUM_SERVICE_HOST", "0.0.0.0");
        let port = parse_var("PREMIUM_SERVICE_PORT", common.port)?;

        let db_url = env::var("PREMIUM_DATABASE_URL").map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("PREMIUM_DATABASE_URL must be set"))
        })?;
        let db_name = var_or("PREMIUM_DATABASE_NAME", "premium_db");

        let redis_url = var_or("PREMIUM_REDIS_URL", "redis://localhost:6379");

        let signature_secret = var_or("PREMIUM_SIGNATURE_SECRET", "dev-secret");
        let signature_enabled = parse_var("PREMIUM_SIGNATURE_ENABLED", false)?;

        let base_url = var_or("PREMIUM_BASE_URL", "http://localhost:3000");

        let paypal_env = var_or("PAYPAL_ENVIRONMENT", "sandbox");
        let paypal = PaypalConfig {
            client_id: var_or("PAYPAL_CLIENT_ID", ""),
            client_secret: Secret::new(var_or("PAYPAL_CLIENT_SECRET", "")),
            webhook_id: env::var("PAYPAL_WEBHOOK_ID").ok().filter(|s| !s.is_empty()),
            api_base_url: var_or("PAYPAL_API_BASE_URL", paypal_base_url(&paypal_env)),
            brand_name: var_or("PAYPAL_BRAND_NAME", "NextScene Nova"),
            return_url: var_or(
                "PAYPAL_RETURN_URL",
                &format!("{}/premium/paypal/return", base_url),
            ),
            cancel_url: var_or(
                "PAYPAL_CANCEL_URL",
                &format!("{}/premium/paypal/cancel", base_url),
            ),
        };

        let mpesa_env = var_or("MPESA_ENVIRONMENT", "sandbox");
        let mpesa_currency = var_or("MPESA_CURRENCY", "KES");
        let mpesa = MpesaConfig {
            consumer_key: var_or("MPESA_CONSUMER_KEY", ""),
            consumer_secret: Secret::new(var_or("MPESA_CONSUMER_SECRET", "")),
            passkey: Secret::new(var_or("MPESA_PASSKEY", "")),
            shortcode: var_or("MPESA_SHORTCODE", ""),
            api_base_url: var_or("MPESA_API_BASE_URL", mpesa_base_url(&mpesa_env)),
            callback_url: format!("{}/webhooks/mpesa", base_url),
            callback_secret: Secret::new(var_or("MPESA_CALLBACK_SECRET", "")),
            currency: mpesa_currency.clone(),
            transaction_desc: var_or("MPESA_TRANSACTION_DESC", "Premium Subscription"),
        };

        let defaults = PlanPricing::default();
        let paypal_currency = var_or("PAYPAL_CURRENCY", "USD");
        let pricing = PlanPricing {
            paypal: ProviderPrices {
                monthly: price_var("PAYPAL_MONTHLY_PRICE", &paypal_currency, &defaults.paypal.monthly)?,
                annual: price_var("PAYPAL_ANNUAL_PRICE", &paypal_currency, &defaults.paypal.annual)?,
            },
            mpesa: ProviderPrices {
                monthly: price_var("MPESA_MONTHLY_PRICE", &mpesa_currency, &defaults.mpesa.monthly)?,
                annual: price_var("MPESA_ANNUAL_PRICE", &mpesa_currency, &defaults.mpesa.annual)?,
            },
        };

        let providers = ProviderHttpConfig {
            request_timeout: Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECONDS", 15)?),
            connect_timeout: Duration::from_secs(parse_var("PROVIDER_CONNECT_TIMEOUT_SECONDS", 5)?),
            charge_retry_max_elapsed: Duration::from_secs(parse_var(
                "CHARGE_RETRY_MAX_ELAPSED_SECONDS",
                10,
            )?),
        };

        let abandon_hours: Option<i64> = env::var("SWEEP_ABANDON_HOURS")
            .ok()
            .map(|raw| {
                raw.parse().map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("SWEEP_ABANDON_HOURS has an invalid value"))
                })
            })
            .transpose()?;

        let sweep = SweepConfig {
            enabled: parse_var("SWEEP_ENABLED", true)?,
            interval: Duration::from_secs(parse_var("SWEEP_INTERVAL_SECONDS", 300)?),
            paypal_grace: chrono::Duration::minutes(parse_var("SWEEP_GRACE_MINUTES_PAYPAL", 15)?),
            mpesa_grace: chrono::Duration::minutes(parse_var("SWEEP_GRACE_MINUTES_MPESA", 15)?),
            alert_after: chrono::Duration::hours(parse_var("SWEEP_ALERT_HOURS", 24)?),
            abandon_after: abandon_hours.map(chrono::Duration::hours),
            batch_size: parse_var("SWEEP_BATCH_SIZE", 100)?,
        };

        Ok(Self {
            common,
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            redis: RedisConfig {
                url: Secret::new(redis_url),
            },
            signature: ServiceSignatureConfig {
                enabled: signature_enabled,
                secret: Secret::new(signature_secret),
                expiry_seconds: 300,
            },
            paypal,
            mpesa,
            pricing,
            providers,
            sweep,
            service_name: "premium-service".to_string(),
        })
    }
}

impl PaypalConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }
}

impl MpesaConfig {
    pub fn is_configured(&self) -> bool {
        !self.consumer_key.is_empty()
            && !self.consumer_secret.expose_secret().is_empty()
            && !self.shortcode.is_empty()
            && !self.passkey.expose_secret().is_empty()
    }
}
