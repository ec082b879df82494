// Environment-derived configuration. Everything has a default except the
// three secrets; a production boot with a placeholder secret is refused.

use std::time::Duration;

const MIN_SECRET_LEN: usize = 32;
const PLACEHOLDER_MARKER: &str = "CHANGE_ME";

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub production: bool,

    pub jwt_secret: String,
    pub encryption_key: String,
    pub hmac_secret: String,

    /// Target zone-cell edge in meters; picks the default obfuscation
    /// resolution (closest supported cell size wins).
    pub location_grid_size_meters: u32,
    pub code_ttl_minutes: u32,
    pub code_max_attempts: u32,
    pub otp_ttl_seconds: u32,
    pub otp_length: u32,

    pub retention_days_location: u32,
    pub retention_days_delivery: u32,
    pub retention_days_audit: u32,

    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub cors_origin: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{0} must be at least {MIN_SECRET_LEN} characters")]
    TooShort(&'static str),
    #[error("{0} still contains the {PLACEHOLDER_MARKER} placeholder; refusing to boot in production")]
    Placeholder(&'static str),
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required_secret(name: &'static str, production: bool) -> Result<String, ConfigError> {
    let value = std::env::var(name).map_err(|_| ConfigError::Missing(name))?;
    if value.len() < MIN_SECRET_LEN {
        return Err(ConfigError::TooShort(name));
    }
    if production && value.contains(PLACEHOLDER_MARKER) {
        return Err(ConfigError::Placeholder(name));
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let production = std::env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("PORT", 3001),
            production,
            jwt_secret: required_secret("JWT_SECRET", production)?,
            encryption_key: required_secret("ENCRYPTION_KEY", production)?,
            hmac_secret: required_secret("HMAC_SECRET", production)?,
            location_grid_size_meters: env_or("LOCATION_GRID_SIZE_METERS", 500),
            code_ttl_minutes: env_or("CODE_TTL_MINUTES", 30),
            code_max_attempts: env_or("CODE_MAX_ATTEMPTS", 5),
            otp_ttl_seconds: env_or("OTP_TTL_SECONDS", 300),
            otp_length: env_or("OTP_LENGTH", 6),
            retention_days_location: env_or("RETENTION_DAYS_LOCATION", 30),
            retention_days_delivery: env_or("RETENTION_DAYS_DELIVERY", 365),
            retention_days_audit: env_or("RETENTION_DAYS_AUDIT", 2555),
            rate_limit_window_ms: env_or("RATE_LIMIT_WINDOW_MS", 60_000),
            rate_limit_max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 100),
            cors_origin: std::env::var("CORS_ORIGIN").ok(),
        })
    }

    /// OTP token length, clamped to the supported 4..=8 digits.
    pub fn otp_digits(&self) -> u32 {
        self.otp_length.clamp(4, 8)
    }

    /// OTP validity window, clamped to 60..=900 seconds.
    pub fn otp_step(&self) -> Duration {
        Duration::from_secs(u64::from(self.otp_ttl_seconds.clamp(60, 900)))
    }

    /// Hand-off code lifetime, clamped to 5 minutes..=24 hours.
    pub fn code_ttl(&self) -> chrono::Duration {
        let minutes = i64::from(self.code_ttl_minutes).clamp(5, 24 * 60);
        chrono::Duration::minutes(minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_secret(tag: &str) -> String {
        format!("{tag}-0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_required_secret_rejects_short_values() {
        std::env::set_var("TEST_SECRET_SHORT", "tiny");
        let err = required_secret("TEST_SECRET_SHORT", false).unwrap_err();
        assert!(matches!(err, ConfigError::TooShort(_)));
    }

    #[test]
    fn test_required_secret_rejects_placeholder_in_production() {
        std::env::set_var(
            "TEST_SECRET_PLACEHOLDER",
            "CHANGE_ME_0123456789abcdef0123456789abcdef",
        );
        assert!(required_secret("TEST_SECRET_PLACEHOLDER", false).is_ok());
        let err = required_secret("TEST_SECRET_PLACEHOLDER", true).unwrap_err();
        assert!(matches!(err, ConfigError::Placeholder(_)));
    }

    #[test]
    fn test_required_secret_accepts_real_value() {
        std::env::set_var("TEST_SECRET_OK", long_secret("ok"));
        assert!(required_secret("TEST_SECRET_OK", true).is_ok());
    }

    #[test]
    fn test_clamps() {
        std::env::set_var("JWT_SECRET", long_secret("jwt"));
        std::env::set_var("ENCRYPTION_KEY", long_secret("enc"));
        std::env::set_var("HMAC_SECRET", long_secret("mac"));
        std::env::set_var("OTP_TTL_SECONDS", "5");
        std::env::set_var("OTP_LENGTH", "12");
        std::env::set_var("CODE_TTL_MINUTES", "1");
        let cfg = Config::from_env().expect("config should load");
        assert_eq!(cfg.otp_step(), Duration::from_secs(60));
        assert_eq!(cfg.otp_digits(), 8);
        assert_eq!(cfg.code_ttl(), chrono::Duration::minutes(5));
    }
}
