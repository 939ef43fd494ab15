use std::{env, fs, path::PathBuf, time::Duration};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const DEFAULT_CORS_ORIGINS: &[&str] =
    &["http://localhost:5173", "http://localhost:3000", "http://localhost:8000"];

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    server: ServerSettings,
    runtime: RuntimeSettings,
    api: ApiSettings,
    security: SecuritySettings,
    cors: CorsSettings,
    database: DatabaseSettings,
    storage: StorageSettings,
    s3: S3Settings,
    certificate: CertificateSettings,
    housekeeping: HousekeepingSettings,
    admin: AdminSettings,
    telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    host: ServerHost,
    port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) api_prefix: String,
    pub(crate) app_url: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SecuritySettings {
    pub(crate) secret_key: String,
    pub(crate) access_token_expire_minutes: u64,
    pub(crate) algorithm: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
    pub(crate) max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageDriver {
    Local,
    S3,
}

#[derive(Debug, Clone)]
pub(crate) struct StorageSettings {
    pub(crate) driver: StorageDriver,
    pub(crate) local_root: String,
    pub(crate) public_url: String,
    pub(crate) max_upload_size_mb: u64,
    pub(crate) allowed_image_extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct S3Settings {
    pub(crate) endpoint: String,
    pub(crate) access_key: String,
    pub(crate) secret_key: String,
    pub(crate) bucket: String,
    pub(crate) region: String,
    pub(crate) public_url: Option<String>,
}

/// Template texts and issuance limits for certificate artifacts.
#[derive(Debug, Clone)]
pub(crate) struct CertificateSettings {
    pub(crate) font_path: String,
    pub(crate) issuer: String,
    pub(crate) authority_line: String,
    pub(crate) director_name: String,
    pub(crate) director_title: String,
    pub(crate) qr_size: u32,
    pub(crate) qr_caption: String,
    pub(crate) allocation_max_retries: u32,
    pub(crate) artifact_workers: usize,
    pub(crate) artifact_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct HousekeepingSettings {
    pub(crate) cleanup_interval_seconds: u64,
    pub(crate) cleanup_max_attempts: i32,
    pub(crate) pending_retry_after_seconds: u64,
    pub(crate) reconcile_interval_seconds: u64,
    pub(crate) reconcile_grace_minutes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct AdminSettings {
    pub(crate) first_superuser_email: String,
    pub(crate) first_superuser_password: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Test => "test",
        }
    }

    fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("CERTREG_HOST", "0.0.0.0");
        let port = env_or_default("CERTREG_PORT", "8000");

        let environment = parse_environment(env_optional("CERTREG_ENV"));
        let strict_config =
            env_optional("CERTREG_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Certificate Registry");
        let api_prefix = env_or_default("API_PREFIX", "/api");
        let app_url =
            env_or_default("APP_URL", "http://localhost:8000").trim_end_matches('/').to_string();

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret_key(),
        };
        let access_token_expire_minutes = parse_u64(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            env_or_default("ACCESS_TOKEN_EXPIRE_MINUTES", "10080"),
        )?;
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "certreg");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "certreg");
        let database_url = env_optional("DATABASE_URL");
        let max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "30"),
        )?;

        let driver = parse_storage_driver(env_or_default("STORAGE_DRIVER", "local"))?;
        let local_root = env_or_default("STORAGE_LOCAL_ROOT", "storage/app/public");
        let storage_public_url = env_optional("STORAGE_PUBLIC_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{app_url}/storage"));
        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "2"))?;
        let allowed_image_extensions = parse_string_list(
            env_optional("ALLOWED_IMAGE_EXTENSIONS"),
            &["jpg", "jpeg", "png", "gif"],
        );

        let s3_endpoint = env_or_default("S3_ENDPOINT", "http://localhost:9000");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "certificates");
        let s3_region = env_or_default("S3_REGION", "us-east-1");
        let s3_public_url =
            env_optional("S3_PUBLIC_URL").map(|value| value.trim_end_matches('/').to_string());

        let font_path =
            env_or_default("CERTIFICATE_FONT_PATH", "resources/fonts/RobotoMedium.ttf");
        let issuer = env_or_default("CERTIFICATE_ISSUER", "DON STROY PROJECT");
        let authority_line = env_or_default(
            "CERTIFICATE_AUTHORITY_LINE",
            "O`ZBEKISTON RESPUBLIKASI OLIY TA`LIM, FAN VA INNOVATSIYALAR VAZIRLIGI",
        );
        let director_name = env_or_default("CERTIFICATE_DIRECTOR_NAME", "Muminov A.U.");
        let director_title = env_or_default("CERTIFICATE_DIRECTOR_TITLE", "MCHJ direktori");
        let qr_size = parse_u32("QR_SIZE", env_or_default("QR_SIZE", "300"))?;
        let qr_caption = env_or_default("QR_CAPTION", "QR kod orqali tekshiring");
        let allocation_max_retries =
            parse_u32("ALLOCATION_MAX_RETRIES", env_or_default("ALLOCATION_MAX_RETRIES", "5"))?;
        let artifact_workers =
            parse_u64("ARTIFACT_WORKERS", env_or_default("ARTIFACT_WORKERS", "4"))? as usize;
        let artifact_timeout_seconds = parse_u64(
            "ARTIFACT_TIMEOUT_SECONDS",
            env_or_default("ARTIFACT_TIMEOUT_SECONDS", "30"),
        )?;

        let cleanup_interval_seconds = parse_u64(
            "CLEANUP_INTERVAL_SECONDS",
            env_or_default("CLEANUP_INTERVAL_SECONDS", "30"),
        )?;
        let cleanup_max_attempts =
            parse_u32("CLEANUP_MAX_ATTEMPTS", env_or_default("CLEANUP_MAX_ATTEMPTS", "10"))? as i32;
        let pending_retry_after_seconds = parse_u64(
            "PENDING_RETRY_AFTER_SECONDS",
            env_or_default("PENDING_RETRY_AFTER_SECONDS", "300"),
        )?;
        let reconcile_interval_seconds = parse_u64(
            "RECONCILE_INTERVAL_SECONDS",
            env_or_default("RECONCILE_INTERVAL_SECONDS", "3600"),
        )?;
        let reconcile_grace_minutes =
            parse_u64("RECONCILE_GRACE_MINUTES", env_or_default("RECONCILE_GRACE_MINUTES", "60"))?;

        let first_superuser_email = env_or_default("FIRST_SUPERUSER_EMAIL", "admin@example.com");
        let first_superuser_password = env_or_default("FIRST_SUPERUSER_PASSWORD", "");

        let log_level = env_or_default("CERTREG_LOG_LEVEL", "info");
        let json =
            env_optional("CERTREG_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, api_prefix, app_url },
            security: SecuritySettings { secret_key, access_token_expire_minutes, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            storage: StorageSettings {
                driver,
                local_root,
                public_url: storage_public_url,
                max_upload_size_mb,
                allowed_image_extensions,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
                public_url: s3_public_url,
            },
            certificate: CertificateSettings {
                font_path,
                issuer,
                authority_line,
                director_name,
                director_title,
                qr_size,
                qr_caption,
                allocation_max_retries,
                artifact_workers,
                artifact_timeout_seconds,
            },
            housekeeping: HousekeepingSettings {
                cleanup_interval_seconds,
                cleanup_max_attempts,
                pending_retry_after_seconds,
                reconcile_interval_seconds,
                reconcile_grace_minutes,
            },
            admin: AdminSettings { first_superuser_email, first_superuser_password },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn certificate(&self) -> &CertificateSettings {
        &self.certificate
    }

    pub(crate) fn housekeeping(&self) -> &HousekeepingSettings {
        &self.housekeeping
    }

    pub(crate) fn admin(&self) -> &AdminSettings {
        &self.admin
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.allowed_image_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_IMAGE_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }
        for extension in &self.storage.allowed_image_extensions {
            if !is_supported_image_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_IMAGE_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        if self.certificate.artifact_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ARTIFACT_WORKERS",
                value: String::from("0"),
            });
        }
        if self.certificate.qr_size < 64 {
            return Err(ConfigError::InvalidValue {
                field: "QR_SIZE",
                value: self.certificate.qr_size.to_string(),
            });
        }
        if !(self.api.app_url.starts_with("http://") || self.api.app_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "APP_URL",
                value: self.api.app_url.clone(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.storage.driver == StorageDriver::S3
            && (self.s3.access_key.is_empty() || self.s3.secret_key.is_empty())
        {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        if self.admin.first_superuser_password.is_empty() {
            return Err(ConfigError::MissingSecret("FIRST_SUPERUSER_PASSWORD"));
        }

        Ok(())
    }
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl CertificateSettings {
    pub(crate) fn artifact_timeout(&self) -> Duration {
        Duration::from_secs(self.artifact_timeout_seconds)
    }
}

impl ServerHost {
    fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }
        Ok(Self(value))
    }
}

impl ServerPort {
    fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }
        Ok(Self(parsed))
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_storage_driver(value: String) -> Result<StorageDriver, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "local" | "public" | "fs" => Ok(StorageDriver::Local),
        "s3" => Ok(StorageDriver::S3),
        _ => Err(ConfigError::InvalidValue { field: "STORAGE_DRIVER", value }),
    }
}

fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = value else {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    };

    if raw.trim().is_empty() {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    }

    if raw.trim_start().starts_with('[') {
        let parsed: Vec<String> =
            serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?;
        if parsed.is_empty() {
            return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
        }
        return Ok(parsed);
    }

    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    }

    Ok(items)
}

fn parse_string_list(value: Option<String>, defaults: &[&str]) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(|item| item.trim().to_ascii_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
        None => defaults.iter().map(|item| item.to_string()).collect(),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|val| val.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

fn is_supported_image_extension(extension: &str) -> bool {
    matches!(extension, "jpg" | "jpeg" | "png" | "webp" | "gif")
}

fn load_or_create_secret_key() -> String {
    let path = secret_file_path();

    if let Ok(value) = fs::read_to_string(&path) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let new_key = generate_secret_key();

    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            tracing::warn!(
                error = %err,
                path = %parent.display(),
                "Failed to create secret key directory"
            );
        }
    }

    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(err) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
                    tracing::warn!(
                        error = %err,
                        path = %path.display(),
                        "Failed to set secret key file permissions"
                    );
                }
            }
            if let Err(err) = std::io::Write::write_all(&mut file, new_key.as_bytes()) {
                tracing::warn!(
                    error = %err,
                    path = %path.display(),
                    "Failed to write secret key file"
                );
            }
            return new_key;
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if let Ok(value) = fs::read_to_string(&path) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                path = %path.display(),
                "Failed to create secret key file"
            );
        }
    }

    new_key
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; 64];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn secret_file_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".secret_key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cors_origins_json() {
        let raw = "[\"http://a\",\"http://b\"]".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors json");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_csv() {
        let raw = "http://a, http://b".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors csv");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_defaults_on_empty() {
        let parsed = parse_cors_origins(Some(" ".to_string())).expect("cors empty");
        let defaults: Vec<String> =
            DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect();
        assert_eq!(parsed, defaults);
    }

    #[test]
    fn parse_storage_driver_variants() {
        assert_eq!(parse_storage_driver("local".to_string()).unwrap(), StorageDriver::Local);
        assert_eq!(parse_storage_driver("S3".to_string()).unwrap(), StorageDriver::S3);
        assert!(matches!(
            parse_storage_driver("ftp".to_string()),
            Err(ConfigError::InvalidValue { field: "STORAGE_DRIVER", .. })
        ));
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }
}
