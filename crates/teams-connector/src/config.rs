use std::env;
use std::fmt;

use url::Url;

const ENV_APP_ID: &str = "MICROSOFT_APP_ID";
const ENV_APP_PASSWORD: &str = "MICROSOFT_APP_PASSWORD";
const ENV_AUTH_TENANT: &str = "CHANNEL_AUTH_TENANT";
const ENV_DEFAULT_SERVICE_URL: &str = "DEFAULT_SERVICE_URL";
const ENV_LOGIN_PROXY_URL: &str = "LOGIN_PROXY_URL";
const ENV_SERVICE_PROXY_URL: &str = "SERVICE_PROXY_URL";
const ENV_ENVIRONMENT: &str = "APP_ENVIRONMENT";

/// Public-cloud identity-provider authority. Sovereign clouds override it
/// via [`ConnectorSettings::with_login_authority`].
const DEFAULT_LOGIN_AUTHORITY: &str = "https://login.microsoftonline.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Application identity used against the identity provider. Immutable,
/// supplied once at startup; all fields are required non-empty.
#[derive(Clone)]
pub struct AppIdentity {
    app_id: String,
    app_secret: String,
    authority_tenant: String,
}

impl AppIdentity {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        authority_tenant: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let app_id = app_id.into();
        let app_secret = app_secret.into();
        let authority_tenant = authority_tenant.into();

        if app_id.is_empty() {
            return Err(ConfigError::MissingField(ENV_APP_ID));
        }
        if app_secret.is_empty() {
            return Err(ConfigError::MissingField(ENV_APP_PASSWORD));
        }
        if authority_tenant.is_empty() {
            return Err(ConfigError::MissingField(ENV_AUTH_TENANT));
        }

        Ok(Self {
            app_id,
            app_secret,
            authority_tenant,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    pub fn authority_tenant(&self) -> &str {
        &self.authority_tenant
    }
}

impl fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppIdentity")
            .field("app_id", &self.app_id)
            .field("app_secret", &"***")
            .field("authority_tenant", &self.authority_tenant)
            .finish()
    }
}

/// Validated settings consumed by the connector provider.
#[derive(Clone, Debug)]
pub struct ConnectorSettings {
    identity: AppIdentity,
    default_service_url: Url,
    login_authority: Url,
    login_proxy_url: Option<Url>,
    service_proxy_url: Option<Url>,
}

impl ConnectorSettings {
    pub fn new(identity: AppIdentity, default_service_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            identity,
            default_service_url: parse_absolute(ENV_DEFAULT_SERVICE_URL, default_service_url)?,
            login_authority: Url::parse(DEFAULT_LOGIN_AUTHORITY)
                .expect("default authority is a valid url"),
            login_proxy_url: None,
            service_proxy_url: None,
        })
    }

    /// Load and validate the full configuration surface from the process
    /// environment. Missing any required key is startup-fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let identity = AppIdentity::new(
            required_env(ENV_APP_ID)?,
            required_env(ENV_APP_PASSWORD)?,
            required_env(ENV_AUTH_TENANT)?,
        )?;
        let mut settings = Self::new(identity, &required_env(ENV_DEFAULT_SERVICE_URL)?)?;

        if let Some(proxy) = optional_env(ENV_LOGIN_PROXY_URL) {
            settings = settings.with_login_proxy(&proxy)?;
        }
        if let Some(proxy) = optional_env(ENV_SERVICE_PROXY_URL) {
            settings = settings.with_service_proxy(&proxy)?;
        }

        Ok(settings)
    }

    /// Route identity-provider calls through a forward proxy.
    pub fn with_login_proxy(mut self, proxy_url: &str) -> Result<Self, ConfigError> {
        self.login_proxy_url = Some(parse_absolute(ENV_LOGIN_PROXY_URL, proxy_url)?);
        Ok(self)
    }

    /// Route messaging-service calls through a forward proxy.
    pub fn with_service_proxy(mut self, proxy_url: &str) -> Result<Self, ConfigError> {
        self.service_proxy_url = Some(parse_absolute(ENV_SERVICE_PROXY_URL, proxy_url)?);
        Ok(self)
    }

    /// Override the identity-provider authority (sovereign clouds, tests).
    pub fn with_login_authority(mut self, authority: &str) -> Result<Self, ConfigError> {
        self.login_authority = parse_absolute("login authority", authority)?;
        Ok(self)
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    pub fn default_service_url(&self) -> &Url {
        &self.default_service_url
    }

    pub fn login_authority(&self) -> &Url {
        &self.login_authority
    }

    pub fn login_proxy_url(&self) -> Option<&Url> {
        self.login_proxy_url.as_ref()
    }

    pub fn service_proxy_url(&self) -> Option<&Url> {
        self.service_proxy_url.as_ref()
    }
}

/// Runtime environment the connector is provisioned for. Passed around as
/// an explicit value so the emulator branch stays testable in isolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Production,
    NonProduction,
}

impl Environment {
    /// Read `APP_ENVIRONMENT`; anything other than `production` is
    /// non-production, and an unset variable defaults to production.
    pub fn from_env() -> Self {
        match env::var(ENV_ENVIRONMENT) {
            Ok(value) if !value.eq_ignore_ascii_case("production") => Environment::NonProduction,
            _ => Environment::Production,
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingField(key)),
    }
}

fn optional_env(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_absolute(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: err.to_string(),
    })
}
