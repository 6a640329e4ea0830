//! Dexcom Share source.
//!
//! Talks to the Dexcom Share web services used by the follower apps:
//! - POST General/AuthenticatePublisherAccount (username -> account id)
//! - POST General/LoginPublisherAccountById (account id -> session id)
//! - POST Publisher/ReadPublisherLatestGlucoseValues (session -> readings)
//!
//! The session id is cached and renewed once when Dexcom reports it as
//! invalid or unknown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{UpstreamError, UpstreamReadingSource};
use crate::config::{DexcomSettings, SettingsError};
use crate::models::{GlucoseReading, TrendCategory};
use crate::validation::validate_reading;

const AUTHENTICATE_ENDPOINT: &str = "General/AuthenticatePublisherAccount";
const LOGIN_ENDPOINT: &str = "General/LoginPublisherAccountById";
const READINGS_ENDPOINT: &str = "Publisher/ReadPublisherLatestGlucoseValues";

/// Returned by Dexcom in place of an id when a login silently fails
const NULL_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Window searched for the latest reading
const READINGS_WINDOW_MINUTES: u32 = 10;

/// Dexcom Share deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexcomRegion {
    Us,
    Ous,
    Jp,
}

impl DexcomRegion {
    pub fn base_url(&self) -> &'static str {
        match self {
            DexcomRegion::Us => "https://share2.dexcom.com/ShareWebServices/Services",
            DexcomRegion::Ous => "https://shareous1.dexcom.com/ShareWebServices/Services",
            DexcomRegion::Jp => "https://share.dexcom.jp/ShareWebServices/Services",
        }
    }

    pub fn application_id(&self) -> &'static str {
        match self {
            DexcomRegion::Us | DexcomRegion::Ous => "d89443d2-327c-4a6f-89e5-496bbb0317db",
            DexcomRegion::Jp => "d8665ade-9673-4e27-9ff6-92db4ce13d13",
        }
    }
}

impl FromStr for DexcomRegion {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "us" => Ok(DexcomRegion::Us),
            "ous" => Ok(DexcomRegion::Ous),
            "jp" => Ok(DexcomRegion::Jp),
            _ => Err(SettingsError::ParseError("DEXCOM_REGION".to_string())),
        }
    }
}

/// Share login identity: either a username to resolve or a known account id
#[derive(Debug, Clone)]
enum Identity {
    Username(String),
    AccountId(String),
}

/// Glucose entry as returned by Share
#[derive(Debug, Deserialize)]
struct ShareGlucose {
    /// System time, `Date(<epoch ms>)`
    #[serde(rename = "WT")]
    wt: String,
    #[serde(rename = "Value")]
    value: i32,
    /// Trend name (current API) or numeric code (legacy API)
    #[serde(rename = "Trend", default)]
    trend: Value,
}

#[derive(Debug, Deserialize)]
struct ShareErrorBody {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

pub struct DexcomShareSource {
    base_url: String,
    application_id: &'static str,
    identity: Identity,
    password: String,
    client: Client,
    timeout: Duration,
    session: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    account_id: Option<String>,
    session_id: Option<String>,
}

impl DexcomShareSource {
    pub fn from_settings(settings: &DexcomSettings, timeout: Duration) -> Result<Self, SettingsError> {
        let region: DexcomRegion = settings.region.parse()?;

        let identity = match (&settings.account_id, &settings.username) {
            (Some(account_id), _) => Identity::AccountId(account_id.clone()),
            (None, Some(username)) => Identity::Username(username.clone()),
            (None, None) => return Err(SettingsError::MissingCredentials),
        };

        let password = settings
            .password
            .clone()
            .ok_or(SettingsError::MissingCredentials)?;

        info!(region = ?region, "Dexcom Share source configured");

        Ok(Self::with_base_url(
            region.base_url().to_string(),
            region.application_id(),
            identity,
            password,
            timeout,
        ))
    }

    fn with_base_url(
        base_url: String,
        application_id: &'static str,
        identity: Identity,
        password: String,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url,
            application_id,
            identity,
            password,
            client: Client::new(),
            timeout,
            session: Mutex::new(SessionState::default()),
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let mut request = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .query(query)
            .timeout(self.timeout);

        request = match body {
            Some(body) => request.json(&body),
            None => request.header(CONTENT_TYPE, "application/json").body("{}"),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout.as_millis() as u64)
            } else {
                UpstreamError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            UpstreamError::InvalidResponse(format!("Failed to read response body: {}", e))
        })?;

        if !status.is_success() {
            return Err(decode_error(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            UpstreamError::InvalidResponse(format!("Failed to parse {} response: {}", endpoint, e))
        })
    }

    async fn resolve_account_id(&self) -> Result<String, UpstreamError> {
        let username = match &self.identity {
            Identity::AccountId(account_id) => return Ok(account_id.clone()),
            Identity::Username(username) => username,
        };

        let account_id: String = self
            .post(
                AUTHENTICATE_ENDPOINT,
                &[],
                Some(json!({
                    "accountName": username,
                    "password": self.password,
                    "applicationId": self.application_id,
                })),
            )
            .await?;

        non_null_id(account_id, "account id")
    }

    async fn login(&self, account_id: &str) -> Result<String, UpstreamError> {
        let session_id: String = self
            .post(
                LOGIN_ENDPOINT,
                &[],
                Some(json!({
                    "accountId": account_id,
                    "password": self.password,
                    "applicationId": self.application_id,
                })),
            )
            .await?;

        non_null_id(session_id, "session id")
    }

    /// Current session id, logging in when none is cached
    async fn session_id(&self) -> Result<String, UpstreamError> {
        let mut session = self.session.lock().await;

        if let Some(session_id) = &session.session_id {
            return Ok(session_id.clone());
        }

        let account_id = match &session.account_id {
            Some(account_id) => account_id.clone(),
            None => self.resolve_account_id().await?,
        };
        let session_id = self.login(&account_id).await?;

        debug!("Dexcom Share session established");
        session.account_id = Some(account_id);
        session.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Drop the session id; the resolved account id stays valid
    async fn invalidate_session(&self) {
        self.session.lock().await.session_id = None;
    }

    async fn read_latest(&self, session_id: &str) -> Result<GlucoseReading, UpstreamError> {
        let entries: Vec<ShareGlucose> = self
            .post(
                READINGS_ENDPOINT,
                &[
                    ("sessionId", session_id.to_string()),
                    ("minutes", READINGS_WINDOW_MINUTES.to_string()),
                    ("maxCount", "1".to_string()),
                ],
                None,
            )
            .await?;

        let entry = entries.into_iter().next().ok_or(UpstreamError::NoReading)?;
        let timestamp = parse_share_date(&entry.wt)?;

        let mut reading = GlucoseReading::new(entry.value, timestamp);
        if let Some(trend) = parse_trend(&entry.trend) {
            reading = reading.with_trend(trend);
        }

        validate_reading(&reading)?;
        Ok(reading)
    }
}

#[async_trait]
impl UpstreamReadingSource for DexcomShareSource {
    fn name(&self) -> &str {
        "dexcom"
    }

    async fn fetch_latest(&self) -> Result<GlucoseReading, UpstreamError> {
        let session_id = self.session_id().await?;

        match self.read_latest(&session_id).await {
            Err(UpstreamError::SessionExpired) => {
                warn!("Dexcom Share session expired, logging in again");
                self.invalidate_session().await;
                let session_id = self.session_id().await?;
                self.read_latest(&session_id).await
            }
            other => other,
        }
    }
}

fn non_null_id(id: String, what: &str) -> Result<String, UpstreamError> {
    if id.is_empty() || id == NULL_ID {
        return Err(UpstreamError::Authentication(format!("Dexcom returned no {}", what)));
    }
    Ok(id)
}

/// Map a Share error body onto an upstream error
fn decode_error(status: u16, body: &str) -> UpstreamError {
    let parsed: Option<ShareErrorBody> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(ShareErrorBody { code, message }) => (
            code.unwrap_or_default(),
            message.unwrap_or_else(|| body.to_string()),
        ),
        None => (String::new(), body.to_string()),
    };

    match code.as_str() {
        "SessionNotValid" | "SessionIdNotFound" => UpstreamError::SessionExpired,
        "AccountPasswordInvalid" | "SSO_AuthenticateAccountNotFound" | "SSO_AuthenticatePasswordInvalid"
        | "SSO_AuthenticateMaxAttemptsExceeed" => UpstreamError::Authentication(message),
        _ => UpstreamError::Rejected { status, message },
    }
}

/// Parse `Date(1691455258000)` or `Date(1691455258000-0400)` into UTC
fn parse_share_date(raw: &str) -> Result<DateTime<Utc>, UpstreamError> {
    let invalid = || UpstreamError::InvalidResponse(format!("Invalid Share timestamp '{}'", raw));

    let inner = raw
        .trim()
        .strip_prefix("Date(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(invalid)?;

    // Epoch millis are already UTC; a trailing offset is informational only
    let digits_end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .unwrap_or(inner.len());

    let millis: i64 = inner[..digits_end].parse().map_err(|_| invalid())?;
    DateTime::from_timestamp_millis(millis).ok_or_else(invalid)
}

/// Map a Share trend (name or legacy numeric code) onto a trend category
fn parse_trend(raw: &Value) -> Option<TrendCategory> {
    let name = match raw {
        Value::String(name) => name.as_str(),
        Value::Number(code) => match code.as_u64()? {
            1 => "DoubleUp",
            2 => "SingleUp",
            3 => "FortyFiveUp",
            4 => "Flat",
            5 => "FortyFiveDown",
            6 => "SingleDown",
            7 => "DoubleDown",
            _ => return None,
        },
        _ => return None,
    };

    match name {
        "DoubleUp" | "SingleUp" => Some(TrendCategory::RapidUp),
        "FortyFiveUp" => Some(TrendCategory::ModerateUp),
        "Flat" => Some(TrendCategory::Stable),
        "FortyFiveDown" => Some(TrendCategory::ModerateDown),
        "SingleDown" | "DoubleDown" => Some(TrendCategory::RapidDown),
        // None, NotComputable, RateOutOfRange
        _ => None,
    }
}
