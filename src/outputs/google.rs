//! Google Sheets backend.
//!
//! Authentication uses a service account key file: a JWT signed with the
//! account's RSA key is exchanged for a short-lived access token (OAuth 2.0
//! JWT bearer grant). The spreadsheet is found by name through the Drive
//! files search, and its first worksheet is read and appended to through the
//! Sheets v4 values API.

use super::sheet::{SheetStore, SinkError};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, instrument};

const SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DRIVE_FILES: &str = "https://www.googleapis.com/drive/v3/files";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// Refresh the token this long before it expires.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// The fields of a service account key file that we need.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self, SinkError> {
        let key: Self =
            serde_json::from_str(raw).map_err(|e| SinkError::InvalidKey(e.to_string()))?;
        if key.client_email.is_empty() || key.private_key.is_empty() {
            return Err(SinkError::InvalidKey(
                "client_email and private_key are required".to_string(),
            ));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DriveFiles {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<WorksheetEntry>,
}

#[derive(Debug, Deserialize)]
struct WorksheetEntry {
    properties: WorksheetProperties,
}

#[derive(Debug, Deserialize)]
struct WorksheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// The first worksheet of a spreadsheet located by name.
pub struct GoogleSheet {
    http: reqwest::Client,
    key: ServiceAccountKey,
    token: Option<AccessToken>,
    spreadsheet_id: String,
    worksheet: String,
}

impl fmt::Debug for GoogleSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleSheet")
            .field("key", &self.key)
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("worksheet", &self.worksheet)
            .finish_non_exhaustive()
    }
}

impl GoogleSheet {
    /// Authenticate with the key at `credentials` and open `sheet_name`.
    #[instrument(level = "info", skip_all, fields(credentials = %credentials.display(), %sheet_name))]
    pub async fn connect(credentials: &Path, sheet_name: &str) -> Result<Self, SinkError> {
        let raw = fs::read_to_string(credentials)
            .await
            .map_err(|source| SinkError::Credentials {
                path: credentials.display().to_string(),
                source,
            })?;
        let key = ServiceAccountKey::from_json(&raw)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let mut sheet = Self {
            http,
            key,
            token: None,
            spreadsheet_id: String::new(),
            worksheet: String::new(),
        };
        sheet.spreadsheet_id = sheet.find_spreadsheet(sheet_name).await?;
        sheet.worksheet = sheet.first_worksheet().await?;
        info!(
            spreadsheet_id = %sheet.spreadsheet_id,
            worksheet = %sheet.worksheet,
            "Connected to Google Sheet"
        );
        Ok(sheet)
    }

    async fn access_token(&mut self) -> Result<String, SinkError> {
        if let Some(token) = &self.token {
            if token.expires_at > Instant::now() + TOKEN_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SCOPES,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let token: TokenResponse = ensure_success(response, "token endpoint").await?.json().await?;
        let lifetime = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64);
        debug!(lifetime_secs = lifetime, "Obtained access token");

        self.token = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(token.access_token)
    }

    async fn find_spreadsheet(&mut self, name: &str) -> Result<String, SinkError> {
        let token = self.access_token().await?;
        let query = drive_query(name);
        let response = self
            .http
            .get(DRIVE_FILES)
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await?;
        let files: DriveFiles = ensure_success(response, "drive files").await?.json().await?;
        files
            .files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| SinkError::NotFound(name.to_string()))
    }

    async fn first_worksheet(&mut self) -> Result<String, SinkError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{SHEETS_API}/{}", self.spreadsheet_id))
            .bearer_auth(token)
            .query(&[("fields", "sheets.properties.title")])
            .send()
            .await?;
        let meta: SpreadsheetMeta = ensure_success(response, "spreadsheet metadata")
            .await?
            .json()
            .await?;
        meta.sheets
            .into_iter()
            .next()
            .map(|s| s.properties.title)
            .ok_or_else(|| SinkError::NotFound(self.spreadsheet_id.clone()))
    }

    fn values_url(&self) -> String {
        format!(
            "{SHEETS_API}/{}/values/{}",
            self.spreadsheet_id,
            worksheet_range(&self.worksheet)
        )
    }
}

impl SheetStore for GoogleSheet {
    #[instrument(level = "debug", skip_all)]
    async fn read_all(&mut self) -> Result<Vec<Vec<String>>, SinkError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.values_url())
            .bearer_auth(token)
            .send()
            .await?;
        let range: ValueRange = ensure_success(response, "values.get").await?.json().await?;
        let rows = values_to_rows(range.values);
        debug!(rows = rows.len(), "Read Google Sheet");
        Ok(rows)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SinkError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}:append", self.values_url()))
            .bearer_auth(token)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&append_body(rows))
            .send()
            .await?;
        ensure_success(response, "values.append").await?;
        Ok(())
    }
}

async fn ensure_success(
    response: reqwest::Response,
    context: &'static str,
) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Api {
        context,
        status,
        body,
    })
}

/// Drive search expression for a spreadsheet named exactly `name`.
fn drive_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!("name = '{escaped}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false")
}

/// A1 range covering a whole worksheet, percent-encoded for the URL path.
fn worksheet_range(title: &str) -> String {
    urlencoding::encode(&format!("'{}'", title.replace('\'', "''"))).into_owned()
}

/// Cells come back as JSON values; numbers and booleans are stringified.
fn values_to_rows(values: Vec<Vec<Value>>) -> Vec<Vec<String>> {
    values
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| match cell {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect()
}

fn append_body(rows: &[Vec<String>]) -> Value {
    json!({ "values": rows })
}
