//! HTTP client for the sync and message listing APIs.
//!
//! [`SyncApi`] and [`MessagesApi`] are the seams the sync loop and the core
//! talk to; [`HttpApi`] implements both over `reqwest`. Listing pages are
//! verified here, before anything downstream sees them. The sync contract
//! is checked on the headers here and on the body by the sync loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use seqline_shared::constants::{
    HEADER_SYNC_PROTOCOL, HEADER_SYNC_WATERMARK, SYNC_PROTOCOL_VERSION, SYNC_WATERMARK_FIELD,
};
use seqline_shared::error::{ContractError, CursorError};
use seqline_shared::protocol::{
    verify_context, verify_page, AckRequest, AckResponse, ContextPage, ContextQuery,
    DifferenceRequest, DifferenceResponse, MessagePage, PageQuery, StateResponse, UpdatesQuery,
    UpdatesResponse,
};
use seqline_shared::{ChatId, ErrorCode};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication rejected (HTTP {0})")]
    Auth(u16),

    #[error("Sync contract violation: {0}")]
    Contract(#[from] ContractError),

    #[error("Cursor contract violation: {0}")]
    Cursor(#[from] CursorError),

    #[error("Not found")]
    NotFound,

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthError,
            Self::Contract(_) => ErrorCode::ProtocolContractViolation,
            Self::Cursor(_) => ErrorCode::CursorContractViolation,
            Self::NotFound => ErrorCode::NotFound,
            Self::Http { code: Some(code), .. } => *code,
            Self::Http { .. } | Self::Cancelled => ErrorCode::Internal,
            Self::Network(_) => ErrorCode::TransportUnavailable,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn state(&self) -> Result<StateResponse, ApiError>;
    async fn difference(&self, pts: u64, limit: u32) -> Result<DifferenceResponse, ApiError>;
    async fn updates(&self, pts: u64, timeout: Duration) -> Result<UpdatesResponse, ApiError>;
    async fn ack(&self, pts: u64) -> Result<AckResponse, ApiError>;
}

#[async_trait]
pub trait MessagesApi: Send + Sync {
    async fn page(&self, chat: &ChatId, query: PageQuery) -> Result<MessagePage, ApiError>;
    async fn context(
        &self,
        chat: &ChatId,
        seq: u64,
        limit: Option<u32>,
    ) -> Result<ContextPage, ApiError>;
}

/// Extra time a long-poll request gets on top of its server-side timeout.
const POLL_GRACE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct HttpApi {
    http: reqwest::Client,
    base: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(base: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        sync_contract: bool,
    ) -> Result<T, ApiError> {
        let req = match self.token.read().await.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth(status.as_u16()));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let code = body
                .get("code")
                .and_then(|c| serde_json::from_value::<ErrorCode>(c.clone()).ok());
            // A 403 without a more specific code is a rejected credential.
            if status == StatusCode::FORBIDDEN
                && matches!(code, None | Some(ErrorCode::AuthError))
            {
                return Err(ApiError::Auth(status.as_u16()));
            }
            return Err(ApiError::Http {
                status: status.as_u16(),
                code,
                message: body
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        if sync_contract {
            check_contract_headers(resp.headers())?;
        }
        let body = resp.bytes().await?;
        decode_body(&body, sync_contract)
    }
}

/// A success body of the wrong shape breaks the contract of its endpoint;
/// it is not retried like a network failure.
fn decode_body<T: DeserializeOwned>(body: &[u8], sync_contract: bool) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        if sync_contract {
            ApiError::Contract(ContractError::MalformedBody(e.to_string()))
        } else {
            ApiError::Cursor(CursorError::MalformedBody(e.to_string()))
        }
    })
}

/// Reject responses whose contract headers disagree with this build.
/// Absent headers are left to the body check.
pub fn check_contract_headers(headers: &HeaderMap) -> Result<(), ContractError> {
    if let Some(raw) = headers.get(HEADER_SYNC_PROTOCOL) {
        let version = raw.to_str().ok().and_then(|v| v.trim().parse::<u32>().ok());
        if version != Some(SYNC_PROTOCOL_VERSION) {
            return Err(ContractError::ProtocolVersion {
                expected: SYNC_PROTOCOL_VERSION,
                actual: version,
            });
        }
    }
    if let Some(raw) = headers.get(HEADER_SYNC_WATERMARK) {
        let field = raw.to_str().ok().map(str::to_string);
        if field.as_deref() != Some(SYNC_WATERMARK_FIELD) {
            return Err(ContractError::WatermarkField {
                expected: SYNC_WATERMARK_FIELD,
                actual: field,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl SyncApi for HttpApi {
    async fn state(&self) -> Result<StateResponse, ApiError> {
        let req = self.http.get(self.url("/sync/state")).timeout(REQUEST_TIMEOUT);
        self.execute(req, true).await
    }

    async fn difference(&self, pts: u64, limit: u32) -> Result<DifferenceResponse, ApiError> {
        let req = self
            .http
            .post(self.url("/sync/difference"))
            .timeout(REQUEST_TIMEOUT)
            .json(&DifferenceRequest {
                pts,
                limit: Some(limit),
            });
        self.execute(req, true).await
    }

    async fn updates(&self, pts: u64, timeout: Duration) -> Result<UpdatesResponse, ApiError> {
        let query = UpdatesQuery {
            pts,
            timeout: Some(timeout.as_millis() as u64),
        };
        let req = self
            .http
            .get(self.url("/sync/updates"))
            .timeout(timeout + POLL_GRACE)
            .query(&query);
        self.execute(req, true).await
    }

    async fn ack(&self, pts: u64) -> Result<AckResponse, ApiError> {
        let req = self
            .http
            .post(self.url("/sync/ack"))
            .timeout(REQUEST_TIMEOUT)
            .json(&AckRequest { pts });
        self.execute(req, true).await
    }
}

#[async_trait]
impl MessagesApi for HttpApi {
    async fn page(&self, chat: &ChatId, query: PageQuery) -> Result<MessagePage, ApiError> {
        let req = self
            .http
            .get(self.url(&format!("/messages/chat/{chat}")))
            .timeout(REQUEST_TIMEOUT)
            .query(&query);
        let page: MessagePage = self.execute(req, false).await?;
        verify_page(chat, &page).map_err(|e| {
            debug!(chat = %chat, error = %e, "Discarding page");
            e
        })?;
        Ok(page)
    }

    async fn context(
        &self,
        chat: &ChatId,
        seq: u64,
        limit: Option<u32>,
    ) -> Result<ContextPage, ApiError> {
        let query = ContextQuery {
            chat_id: chat.to_string(),
            seq,
            limit,
        };
        let req = self
            .http
            .get(self.url("/messages/context"))
            .timeout(REQUEST_TIMEOUT)
            .query(&query);
        let page: ContextPage = self.execute(req, false).await?;
        verify_context(chat, &page)?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn contract_headers_must_match_when_present() {
        let mut headers = HeaderMap::new();
        assert!(check_contract_headers(&headers).is_ok());

        headers.insert(HEADER_SYNC_PROTOCOL, HeaderValue::from_static("2"));
        headers.insert(HEADER_SYNC_WATERMARK, HeaderValue::from_static("updateId"));
        assert!(check_contract_headers(&headers).is_ok());

        headers.insert(HEADER_SYNC_PROTOCOL, HeaderValue::from_static("3"));
        assert!(matches!(
            check_contract_headers(&headers),
            Err(ContractError::ProtocolVersion { actual: Some(3), .. })
        ));

        headers.insert(HEADER_SYNC_PROTOCOL, HeaderValue::from_static("2"));
        headers.insert(HEADER_SYNC_WATERMARK, HeaderValue::from_static("pts"));
        assert!(matches!(
            check_contract_headers(&headers),
            Err(ContractError::WatermarkField { .. })
        ));
    }

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(ApiError::Auth(401).code(), ErrorCode::AuthError);
        assert_eq!(
            ApiError::Cursor(CursorError::NonMonotonic { index: 2 }).code(),
            ErrorCode::CursorContractViolation
        );
        let muted = ApiError::Http {
            status: 403,
            code: Some(ErrorCode::NotAMember),
            message: String::new(),
        };
        assert_eq!(muted.code(), ErrorCode::NotAMember);
        assert!(!muted.is_auth());
    }

    #[test]
    fn malformed_bodies_are_contract_errors() {
        let err = decode_body::<StateResponse>(b"{\"pts\":\"soon\"}", true).unwrap_err();
        assert!(matches!(err, ApiError::Contract(ContractError::MalformedBody(_))));
        assert_eq!(err.code(), ErrorCode::ProtocolContractViolation);

        let err = decode_body::<MessagePage>(b"<html>", false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CursorContractViolation);
    }

    #[test]
    fn base_url_is_normalized() {
        let api = HttpApi::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(api.url("/sync/state"), "http://127.0.0.1:8080/sync/state");
    }
}
