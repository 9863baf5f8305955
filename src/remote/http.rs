//! HTTP client for the remote authority.
//!
//! Routes:
//! - POST /tenants/:tenant/tabs
//! - POST /tabs/:id/items
//! - POST /tabs/:id/close
//! - POST /tabs/:id/cancel
//! - GET  /tabs/:id
//! - GET  /tenants/:tenant/changes (SSE, one `change` event per ChangeEvent)
//! - GET  /health

use super::{
    ChangeEvent, ChangeStream, CreatedLineItem, CreatedTab, FetchedTab, NewTab, RemoteAuthority,
    RemoteError,
};
use crate::identity::LocalId;
use crate::model::{ItemDraft, PaymentInfo};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use reqwest_eventsource::{Event, EventSource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct CreateTabBody<'a> {
    local_id: &'a LocalId,
    #[serde(flatten)]
    tab: &'a NewTab,
}

#[derive(Serialize)]
struct AddItemBody<'a> {
    local_id: &'a LocalId,
    #[serde(flatten)]
    item: &'a ItemDraft,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    reason: Option<&'a str>,
}

pub struct HttpAuthority {
    client: Client,
    /// No request timeout: the change feed stays open indefinitely
    feed_client: Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(format!("client setup failed: {}", e)))?;
        let feed_client = Client::builder()
            .build()
            .map_err(|e| RemoteError::Transient(format!("client setup failed: {}", e)))?;
        Ok(Self {
            client,
            feed_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Cheap reachability check used by the connectivity probe.
    pub async fn probe(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("[remote] Health probe failed: {}", e);
                false
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("malformed response: {}", e)))
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Transient("request timed out".to_string())
    } else {
        RemoteError::Transient(e.to_string())
    }
}

/// Map an error status to a failure class. Authentication failures are
/// treated as transient: credentials may be refreshed without dropping work.
fn classify(status: StatusCode, body: String) -> RemoteError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::CONFLICT => RemoteError::Conflict(detail),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Rejected(detail)
        }
        _ => RemoteError::Transient(detail),
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn create_tab(
        &self,
        local_id: &LocalId,
        tenant_id: &str,
        payload: &NewTab,
    ) -> Result<CreatedTab, RemoteError> {
        let body = CreateTabBody {
            local_id,
            tab: payload,
        };
        let url = self.url(&format!("/tenants/{}/tabs", tenant_id));
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn add_line_item(
        &self,
        local_id: &LocalId,
        tab_ref: &str,
        payload: &ItemDraft,
    ) -> Result<CreatedLineItem, RemoteError> {
        let body = AddItemBody {
            local_id,
            item: payload,
        };
        let url = self.url(&format!("/tabs/{}/items", tab_ref));
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn close_tab(&self, tab_ref: &str, payment: &PaymentInfo) -> Result<(), RemoteError> {
        let url = self.url(&format!("/tabs/{}/close", tab_ref));
        self.send(self.client.post(url).json(payment)).await?;
        Ok(())
    }

    async fn cancel_tab(&self, tab_ref: &str, reason: Option<&str>) -> Result<(), RemoteError> {
        let url = self.url(&format!("/tabs/{}/cancel", tab_ref));
        self.send(self.client.post(url).json(&CancelBody { reason }))
            .await?;
        Ok(())
    }

    async fn fetch_tab(&self, tab_ref: &str) -> Result<FetchedTab, RemoteError> {
        let url = self.url(&format!("/tabs/{}", tab_ref));
        self.send_json(self.client.get(url)).await
    }

    async fn subscribe(&self, tenant_id: &str) -> Result<ChangeStream, RemoteError> {
        let url = self.url(&format!("/tenants/{}/changes", tenant_id));
        let request = self.feed_client.get(url);
        let mut source = EventSource::new(request)
            .map_err(|e| RemoteError::Transient(format!("cannot open change feed: {}", e)))?;

        let stream = async_stream::stream! {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Event::Open) => {
                        tracing::info!("[remote] Change feed connected");
                    }
                    Ok(Event::Message(message)) => {
                        if message.event != "change" && message.event != "message" {
                            continue;
                        }
                        match serde_json::from_str::<ChangeEvent>(&message.data) {
                            Ok(event) => yield Ok(event),
                            Err(e) => {
                                tracing::warn!("[remote] Skipping malformed change event: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        source.close();
                        yield Err(RemoteError::Transient(format!("change feed: {}", e)));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify(StatusCode::CONFLICT, "already closed".into()),
            RemoteError::Conflict(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, String::new()),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, String::new()),
            RemoteError::Transient(_)
        ));
    }

    #[test]
    fn test_create_body_carries_local_id() {
        let local = LocalId::mint();
        let tab = NewTab {
            number: 3,
            opened_at: chrono::Utc::now(),
        };
        let body = serde_json::to_value(CreateTabBody {
            local_id: &local,
            tab: &tab,
        })
        .unwrap();
        assert_eq!(body["local_id"], local.as_uuid().to_string());
        assert_eq!(body["number"], 3);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let authority = HttpAuthority::new("http://hub.local:7000/", Duration::from_secs(1)).unwrap();
        assert_eq!(authority.url("/health"), "http://hub.local:7000/health");
    }
}
