use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::clock::Clock;
use crate::domain::EntityType;
use crate::session::Session;

use super::{RemoteError, RemoteRecord, RemoteStore};

const SELECT_COLUMNS: &str = "id,data,deleted,updated_at";

/// PostgREST client for the hosted habit tables. Every table carries the same
/// shape: `id`, `owner_id`, `data` (json), `deleted`, and a server-maintained
/// `updated_at`. Row level security scopes reads and writes to the token's
/// owner; the owner filter sent here only narrows what is asked for.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    clock: Arc<dyn Clock>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Network(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            clock,
        })
    }

    fn table_url(&self, entity: EntityType) -> String {
        format!("{}/rest/v1/{}", self.base_url, entity.table())
    }

    fn authorize(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        let request = match &self.api_key {
            Some(key) => request.header("apikey", key),
            None => request,
        };
        request.bearer_auth(&session.access_token)
    }

    fn ensure_session(&self, session: &Session) -> Result<(), RemoteError> {
        if session.is_expired_at(self.clock.now()) {
            return Err(RemoteError::Auth(format!(
                "session for '{}' expired",
                session.owner_id
            )));
        }
        Ok(())
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Auth(format!("{status}: {body}")));
        }
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl RemoteStore for HttpRemote {
    fn fetch_since(
        &self,
        session: &Session,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.ensure_session(session)?;
        let mut query = vec![
            ("select", SELECT_COLUMNS.to_string()),
            ("owner_id", format!("eq.{}", session.owner_id)),
            ("order", "updated_at.asc".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("updated_at", format!("gt.{cursor}")));
        }

        let request = self.client.get(self.table_url(entity)).query(&query);
        let response = self.send(self.authorize(request, session))?;
        decode_rows(response)
    }

    fn push(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
        data: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.ensure_session(session)?;
        // No `deleted` column: merging into a tombstone must leave it deleted,
        // and the returned row then reports the tombstone back.
        let body = json!([{
            "id": id,
            "owner_id": session.owner_id,
            "data": data,
        }]);
        let request = self
            .client
            .post(self.table_url(entity))
            .query(&[("on_conflict", "owner_id,id")])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&body);
        let response = self.send(self.authorize(request, session))?;
        decode_rows(response)?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode(format!("upsert of {entity} '{id}' returned no row")))
    }

    fn delete(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
    ) -> Result<RemoteRecord, RemoteError> {
        self.ensure_session(session)?;
        let request = self
            .client
            .patch(self.table_url(entity))
            .query(&[
                ("id", format!("eq.{id}")),
                ("owner_id", format!("eq.{}", session.owner_id)),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "deleted": true }));
        let response = self.send(self.authorize(request, session))?;
        let record = decode_rows(response)?.into_iter().next();
        // Deleting a row the server never saw still leaves a tombstone locally.
        Ok(record.unwrap_or_else(|| RemoteRecord::tombstone(id, self.clock.now_rfc3339())))
    }
}

fn classify_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

fn decode_rows(response: Response) -> Result<Vec<RemoteRecord>, RemoteError> {
    let body = response
        .text()
        .map_err(|err| RemoteError::Decode(format!("failed to read body: {err}")))?;
    serde_json::from_str(&body).map_err(|err| RemoteError::Decode(format!("{err}: {body}")))
}
