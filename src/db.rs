// src/db.rs
use crate::error::{GatewayError, Result};
use crate::models::Credential;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::{query::Query, Session, SessionBuilder};
use std::sync::Arc;

pub async fn init(uri: &str) -> Result<Session> {
    let session = SessionBuilder::new()
        .known_node(uri)
        .build()
        .await
        .map_err(|e| GatewayError::Database(format!("failed to connect to {}: {}", uri, e)))?;

    session.query("CREATE KEYSPACE IF NOT EXISTS broker_gateway WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}", &[]).await?;
    session.query("CREATE TABLE IF NOT EXISTS broker_gateway.broker_credentials (user_id TEXT PRIMARY KEY, broker TEXT, client_id TEXT, api_key TEXT, api_secret TEXT, access_token TEXT, linked_at TIMESTAMP)", &[]).await?;

    info!("Successfully connected to ScyllaDB at {}.", uri);
    Ok(session)
}

/// Storage for users' broker links.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find(&self, user_id: &str) -> Result<Option<Credential>>;

    async fn upsert(&self, credential: &Credential) -> Result<()>;

    async fn update_access_token(&self, user_id: &str, access_token: &str) -> Result<()>;
}

/// Looks up a user's credential and insists on a usable access token.
pub async fn resolve(store: &dyn CredentialStore, user_id: &str) -> Result<Credential> {
    match store.find(user_id).await? {
        Some(credential)
            if credential
                .access_token
                .as_deref()
                .map_or(false, |t| !t.is_empty()) =>
        {
            Ok(credential)
        }
        Some(_) => {
            warn!("User {} has a broker link without an access token", user_id);
            Err(GatewayError::MissingCredentials(user_id.to_string()))
        }
        None => Err(GatewayError::MissingCredentials(user_id.to_string())),
    }
}

pub struct ScyllaCredentialStore {
    session: Arc<Session>,
}

impl ScyllaCredentialStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

fn text_column(row: &Row, index: usize) -> Option<String> {
    row.columns
        .get(index)
        .and_then(|c| c.as_ref())
        .and_then(|v| v.as_text())
        .cloned()
}

fn credential_from_row(user_id: &str, row: &Row) -> Result<Credential> {
    let required = |index: usize, name: &str| {
        text_column(row, index).ok_or_else(|| {
            GatewayError::Database(format!("credential for {} is missing {}", user_id, name))
        })
    };
    let linked_at = match row.columns.get(5).and_then(|c| c.as_ref()) {
        Some(CqlValue::Timestamp(ts)) => {
            DateTime::<Utc>::from_timestamp_millis(ts.num_milliseconds()).unwrap_or_default()
        }
        _ => DateTime::<Utc>::default(),
    };

    Ok(Credential {
        user_id: user_id.to_string(),
        broker: required(0, "broker")?,
        client_id: required(1, "client_id")?,
        api_key: required(2, "api_key")?,
        api_secret: required(3, "api_secret")?,
        access_token: text_column(row, 4),
        linked_at,
    })
}

#[async_trait]
impl CredentialStore for ScyllaCredentialStore {
    async fn find(&self, user_id: &str) -> Result<Option<Credential>> {
        let query = Query::new("SELECT broker, client_id, api_key, api_secret, access_token, linked_at FROM broker_gateway.broker_credentials WHERE user_id = ?");
        let result = self.session.query(query, (user_id,)).await?;
        match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => credential_from_row(user_id, &row).map(Some),
            None => Ok(None),
        }
    }

    async fn upsert(&self, credential: &Credential) -> Result<()> {
        let query = Query::new("INSERT INTO broker_gateway.broker_credentials (user_id, broker, client_id, api_key, api_secret, access_token, linked_at) VALUES (?, ?, ?, ?, ?, ?, ?)");
        self.session
            .query(
                query,
                (
                    credential.user_id.as_str(),
                    credential.broker.as_str(),
                    credential.client_id.as_str(),
                    credential.api_key.as_str(),
                    credential.api_secret.as_str(),
                    credential.access_token.clone(),
                    credential.linked_at.timestamp_millis(),
                ),
            )
            .await?;
        info!("Stored {} credentials for user {}", credential.broker, credential.user_id);
        Ok(())
    }

    async fn update_access_token(&self, user_id: &str, access_token: &str) -> Result<()> {
        if self.find(user_id).await?.is_none() {
            return Err(GatewayError::MissingCredentials(user_id.to_string()));
        }
        let query = Query::new(
            "UPDATE broker_gateway.broker_credentials SET access_token = ? WHERE user_id = ?",
        );
        self.session.query(query, (access_token, user_id)).await?;
        info!("Refreshed broker access token for user {}", user_id);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{credential, MemoryCredentialStore};
    use super::*;

    #[tokio::test]
    async fn resolve_requires_a_linked_account_with_token() {
        let store = MemoryCredentialStore::default();
        assert!(matches!(
            resolve(&store, "u1").await,
            Err(GatewayError::MissingCredentials(_))
        ));

        store.upsert(&credential("u1", None)).await.unwrap();
        assert!(matches!(
            resolve(&store, "u1").await,
            Err(GatewayError::MissingCredentials(_))
        ));

        store.update_access_token("u1", "fresh").await.unwrap();
        let resolved = resolve(&store, "u1").await.unwrap();
        assert_eq!(resolved.access_token.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn token_refresh_without_link_fails() {
        let store = MemoryCredentialStore::default();
        assert!(matches!(
            store.update_access_token("ghost", "t").await,
            Err(GatewayError::MissingCredentials(_))
        ));
    }
}
