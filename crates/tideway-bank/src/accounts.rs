// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the account balance service.
//!
//! Endpoints:
//! - `GET /accounts/{id}` returns `{"balance": n}`
//! - `POST /accounts/{id}/withdraw` and `/deposit` take `{"amount": n}`
//! - `GET /health`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tideway_core::ActivityFailure;

/// Environment variable holding the balance service base URL.
pub const ACCOUNTS_URL_ENV: &str = "TIDEWAY_ACCOUNTS_URL";

/// Base URL used when nothing is configured.
pub const DEFAULT_ACCOUNTS_URL: &str = "http://127.0.0.1:5000";

/// Errors from the balance service.
#[derive(Debug, thiserror::Error)]
pub enum AccountsError {
    /// The account does not exist.
    #[error("account '{account_id}' not found")]
    NotFound {
        /// Requested account.
        account_id: String,
    },

    /// The service answered with a non-success status.
    #[error("balance service rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The request did not complete.
    #[error("balance service unreachable: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body had an unexpected shape.
    #[error("unexpected response from balance service: {0}")]
    Decode(String),
}

impl AccountsError {
    /// Whether the request ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Network(e) if e.is_timeout())
    }
}

impl From<AccountsError> for ActivityFailure {
    fn from(err: AccountsError) -> Self {
        if err.is_timeout() {
            return ActivityFailure::timeout(err.to_string());
        }
        match err {
            AccountsError::Network(_) => ActivityFailure::network(err.to_string()),
            _ => ActivityFailure::application(err.to_string()),
        }
    }
}

/// A completed withdrawal or deposit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Balance before the operation.
    pub previous_balance: f64,
    /// Balance after the operation.
    pub new_balance: f64,
}

/// Operations the bank activities need from the balance service.
#[async_trait]
pub trait AccountsApi: Send + Sync {
    /// Current balance of an account.
    async fn balance(&self, account_id: &str) -> Result<f64, AccountsError>;

    /// Take `amount` out of an account.
    async fn withdraw(&self, account_id: &str, amount: f64) -> Result<Transaction, AccountsError>;

    /// Put `amount` into an account.
    async fn deposit(&self, account_id: &str, amount: f64) -> Result<Transaction, AccountsError>;

    /// Check that the service is up.
    async fn health(&self) -> Result<(), AccountsError>;
}

#[derive(Deserialize)]
struct BalanceBody {
    balance: f64,
}

/// [`AccountsApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAccounts {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccounts {
    /// Client for the service at `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AccountsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tideway-bank/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use a preconfigured reqwest client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn account_url(&self, account_id: &str, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{}/accounts/{}/{}", self.base_url, account_id, action),
            None => format!("{}/accounts/{}", self.base_url, account_id),
        }
    }

    async fn transact(
        &self,
        account_id: &str,
        action: &str,
        amount: f64,
    ) -> Result<Transaction, AccountsError> {
        let response = self
            .client
            .post(self.account_url(account_id, Some(action)))
            .json(&serde_json::json!({ "amount": amount }))
            .send()
            .await?;
        let response = check_status(response, account_id).await?;
        response
            .json::<Transaction>()
            .await
            .map_err(|e| AccountsError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response, account_id: &str) -> Result<Response, AccountsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AccountsError::NotFound {
            account_id: account_id.to_string(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(AccountsError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl AccountsApi for HttpAccounts {
    async fn balance(&self, account_id: &str) -> Result<f64, AccountsError> {
        let response = self
            .client
            .get(self.account_url(account_id, None))
            .send()
            .await?;
        let response = check_status(response, account_id).await?;
        let body: BalanceBody = response
            .json()
            .await
            .map_err(|e| AccountsError::Decode(e.to_string()))?;
        Ok(body.balance)
    }

    async fn withdraw(&self, account_id: &str, amount: f64) -> Result<Transaction, AccountsError> {
        self.transact(account_id, "withdraw", amount).await
    }

    async fn deposit(&self, account_id: &str, amount: f64) -> Result<Transaction, AccountsError> {
        self.transact(account_id, "deposit", amount).await
    }

    async fn health(&self) -> Result<(), AccountsError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        check_status(response, "").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_core::FailureKind;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn accounts(server: &MockServer) -> HttpAccounts {
        HttpAccounts::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_balance() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/account_A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account_number": "account_A",
                "balance": 1000.0
            })))
            .mount(&mock_server)
            .await;

        let balance = accounts(&mock_server).balance("account_A").await.unwrap();
        assert_eq!(balance, 1000.0);
    }

    #[tokio::test]
    async fn test_withdraw_posts_amount() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/account_A/withdraw"))
            .and(body_json(serde_json::json!({"amount": 100.0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account_number": "account_A",
                "previous_balance": 1000.0,
                "amount_withdrawn": 100.0,
                "new_balance": 900.0
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tx = accounts(&mock_server)
            .withdraw("account_A", 100.0)
            .await
            .unwrap();
        assert_eq!(
            tx,
            Transaction {
                previous_balance: 1000.0,
                new_balance: 900.0
            }
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/nobody"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "Account not found"})),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/account_B/withdraw"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "Insufficient funds"})),
            )
            .mount(&mock_server)
            .await;

        let api = accounts(&mock_server);
        let err = api.balance("nobody").await.unwrap_err();
        assert!(matches!(err, AccountsError::NotFound { ref account_id } if account_id == "nobody"));

        let err = api.withdraw("account_B", 1e9).await.unwrap_err();
        match &err {
            AccountsError::Rejected { status, message } => {
                assert_eq!(*status, 400);
                assert_eq!(message, "Insufficient funds");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ActivityFailure::from(err).kind, FailureKind::ApplicationError);
    }

    #[tokio::test]
    async fn test_slow_service_is_a_timeout_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/account_B/deposit"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"previous_balance": 1.0, "new_balance": 2.0})),
            )
            .mount(&mock_server)
            .await;

        let api = HttpAccounts::new(mock_server.uri(), Duration::from_millis(100)).unwrap();
        let err = api.deposit("account_B", 1.0).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(ActivityFailure::from(err).kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_health_and_unreachable_service() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        accounts(&mock_server).health().await.unwrap();

        let api = HttpAccounts::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = api.health().await.unwrap_err();
        assert!(matches!(err, AccountsError::Network(_)));
        assert_eq!(ActivityFailure::from(err).kind, FailureKind::NetworkError);
    }
}
