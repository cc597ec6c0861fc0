//! Minimal Stripe REST client (form-encoded requests, JSON responses)

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
}

/// Subset of a Stripe subscription object
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
    pub customer: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(http: Client, api_base: &str, secret_key: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    /// Client for the configured account; 503 when no key is set
    pub fn from_state(state: &AppState) -> Result<Self> {
        let secret_key = state
            .config
            .stripe_secret_key
            .as_deref()
            .ok_or(AppError::NotConfigured("Stripe"))?;
        Ok(Self::new(state.http.clone(), &state.config.stripe_api_base, secret_key))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.secret_key).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Upstream(format!(
                "Stripe API error ({}): {}",
                status, error_text
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to parse Stripe response: {}", e)))
    }

    pub async fn create_customer(&self, email: &str, user_id: Uuid) -> Result<StripeCustomer> {
        let request = self
            .http
            .post(format!("{}/v1/customers", self.api_base))
            .form(&[
                ("email", email.to_string()),
                ("metadata[user_id]", user_id.to_string()),
            ]);
        self.send(request).await
    }

    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        trial_days: i32,
    ) -> Result<StripeSubscription> {
        let mut form = vec![
            ("customer", customer_id.to_string()),
            ("items[0][price]", price_id.to_string()),
        ];
        if trial_days > 0 {
            form.push(("trial_period_days", trial_days.to_string()));
        }

        let request = self
            .http
            .post(format!("{}/v1/subscriptions", self.api_base))
            .form(&form);
        self.send(request).await
    }

    /// Stop renewal; access continues until the current period ends
    pub async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<StripeSubscription> {
        let request = self
            .http
            .post(format!("{}/v1/subscriptions/{}", self.api_base, subscription_id))
            .form(&[("cancel_at_period_end", "true")]);
        self.send(request).await
    }

    /// End the subscription right away
    pub async fn cancel_now(&self, subscription_id: &str) -> Result<StripeSubscription> {
        let request = self
            .http
            .delete(format!("{}/v1/subscriptions/{}", self.api_base, subscription_id));
        self.send(request).await
    }
}
