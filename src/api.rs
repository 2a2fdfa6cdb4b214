// Marketplace backend calls
// Every call except sign-in and password reset goes through the authenticated request wrapper

use anyhow::Context;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Response, Url};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use crate::auth::expiry_after;
use crate::config::Config;
use crate::error::{ApiError, FetchError, Result};
use crate::http_client::AuthenticatedClient;

#[derive(Debug, Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
}

/// Image attached to a multipart upload
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    fn part(&self) -> reqwest::Result<Part> {
        Part::bytes(self.bytes.clone())
            .file_name(self.file_name.clone())
            .mime_str(&self.mime_type)
    }
}

/// Account registration form
#[derive(Debug, Clone)]
pub struct SignUp {
    pub name: String,
    pub email: String,
    pub password: String,
    pub profile_picture: Option<ImageUpload>,
}

/// Product listing form
#[derive(Debug, Clone)]
pub struct NewListing {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    pub image: Option<ImageUpload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, deserialize_with = "deserialize_decimal")]
    pub price: f64,

    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default, deserialize_with = "deserialize_decimal")]
    balance: f64,
}

/// Shopping cart as returned by the wallet backend
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cart {
    #[serde(default)]
    pub items: Vec<CartItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CartItem {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,

    /// Product id, or the populated product document
    #[serde(rename = "productId", default)]
    pub product: serde_json::Value,

    #[serde(default)]
    pub quantity: u32,

    #[serde(default, deserialize_with = "deserialize_decimal")]
    pub price: f64,
}

/// Accepts a plain number, a numeric string or a `{"$numberDecimal": "..."}` wrapper
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    fn from_value<E: de::Error>(value: &serde_json::Value) -> std::result::Result<f64, E> {
        match value {
            serde_json::Value::Null => Ok(0.0),
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| E::custom(format!("decimal out of range: {}", n))),
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid decimal: {:?}", s))),
            serde_json::Value::Object(map) => match map.get("$numberDecimal") {
                Some(inner) => from_value(inner),
                None => Err(E::custom("expected $numberDecimal")),
            },
            other => Err(E::custom(format!("invalid decimal: {}", other))),
        }
    }

    let value = serde_json::Value::deserialize(deserializer)?;
    from_value(&value)
}

/// Client for the marketplace and wallet backends
#[derive(Clone)]
pub struct MarketplaceApi {
    client: AuthenticatedClient,
    api_base: Url,
    wallet_base: Url,
}

impl MarketplaceApi {
    pub fn new(client: AuthenticatedClient, config: &Config) -> anyhow::Result<Self> {
        let api_base = Url::parse(&config.api_base_url)
            .with_context(|| format!("Invalid API base URL: {}", config.api_base_url))?;
        let wallet_base = Url::parse(&config.wallet_base_url)
            .with_context(|| format!("Invalid wallet base URL: {}", config.wallet_base_url))?;

        Ok(Self {
            client,
            api_base,
            wallet_base,
        })
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }

    /// Exchange email and password for a credential record and sign the session in
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<()> {
        let url = endpoint(&self.api_base, "signin")?;
        tracing::info!(email = %email, "Signing in");

        let response = self
            .client
            .client()
            .post(url)
            .json(&SignInRequest { email, password })
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let body: SignInResponse = read_json(response).await?;
        let (Some(access_token), Some(refresh_token)) = (body.token, body.refresh_token) else {
            return Err(ApiError::InvalidResponse(
                "Sign-in response is missing tokens".to_string(),
            ));
        };

        let session = self.client.session();
        let expiry = expiry_after(Utc::now(), session.token_lifetime());
        session.sign_in(&access_token, &refresh_token, expiry).await?;
        Ok(())
    }

    /// Current user's profile document
    pub async fn profile(&self) -> Result<serde_json::Value> {
        let url = endpoint(&self.api_base, "profile")?;
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }

    /// Wallet balance, 0 when the backend reports none
    pub async fn wallet_balance(&self) -> Result<f64> {
        let url = endpoint(&self.wallet_base, "api/wallet/balance")?;
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        let body: BalanceResponse = read_json(response).await?;
        Ok(body.balance)
    }

    pub async fn deposit_funds(&self, amount: f64) -> Result<serde_json::Value> {
        self.move_funds("api/auth/deposit-funds", amount).await
    }

    pub async fn withdraw_funds(&self, amount: f64) -> Result<serde_json::Value> {
        self.move_funds("api/wallet/withdraw-funds", amount).await
    }

    async fn move_funds(&self, path: &str, amount: f64) -> Result<serde_json::Value> {
        validate_amount(amount)?;

        let url = endpoint(&self.api_base, path)?;
        tracing::info!(path = %path, amount, "Submitting wallet transaction");

        let builder = self
            .client
            .request(Method::POST, url)
            .json(&json!({ "amount": amount }));
        let response = self.client.send(builder).await?;
        read_json(response).await
    }

    pub async fn fetch_cart(&self, user_id: &str) -> Result<Cart> {
        let url = cart_endpoint(&self.wallet_base, "api/cart", user_id)?;
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }

    pub async fn add_to_cart(&self, user_id: &str, product_id: &str, price: f64) -> Result<Cart> {
        let url = cart_endpoint(&self.wallet_base, "api/cart/add", user_id)?;
        let builder = self.client.request(Method::POST, url).json(&json!({
            "productId": product_id,
            "quantity": 1,
            "price": price,
        }));
        let response = self.client.send(builder).await?;
        read_json(response).await
    }

    pub async fn update_cart_item(
        &self,
        user_id: &str,
        item_id: &str,
        quantity: u32,
    ) -> Result<Cart> {
        let url = cart_endpoint(&self.wallet_base, "api/cart/update", user_id)?;
        let builder = self.client.request(Method::PUT, url).json(&json!({
            "itemId": item_id,
            "quantity": quantity,
        }));
        let response = self.client.send(builder).await?;
        read_json(response).await
    }

    pub async fn remove_from_cart(&self, user_id: &str, item_id: &str) -> Result<Cart> {
        let url = cart_endpoint(&self.wallet_base, "api/cart/remove", user_id)?;
        let builder = self
            .client
            .request(Method::DELETE, url)
            .json(&json!({ "itemId": item_id }));
        let response = self.client.send(builder).await?;
        read_json(response).await
    }

    pub async fn delete_product(&self, product_id: &str) -> Result<()> {
        let mut url = endpoint(&self.api_base, "delete")?;
        url.query_pairs_mut().append_pair("id", product_id);

        let response = self.client.send(self.client.request(Method::DELETE, url)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        tracing::info!(product_id = %product_id, "Product deleted");
        Ok(())
    }

    /// Register an account; signs the session in when the backend returns both tokens
    pub async fn sign_up(&self, form: &SignUp) -> Result<serde_json::Value> {
        let url = endpoint(&self.api_base, "signup")?;
        tracing::info!(email = %form.email, "Signing up");

        let response = self
            .client
            .send_with(|| {
                let mut multipart = Form::new()
                    .text("name", form.name.clone())
                    .text("email", form.email.clone())
                    .text("password", form.password.clone());
                if let Some(image) = &form.profile_picture {
                    multipart = multipart.part("profilePicture", image.part()?);
                }
                Ok(self.client.request(Method::POST, url.clone()).multipart(multipart))
            })
            .await?;

        let body: serde_json::Value = read_json(response).await?;
        let tokens = (
            body.get("token").and_then(|t| t.as_str()),
            body.get("refreshToken").and_then(|t| t.as_str()),
        );
        if let (Some(access_token), Some(refresh_token)) = tokens {
            let session = self.client.session();
            let expiry = expiry_after(Utc::now(), session.token_lifetime());
            session.sign_in(access_token, refresh_token, expiry).await?;
        }

        Ok(body)
    }

    /// Publish a product listing. The price is sent with two decimals.
    pub async fn create_listing(&self, listing: &NewListing) -> Result<serde_json::Value> {
        if !listing.price.is_finite() || listing.price < 0.0 {
            return Err(ApiError::ValidationError(
                "Price must be a non-negative number.".to_string(),
            ));
        }

        let url = endpoint(&self.api_base, "api/auth/create-listing")?;
        let price = format!("{:.2}", listing.price);
        tracing::info!(name = %listing.name, price = %price, "Creating listing");

        let response = self
            .client
            .send_with(|| {
                let mut multipart = Form::new();
                if let Some(image) = &listing.image {
                    multipart = multipart.part("productImage", image.part()?);
                }
                let multipart = multipart
                    .text("name", listing.name.clone())
                    .text("description", listing.description.clone())
                    .text("price", price.clone())
                    .text("category", listing.category.clone());
                Ok(self.client.request(Method::POST, url.clone()).multipart(multipart))
            })
            .await?;

        read_json(response).await
    }

    pub async fn products(&self) -> Result<Vec<Product>> {
        let url = endpoint(&self.api_base, "products")?;
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }

    pub async fn product(&self, product_id: &str) -> Result<Product> {
        let mut url = endpoint(&self.api_base, "product")?;
        url.query_pairs_mut().append_pair("id", product_id);
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }

    /// Public profile of another user
    pub async fn user(&self, user_id: &str) -> Result<serde_json::Value> {
        let url = segment_endpoint(&self.api_base, "api/auth/users", user_id)?;
        let response = self.client.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }

    pub async fn update_profile(&self, name: &str, email: &str) -> Result<serde_json::Value> {
        let url = endpoint(&self.api_base, "api/auth/update")?;
        let builder = self
            .client
            .request(Method::PUT, url)
            .json(&json!({ "name": name, "email": email }));
        let response = self.client.send(builder).await?;
        read_json(response).await
    }

    /// Ask the backend to email a password reset link
    pub async fn reset_password(&self, email: &str) -> Result<serde_json::Value> {
        let url = endpoint(&self.api_base, "api/auth/reset-password")?;
        let response = self
            .client
            .client()
            .post(url)
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(FetchError::Transport)?;
        read_json(response).await
    }
}

fn validate_amount(amount: f64) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::ValidationError(
            "Amount must be a positive number.".to_string(),
        ));
    }
    Ok(())
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| ApiError::ValidationError(format!("Invalid endpoint {}: {}", path, e)))
}

fn segment_endpoint(base: &Url, path: &str, segment: &str) -> Result<Url> {
    let mut url = endpoint(base, path)?;
    url.path_segments_mut()
        .map_err(|_| ApiError::ValidationError(format!("Invalid endpoint {}", path)))?
        .push(segment);
    Ok(url)
}

fn cart_endpoint(base: &Url, path: &str, user_id: &str) -> Result<Url> {
    let mut url = endpoint(base, path)?;
    url.query_pairs_mut().append_pair("id", user_id);
    Ok(url)
}

/// Decode a 2xx JSON body, or turn the response into a backend error
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(FetchError::Transport)?;

    if !status.is_success() {
        tracing::debug!(status = %status, "Backend returned error");
        return Err(ApiError::from_status(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}
