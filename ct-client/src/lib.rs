use async_trait::async_trait;
use ct_types::catalog::{
    sku_predicate, CatalogBrowser, CatalogClient, CatalogError, ProductQuery, ProjectionQuery,
    SearchQuery,
};
use ct_types::product::{Product, ProductDraft, ProductProjection, ProductUpdate};
use ct_types::PagedQueryResponse;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use typesafe_repository::IdentityOf;
use url::Url;

pub mod auth;

pub use auth::Credentials;
use auth::TokenCache;

#[derive(Clone)]
pub struct ClientOptions {
    pub api_url: Url,
    pub auth_url: Url,
    pub project_key: String,
    pub credentials: Credentials,
    /// Plain client for the token endpoint.
    pub http: reqwest::Client,
    /// Used for GET requests, may retry.
    pub read: reqwest_middleware::ClientWithMiddleware,
    /// Used for mutating requests, must not retry.
    pub write: reqwest_middleware::ClientWithMiddleware,
}

pub struct CommercetoolsClient {
    options: ClientOptions,
    token: TokenCache,
}

impl CommercetoolsClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            token: TokenCache::default(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        endpoint(&self.options.api_url, &self.options.project_key, segments)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<String, CatalogError> {
        let client = if method == Method::GET {
            &self.options.read
        } else {
            &self.options.write
        };
        let token = self.token.get(&self.options).await?;
        log::debug!("{method} {url}");
        let mut request = client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| CatalogError::Unavailable(err.into()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| CatalogError::Unavailable(err.into()))?;
        if status == StatusCode::UNAUTHORIZED {
            self.token.invalidate().await;
        }
        if status.is_success() {
            Ok(text)
        } else {
            Err(error_for_status(status.as_u16(), &text))
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, CatalogError> {
        match self.execute(Method::GET, url, None).await {
            Ok(text) => decode(&text).map(Some),
            Err(CatalogError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn submit<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, CatalogError> {
        let body = serde_json::to_vec(body)
            .map_err(|err| CatalogError::Validation(format!("Unable to encode request: {err}")))?;
        let text = self.execute(Method::POST, url, Some(body)).await?;
        decode(&text)
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<PagedQueryResponse<T>, CatalogError> {
        self.fetch(url).await?.ok_or(CatalogError::NotFound)
    }
}

#[async_trait]
impl CatalogClient for CommercetoolsClient {
    async fn get_by_key(&self, key: &str) -> Result<Option<Product>, CatalogError> {
        let key = format!("key={key}");
        let url = self.endpoint(&["products", key.as_str()])?;
        self.fetch(url).await
    }

    async fn get_by_sku(
        &self,
        sku: &str,
        staged: bool,
    ) -> Result<Option<ProductProjection>, CatalogError> {
        let url = with_query(
            self.endpoint(&["product-projections"])?,
            &sku_lookup_pairs(sku, staged),
        );
        let page: Option<PagedQueryResponse<ProductProjection>> = self.fetch(url).await?;
        Ok(page.and_then(PagedQueryResponse::into_first))
    }

    async fn create(&self, draft: &ProductDraft) -> Result<Product, CatalogError> {
        let url = self.endpoint(&["products"])?;
        self.submit(url, draft).await
    }

    async fn update(
        &self,
        id: &IdentityOf<Product>,
        update: &ProductUpdate,
    ) -> Result<Product, CatalogError> {
        let url = self.endpoint(&["products", id.as_str()])?;
        self.submit(url, update).await
    }
}

#[async_trait]
impl CatalogBrowser for CommercetoolsClient {
    async fn get_product(&self, id: &IdentityOf<Product>) -> Result<Option<Product>, CatalogError> {
        let url = self.endpoint(&["products", id.as_str()])?;
        self.fetch(url).await
    }

    async fn get_projection(
        &self,
        id: &IdentityOf<ProductProjection>,
    ) -> Result<Option<ProductProjection>, CatalogError> {
        let url = self.endpoint(&["product-projections", id.as_str()])?;
        self.fetch(url).await
    }

    async fn query_projections(
        &self,
        query: &ProjectionQuery,
    ) -> Result<PagedQueryResponse<ProductProjection>, CatalogError> {
        let url = with_query(
            self.endpoint(&["product-projections"])?,
            &projection_query_pairs(query),
        );
        self.fetch_page(url).await
    }

    async fn query_products(
        &self,
        query: &ProductQuery,
    ) -> Result<PagedQueryResponse<Product>, CatalogError> {
        let mut pairs = vec![];
        if let Some(predicate) = &query.predicate {
            pairs.push(("where", predicate.clone()));
        }
        push_paging(&mut pairs, query.limit, query.offset);
        let url = with_query(self.endpoint(&["products"])?, &pairs);
        self.fetch_page(url).await
    }

    async fn search_projections(
        &self,
        query: &SearchQuery,
    ) -> Result<PagedQueryResponse<ProductProjection>, CatalogError> {
        let text_param = format!("text.{}", query.language);
        let mut pairs = vec![(text_param.as_str(), query.text.clone())];
        pairs.extend(query.facets.iter().map(|f| ("facet", f.clone())));
        push_paging(&mut pairs, query.limit, query.offset);
        let url = with_query(self.endpoint(&["product-projections", "search"])?, &pairs);
        self.fetch_page(url).await
    }
}

fn projection_query_pairs(query: &ProjectionQuery) -> Vec<(&'static str, String)> {
    let mut pairs = vec![];
    if let Some(predicate) = &query.predicate {
        pairs.push(("where", predicate.clone()));
    }
    if let Some(currency) = &query.price_currency {
        pairs.push(("priceCurrency", currency.clone()));
    }
    if let Some(country) = &query.price_country {
        pairs.push(("priceCountry", country.clone()));
    }
    if let Some(staged) = query.staged {
        pairs.push(("staged", staged.to_string()));
    }
    push_paging(&mut pairs, query.limit, query.offset);
    pairs
}

fn push_paging<'a>(pairs: &mut Vec<(&'a str, String)>, limit: Option<u32>, offset: Option<u32>) {
    if let Some(limit) = limit {
        pairs.push(("limit", limit.to_string()));
    }
    if let Some(offset) = offset {
        pairs.push(("offset", offset.to_string()));
    }
}

pub fn endpoint(base: &Url, project_key: &str, segments: &[&str]) -> Result<Url, CatalogError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CatalogError::Unavailable(anyhow::anyhow!("Invalid api url {base}")))?
        .pop_if_empty()
        .push(project_key)
        .extend(segments);
    Ok(url)
}

fn sku_lookup_pairs(sku: &str, staged: bool) -> Vec<(&'static str, String)> {
    let mut pairs = vec![("where", sku_predicate(sku)), ("limit", "1".to_string())];
    if staged {
        pairs.push(("staged", "true".to_string()));
    }
    pairs
}

fn with_query(mut url: Url, pairs: &[(&str, String)]) -> Url {
    if !pairs.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
    }
    url
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CatalogError> {
    serde_json::from_str(text)
        .map_err(|err| CatalogError::Decode(format!("{err}. Body: {}", truncate_body(text))))
}

pub fn error_for_status(status: u16, body: &str) -> CatalogError {
    match status {
        404 => CatalogError::NotFound,
        409 => CatalogError::ConcurrencyConflict(error_message(body)),
        400 => CatalogError::Validation(error_message(body)),
        _ => CatalogError::Remote {
            status,
            body: truncate_body(body),
        },
    }
}

/// The `message` of an API error body, or the raw body when it has none.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| truncate_body(body))
}

pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 220;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((end, _)) => format!("{}…", &trimmed[..end]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://api.us-east-2.aws.commercetools.com").unwrap()
    }

    #[test]
    fn builds_project_scoped_endpoints() {
        assert_eq!(
            "https://api.us-east-2.aws.commercetools.com/shop/products/key=shirt-1",
            endpoint(&base(), "shop", &["products", "key=shirt-1"])
                .unwrap()
                .as_str()
        );
        assert_eq!(
            "https://api.us-east-2.aws.commercetools.com/shop/products/key=a%2Fb",
            endpoint(&base(), "shop", &["products", "key=a/b"])
                .unwrap()
                .as_str()
        );
    }

    #[test]
    fn encodes_query_pairs() {
        let url = with_query(
            endpoint(&base(), "shop", &["product-projections"]).unwrap(),
            &sku_lookup_pairs("SKU1", false),
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            vec![
                (
                    "where".to_string(),
                    r#"masterVariant(sku="SKU1") or variants(sku="SKU1")"#.to_string()
                ),
                ("limit".to_string(), "1".to_string()),
            ],
            pairs
        );
        let bare = with_query(endpoint(&base(), "shop", &["products"]).unwrap(), &[]);
        assert_eq!(None, bare.query());
    }

    #[test]
    fn looks_up_staged_sku() {
        assert_eq!(
            Some(&("staged", "true".to_string())),
            sku_lookup_pairs("SKU1", true).last()
        );
        assert!(sku_lookup_pairs("SKU1", false)
            .iter()
            .all(|(k, _)| *k != "staged"));
    }

    #[test]
    fn passes_projection_query_through() {
        let pairs = projection_query_pairs(&ProjectionQuery {
            predicate: Some("key=\"a\"".to_string()),
            price_currency: Some("GBP".to_string()),
            price_country: Some("GB".to_string()),
            staged: None,
            limit: Some(20),
            offset: None,
        });
        assert_eq!(
            vec![
                ("where", "key=\"a\"".to_string()),
                ("priceCurrency", "GBP".to_string()),
                ("priceCountry", "GB".to_string()),
                ("limit", "20".to_string()),
            ],
            pairs
        );
    }

    #[test]
    fn maps_statuses_to_errors() {
        assert!(matches!(error_for_status(404, ""), CatalogError::NotFound));
        match error_for_status(
            409,
            r#"{"statusCode":409,"message":"Expected: 2 - Actual: 3."}"#,
        ) {
            CatalogError::ConcurrencyConflict(msg) => assert_eq!("Expected: 2 - Actual: 3.", msg),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            error_for_status(400, "plain text"),
            CatalogError::Validation(msg) if msg == "plain text"
        ));
        assert!(matches!(
            error_for_status(503, "down"),
            CatalogError::Remote { status: 503, .. }
        ));
    }

    #[test]
    fn truncates_long_bodies() {
        let body = "x".repeat(500);
        let truncated = truncate_body(&body);
        assert_eq!(221, truncated.chars().count());
        assert!(truncated.ends_with('…'));
        assert_eq!("short", truncate_body("  short "));
    }
}
