use super::{Catalog, CatalogError, CatalogProduct, ImagePayload, ImageSource, UploadedImage};
use crate::config::ShopifySettings;
use crate::http::{Upstream, build_client};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use urlencoding::encode;

const SEARCH_PRODUCTS: &str = r#"
query SearchProducts($query: String!, $first: Int!) {
  products(first: $first, query: $query) {
    edges { node { legacyResourceId title } }
  }
}
"#;

const SEARCH_PAGE_SIZE: u32 = 25;

/// Shopify Admin API client. The access token is read from the environment;
/// rotating it is somebody else's job.
#[derive(Debug, Clone)]
pub struct ShopifyClient {
    base_url: String,
    access_token: String,
    http: Client,
}

impl ShopifyClient {
    pub fn new(settings: &ShopifySettings) -> Self {
        Self {
            base_url: format!(
                "https://{}/admin/api/{}",
                settings.store_domain, settings.api_version
            ),
            access_token: settings.access_token.clone(),
            http: build_client(Upstream::Api),
        }
    }

    fn is_configured(&self) -> bool {
        !self.access_token.is_empty() && !self.base_url.starts_with("https:///")
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, CatalogError> {
        if !self.is_configured() {
            return Err(CatalogError::NotConfigured);
        }
        Ok(request.header("X-Shopify-Access-Token", &self.access_token))
    }
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct SearchData {
    products: ProductConnection,
}

#[derive(Deserialize)]
struct ProductConnection {
    edges: Vec<ProductEdge>,
}

#[derive(Deserialize)]
struct ProductEdge {
    node: ProductNode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductNode {
    legacy_resource_id: String,
    title: String,
}

#[derive(Deserialize)]
struct ProductEnvelope {
    product: RestProduct,
}

#[derive(Deserialize)]
struct RestProduct {
    id: u64,
    title: String,
    #[serde(default)]
    images: Vec<RestImage>,
}

#[derive(Deserialize)]
struct RestImage {
    src: String,
}

#[derive(Serialize)]
struct ImageUploadRequest<'a> {
    image: ImageUploadBody<'a>,
}

#[derive(Serialize)]
struct ImageUploadBody<'a> {
    filename: &'a str,
    position: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImageUploadEnvelope {
    image: ImageUploadResult,
}

#[derive(Deserialize)]
struct ImageUploadResult {
    id: u64,
    #[serde(default)]
    position: Option<u32>,
}

impl Catalog for ShopifyClient {
    async fn search_products(&self, query: &str) -> Result<Vec<CatalogProduct>, CatalogError> {
        let request = self
            .authorized(self.http.post(format!("{}/graphql.json", self.base_url)))?
            .json(&json!({
                "query": SEARCH_PRODUCTS,
                "variables": { "query": query, "first": SEARCH_PAGE_SIZE },
            }));
        let response = send(request).await?;
        let payload: GraphqlResponse = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;

        if let Some(first) = payload.errors.first() {
            return Err(CatalogError::Request(first.message.clone()));
        }
        let products = payload
            .data
            .map(|data| {
                data.products
                    .edges
                    .into_iter()
                    .map(|edge| CatalogProduct {
                        id: edge.node.legacy_resource_id,
                        title: edge.node.title,
                        image_urls: Vec::new(),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        debug!(
            target = "ingest.catalog",
            query,
            results = products.len(),
            "catalog search"
        );
        Ok(products)
    }

    async fn get_product(&self, product_id: &str) -> Result<Option<CatalogProduct>, CatalogError> {
        let url = format!(
            "{}/products/{}.json?fields=id,title,images",
            self.base_url,
            encode(product_id)
        );
        let response = self
            .authorized(self.http.get(url))?
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let envelope: ProductEnvelope = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        Ok(Some(CatalogProduct {
            id: envelope.product.id.to_string(),
            title: envelope.product.title,
            image_urls: envelope
                .product
                .images
                .into_iter()
                .map(|image| image.src)
                .collect(),
        }))
    }

    async fn upload_image(
        &self,
        product_id: &str,
        image: ImagePayload,
    ) -> Result<UploadedImage, CatalogError> {
        let (attachment, src) = match &image.source {
            ImageSource::Attachment(bytes) => (Some(BASE64.encode(bytes)), None),
            ImageSource::Url(url) => (None, Some(url.as_str())),
        };
        let body = ImageUploadRequest {
            image: ImageUploadBody {
                filename: &image.filename,
                position: image.position,
                attachment,
                src,
            },
        };
        let url = format!(
            "{}/products/{}/images.json",
            self.base_url,
            encode(product_id)
        );
        let response = send(self.authorized(self.http.post(url))?.json(&body)).await?;
        let envelope: ImageUploadEnvelope = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        Ok(UploadedImage {
            id: envelope.image.id.to_string(),
            position: envelope.image.position.unwrap_or(image.position),
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        let response = send(self.http.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, CatalogError> {
    let response = request
        .send()
        .await
        .map_err(|err| CatalogError::Request(err.to_string()))?;
    check_status(response).await
}

async fn check_status(response: Response) -> Result<Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CatalogError::Http {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_refuses_requests() {
        let client = ShopifyClient::new(&ShopifySettings {
            store_domain: String::new(),
            access_token: String::new(),
            api_version: "2024-10".into(),
        });
        let err = client.search_products("sigma").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotConfigured));
    }
}
