//! Cliente HTTP para um armazenamento de blobs endereçado por conteúdo.
//!
//! `PUT {base}/blobs` grava o corpo e devolve `{"ref": "<sha256>"}`;
//! `GET {base}/blobs/{ref}` devolve os bytes. Toda resposta é conferida
//! contra o hash local antes de ser aceita.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{ContentStore, StoreError, StoreResult};
use crate::ids::ContentRef;

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(rename = "ref")]
    content: ContentRef,
}

#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    client: Client,
}

impl HttpStore {
    /// Cria um cliente para o servidor em `base_url`.
    pub fn new(base_url: &str) -> StoreResult<Self> {
        if base_url.trim().is_empty() {
            return Err(StoreError::Unavailable("store URL is empty".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn blobs(&self) -> String {
        format!("{}/blobs", self.base_url)
    }
}

#[async_trait]
impl ContentStore for HttpStore {
    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentRef> {
        let expected = ContentRef::of(bytes);
        let response = self
            .client
            .put(self.blobs())
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;

        if response.status().is_server_error() {
            return Err(StoreError::Unavailable(format!(
                "store returned {}",
                response.status()
            )));
        }
        let body: PutResponse = response.error_for_status()?.json().await?;
        if body.content != expected {
            return Err(StoreError::RefMismatch {
                expected,
                actual: body.content,
            });
        }
        Ok(expected)
    }

    async fn get(&self, content: &ContentRef) -> StoreResult<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/{}", self.blobs(), content))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound(content.clone())),
            status if status.is_server_error() => {
                return Err(StoreError::Unavailable(format!("store returned {status}")));
            }
            _ => {}
        }

        let bytes = response.error_for_status()?.bytes().await?.to_vec();
        let actual = ContentRef::of(&bytes);
        if actual != *content {
            return Err(StoreError::RefMismatch {
                expected: content.clone(),
                actual,
            });
        }
        Ok(bytes)
    }
}
