use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Short-lived relay credential issued by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointError {
    error: String,
}

/// Fetch a grant from the configured endpoint. The endpoint answers
/// `200 {"token", "clientId"}` or `500 {"error"}`.
pub async fn fetch_grant(endpoint: &str) -> Result<TokenGrant> {
    let response = reqwest::get(endpoint).await?;
    if !response.status().is_success() {
        let status = response.status();
        let reason = match response.json::<TokenEndpointError>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(Error::Token(reason).into());
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve_once(body: &'static str, status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len(),
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/api/relay-token")
    }

    #[tokio::test]
    async fn parses_a_grant() {
        let endpoint = serve_once(r#"{"token":"t0k3n","clientId":"abc123"}"#, "200 OK").await;
        let grant = fetch_grant(&endpoint).await.unwrap();
        assert_eq!(grant.token, "t0k3n");
        assert_eq!(grant.client_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn surfaces_endpoint_errors() {
        let endpoint =
            serve_once(r#"{"error":"provider unavailable"}"#, "500 Internal Server Error").await;
        let err = fetch_grant(&endpoint).await.unwrap_err();
        assert!(err.to_string().contains("provider unavailable"));
    }
}
