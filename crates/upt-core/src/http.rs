use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;

use crate::error::ClientError;

pub(crate) fn build_client(user_agent: &str) -> Client {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Joins `segments` onto `base`, percent-encoding each one.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = Url::parse(base).map_err(|e| ClientError::Url(format!("{base}: {e}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ClientError::Url(format!("{base}: cannot be a base")))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

pub(crate) async fn decode_json<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: truncate(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let mut out: String = trimmed.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
