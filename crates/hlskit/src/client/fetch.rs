use bytes::Bytes;
use m3u8_rs::ByteRange;
use reqwest::{header::RANGE, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{HlsError, HlsResult};

/// `Range` header value of a playlist byte range.
pub(crate) fn http_range(range: &ByteRange) -> String {
    let offset = range.offset.unwrap_or(0);
    format!("bytes={}-{}", offset, offset + range.length.saturating_sub(1))
}

/// Downloads a resource. Any status other than 200 or 206 is an error.
pub(crate) async fn fetch(
    http: &reqwest::Client,
    url: &Url,
    range: Option<&ByteRange>,
    token: &CancellationToken,
) -> HlsResult<Bytes> {
    let download = async {
        let mut request = http.get(url.clone());
        if let Some(range) = range {
            request = request.header(RANGE, http_range(range));
        }
        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            if let Ok(body) = response.text().await {
                tracing::warn!(%url, "Error body: {body}");
            }
            return Err(HlsError::HttpError(status));
        }
        Ok(response.bytes().await?)
    };

    tokio::select! {
        result = download => result,
        _ = token.cancelled() => Err(HlsError::Terminated),
    }
}
