use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;

pub const DEFAULT_UPSTREAM_RESPONSE_READ_MAX_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BodyLimitError {
    #[error("upstream response body too large: limit={limit}")]
    TooLarge { limit: u64 },
    #[error("failed to read upstream response body: {0}")]
    Read(String),
}

// Reads a response body under a byte cap. Errors iff the underlying stream
// yields strictly more than `max_bytes` bytes; a cap of zero falls back to
// the default.
pub async fn read_body_limited<S, E>(mut stream: S, max_bytes: u64) -> Result<Vec<u8>, BodyLimitError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let limit = if max_bytes == 0 {
        DEFAULT_UPSTREAM_RESPONSE_READ_MAX_BYTES
    } else {
        max_bytes
    };
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BodyLimitError::Read(e.to_string()))?;
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(BodyLimitError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub async fn read_response_limited(
    response: reqwest::Response,
    max_bytes: u64,
) -> Result<Vec<u8>, BodyLimitError> {
    read_body_limited(response.bytes_stream(), max_bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn body_within_limit_passes() {
        let body = read_body_limited(chunks(&["ok"]), 2).await.expect("within limit");
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn body_at_exact_limit_passes() {
        let body = read_body_limited(chunks(&["abc", "def"]), 6)
            .await
            .expect("exactly at limit");
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected() {
        let err = read_body_limited(chunks(&["tool", "ong"]), 6)
            .await
            .expect_err("over limit");
        assert!(matches!(err, BodyLimitError::TooLarge { limit: 6 }));
    }

    #[tokio::test]
    async fn zero_limit_uses_default() {
        let body = read_body_limited(chunks(&["payload"]), 0).await.expect("default cap");
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn read_errors_are_propagated() {
        let bad: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"a")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ];
        let err = read_body_limited(stream::iter(bad), 100)
            .await
            .expect_err("read error");
        assert!(matches!(err, BodyLimitError::Read(_)));
    }
}
