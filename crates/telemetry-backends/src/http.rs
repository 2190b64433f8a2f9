//! Shared HTTP delivery helper for the managed-store, object-store,
//! search-index, and webhook adapters (§4.6). 5xx and transport errors are
//! retryable; 4xx is fatal for the batch.

use crate::AdapterError;

pub(crate) async fn send(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    headers: &[(String, String)],
    body: Vec<u8>,
) -> Result<(), AdapterError> {
    let mut req = client.request(method, url).body(body);
    for (k, v) in headers {
        req = req.header(k, v);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| AdapterError::Retryable(format!("request error: {e}")))?;

    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(AdapterError::Retryable(format!("server error: {status}")))
    } else {
        Err(AdapterError::Fatal(format!("client error: {status}")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept exactly one HTTP request, reply with `status`, and hand the
    /// request body back over the returned channel. Mirrors the minimal
    /// hand-rolled request parsing in `status_http::handle_connection`.
    pub(crate) async fn stub_server(status: u16) -> (String, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = &buf[..n];
            let header_end = find_header_end(request).unwrap_or(request.len());
            let body = request[header_end..].to_vec();

            let response = format!(
                "HTTP/1.1 {status} status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = tx.send(body);
        });

        (format!("http://{addr}"), rx)
    }

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }
}
