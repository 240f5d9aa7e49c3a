//! HTTP transport: a hyper client with optional certificate bypass, proxy
//! dialing and a per-request timeout.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{bail, Context as _, Result};
use hyper::{
    client::{
        connect::{Connected, Connection},
        HttpConnector,
    },
    service::Service,
    Body, Client, StatusCode, Uri,
};
use hyper_tls::HttpsConnector;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_socks::tcp::Socks5Stream;

use crate::listing::is_directory_listing;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("404 file not found")]
    NotFound,
    #[error("unexpected status code {0}")]
    Status(StatusCode),
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Network(#[source] hyper::Error),
    #[error("failed to read response body: {0}")]
    Body(#[source] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proxy {
    /// Requests are sent in absolute form to this proxy. Plain http only.
    Http(Uri),
    /// `host:port` of a SOCKS5 proxy without authentication.
    Socks5(String),
}

impl Proxy {
    /// Addresses starting with `http` are HTTP proxies, everything else is
    /// taken as a SOCKS5 `host:port`.
    pub fn parse(addr: &str) -> Result<Self> {
        if addr.starts_with("http") {
            let uri: Uri = addr
                .parse()
                .with_context(|| format!("Invalid proxy url {addr}"))?;
            if uri.host().is_none() {
                bail!("Proxy url {addr} has no host");
            }
            Ok(Proxy::Http(uri))
        } else {
            let addr = addr.trim_start_matches("socks5://");
            if !addr.contains(':') {
                bail!("SOCKS5 proxy must be given as host:port, got {addr}");
            }
            Ok(Proxy::Socks5(addr.to_owned()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub insecure: bool,
    pub proxy: Option<Proxy>,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client<HttpsConnector<Dialer>, Body>,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.insecure)
            .danger_accept_invalid_hostnames(config.insecure)
            .build()
            .context("Failed to set up TLS")?;

        let dialer = Dialer {
            http,
            proxy: config.proxy.clone(),
        };
        let connector = HttpsConnector::from((dialer, tokio_native_tls::TlsConnector::from(tls)));

        Ok(Self {
            client: Client::builder().build(connector),
            timeout: config.timeout,
        })
    }

    /// Downloads `url`. Anything but a 2xx response is an error.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| FetchError::InvalidUrl(url.to_owned()))?;

        match tokio::time::timeout(self.timeout, self.request(uri)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    /// Downloads `url` and returns the page only if it is a generated
    /// directory listing.
    pub async fn get_listing(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let page = self.get(url).await?;
        Ok(is_directory_listing(&page).then_some(page))
    }

    async fn request(&self, uri: Uri) -> Result<Vec<u8>, FetchError> {
        let resp = self.client.get(uri).await.map_err(FetchError::Network)?;
        match resp.status() {
            status if status.is_success() => {
                let bytes = hyper::body::to_bytes(resp.into_body())
                    .await
                    .map_err(FetchError::Body)?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status => Err(FetchError::Status(status)),
        }
    }
}

/// Opens the TCP connection for the client, directly or through a proxy.
#[derive(Debug, Clone)]
struct Dialer {
    http: HttpConnector,
    proxy: Option<Proxy>,
}

impl Service<Uri> for Dialer {
    type Response = DialedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        match self.proxy.clone() {
            None => {
                let connecting = self.http.call(dst);
                Box::pin(async move {
                    Ok::<_, BoxError>(DialedStream {
                        stream: connecting.await?,
                        absolute_form: false,
                    })
                })
            }
            Some(Proxy::Http(proxy)) => {
                let connecting = self.http.call(proxy);
                Box::pin(async move {
                    Ok::<_, BoxError>(DialedStream {
                        stream: connecting.await?,
                        absolute_form: true,
                    })
                })
            }
            Some(Proxy::Socks5(proxy)) => Box::pin(async move {
                let (host, port) = target_of(&dst)?;
                // the proxy resolves the host name
                let stream = Socks5Stream::connect(proxy.as_str(), (host.as_str(), port)).await?;
                Ok::<_, BoxError>(DialedStream {
                    stream: stream.into_inner(),
                    absolute_form: false,
                })
            }),
        }
    }
}

fn target_of(dst: &Uri) -> io::Result<(String, u16)> {
    let host = dst
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = dst.port_u16().unwrap_or(match dst.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((host, port))
}

#[derive(Debug)]
struct DialedStream {
    stream: TcpStream,
    absolute_form: bool,
}

impl Connection for DialedStream {
    fn connected(&self) -> Connected {
        // a proxied connection makes hyper send absolute-form request targets
        self.stream.connected().proxy(self.absolute_form)
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use hyper::{Body, Response};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::test_support::{serve_files, serve_fn};

    fn fetcher(timeout: Duration, proxy: Option<Proxy>) -> Fetcher {
        Fetcher::new(&TransportConfig {
            insecure: false,
            proxy,
            timeout,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn classifies_responses() {
        let mut files = HashMap::new();
        files.insert("/.git/HEAD".to_string(), b"ref: refs/heads/main\n".to_vec());
        let addr = serve_files(files).await;
        let fetcher = fetcher(Duration::from_secs(5), None);

        let body = fetcher
            .get(&format!("http://{addr}/.git/HEAD"))
            .await
            .unwrap();
        assert_eq!(body, b"ref: refs/heads/main\n");

        let err = fetcher
            .get(&format!("http://{addr}/.git/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound));

        let err = fetcher.get("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn other_status_codes_are_errors() {
        let addr = serve_fn(|_req| async {
            Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::from("no"))
                .unwrap()
        })
        .await;

        let err = fetcher(Duration::from_secs(5), None)
            .get(&format!("http://{addr}/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::FORBIDDEN)));
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let addr = serve_fn(|_req| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Response::new(Body::from("late"))
        })
        .await;

        let err = fetcher(Duration::from_millis(100), None)
            .get(&format!("http://{addr}/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn http_proxy_receives_absolute_form() {
        let proxy = serve_fn(|req| async move { Response::new(Body::from(req.uri().to_string())) })
            .await;

        let body = fetcher(
            Duration::from_secs(5),
            Some(Proxy::parse(&format!("http://{proxy}")).unwrap()),
        )
        .get("http://target.invalid/.git/HEAD")
        .await
        .unwrap();
        assert_eq!(body, b"http://target.invalid/.git/HEAD");
    }

    #[tokio::test]
    async fn socks5_proxy_tunnels_to_target() {
        let mut files = HashMap::new();
        files.insert("/.git/config".to_string(), b"[core]\n".to_vec());
        let target = serve_files(files).await;

        // minimal no-auth SOCKS5 server that only knows about one host
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            client.read_exact(&mut greeting).await.unwrap();
            client.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            client.read_exact(&mut head).await.unwrap();
            let mut host = vec![0u8; head[4] as usize];
            client.read_exact(&mut host).await.unwrap();
            let mut port = [0u8; 2];
            client.read_exact(&mut port).await.unwrap();
            assert_eq!(host, b"repo.internal");
            assert_eq!(u16::from_be_bytes(port), 8080);

            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let mut upstream = TcpStream::connect(target).await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        });

        let body = fetcher(
            Duration::from_secs(5),
            Some(Proxy::parse(&socks_addr.to_string()).unwrap()),
        )
        .get("http://repo.internal:8080/.git/config")
        .await
        .unwrap();
        assert_eq!(body, b"[core]\n");
    }

    #[test]
    fn proxy_parsing() {
        assert!(matches!(
            Proxy::parse("http://127.0.0.1:8080").unwrap(),
            Proxy::Http(_)
        ));
        assert_eq!(
            Proxy::parse("127.0.0.1:9050").unwrap(),
            Proxy::Socks5("127.0.0.1:9050".into())
        );
        assert_eq!(
            Proxy::parse("socks5://127.0.0.1:9050").unwrap(),
            Proxy::Socks5("127.0.0.1:9050".into())
        );
        assert!(Proxy::parse("localhost").is_err());
    }
}
