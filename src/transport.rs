//! HTTP POST capability used by forwarders.
//!
//! The forwarder only needs "post this JSON, give me status and body". [`ReqwestTransport`]
//! is the production implementation; tests plug in scripted ones.
use crate::error::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;
use tokio_rustls::rustls::{self, CertificateError};

pub const DEFAULT_USER_AGENT: &str = concat!("rpc-fabric/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Posts `body` as `application/json` to `url`. Any HTTP status counts as a reply;
    /// only failures before a response are errors.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, TransportError> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::new(classify_error_chain(&e), url, e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::new(classify_error_chain(&e), url, e.to_string()))?;

        Ok(HttpReply {
            status,
            body: body.to_vec(),
        })
    }
}

/// Works out whether a failed request died in the TLS layer, and if so whether the
/// certificate simply did not match the host name.
///
/// Only typed rustls errors found in the source chain count. Anything else, including
/// errors whose message happens to mention TLS, is a connection failure.
pub fn classify_error_chain(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut kind = TransportErrorKind::Connection;
    let mut current = Some(err);

    while let Some(e) = current {
        let tls = e.downcast_ref::<rustls::Error>().or_else(|| {
            // io::Error::source() skips over the wrapped error, so look inside explicitly.
            e.downcast_ref::<std::io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });

        match tls.map(rustls_kind) {
            Some(TransportErrorKind::TlsNameMismatch) => return TransportErrorKind::TlsNameMismatch,
            Some(TransportErrorKind::Tls) => kind = TransportErrorKind::Tls,
            _ => {}
        }
        current = e.source();
    }
    kind
}

fn rustls_kind(err: &rustls::Error) -> TransportErrorKind {
    if matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    ) {
        TransportErrorKind::TlsNameMismatch
    } else {
        TransportErrorKind::Tls
    }
}
