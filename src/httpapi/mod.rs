//! Minimal HTTP-client interface the transports and the upload client
//! consume, plus the production implementation built on `ureq` with a
//! `native-tls` connector.
//!
//! Keeping the interface this small lets the tests drive the wire
//! dialects with a recording fake instead of a live hub.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

/// Options applied when opening a connection. Collected from
/// `set_option` calls on the client and forwarded by the transports.
#[derive(Clone, Debug)]
pub struct HttpOptions {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub proxy: Option<ProxyOptions>,
    /// PEM bundle of additional trusted root certificates.
    pub trusted_certs: Option<String>,
    /// PEM client certificate and private key for X.509 authentication.
    pub x509_cert: Option<String>,
    pub x509_private_key: Option<String>,
    /// Log every request at debug level.
    pub verbose: bool,
    /// Interface name to bind outgoing sockets to. Accepted for
    /// compatibility; this HTTP stack cannot honor it and logs instead.
    pub network_interface: Option<String>,
    /// OpenSSL-specific key-type and engine selectors. Accepted for
    /// compatibility with engine-backed deployments; the `native-tls`
    /// stack loads PKCS#8 material directly.
    pub openssl_private_key_type: Option<String>,
    pub openssl_engine: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions {
            timeout_secs: 10,
            proxy: None,
            trusted_certs: None,
            x509_cert: None,
            x509_private_key: None,
            verbose: false,
            network_interface: None,
            openssl_private_key_type: None,
            openssl_engine: None,
        }
    }
}

/// One HTTP exchange against an already-selected host.
#[derive(Debug)]
pub struct HttpRequest<'a> {
    pub method: http::Method,
    /// Path plus query, starting with `/`.
    pub path: &'a str,
    pub headers: &'a [(String, String)],
    pub body: Option<&'a [u8]>,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased; duplicates preserved in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A live connection to one host. Non-2xx statuses are data, not errors;
/// `execute` fails only when no response was obtained at all.
pub trait HttpConnection {
    fn execute(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse>;
}

/// Opens connections; the seam the tests replace with a recording fake.
pub trait Connector {
    fn connect(&self, host: &str, options: &HttpOptions) -> Result<Box<dyn HttpConnection>>;
}

/// Production connector: `ureq` over `native-tls`, configured the same
/// way for hub and blob endpoints.
pub struct TlsConnector;

impl Connector for TlsConnector {
    fn connect(&self, host: &str, options: &HttpOptions) -> Result<Box<dyn HttpConnection>> {
        let tls = build_tls(options)?;

        let mut builder = ureq::AgentBuilder::new().tls_connector(Arc::new(tls));
        if let Some(proxy) = &options.proxy {
            let url = match (&proxy.username, &proxy.password) {
                (Some(user), Some(password)) => {
                    format!("http://{}:{}@{}:{}", user, password, proxy.host, proxy.port)
                }
                _ => format!("http://{}:{}", proxy.host, proxy.port),
            };
            builder = builder.proxy(ureq::Proxy::new(url).context("Invalid proxy configuration")?);
        }

        if let Some(interface) = &options.network_interface {
            log::debug!("Ignoring network interface binding to '{interface}': not supported by this HTTP stack");
        }
        if let Some(engine) = &options.openssl_engine {
            log::debug!("Ignoring OpenSSL engine '{engine}': keys are loaded directly");
        }

        Ok(Box::new(UreqConnection {
            agent: builder.build(),
            host: host.to_owned(),
            timeout: Duration::from_secs(options.timeout_secs),
            verbose: options.verbose,
        }))
    }
}

fn build_tls(options: &HttpOptions) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if let Some(bundle) = &options.trusted_certs {
        for pem in split_pem_certificates(bundle) {
            let certificate = native_tls::Certificate::from_pem(pem.as_bytes())
                .context("Unable to parse a trusted certificate")?;
            builder.add_root_certificate(certificate);
        }
    }

    if let (Some(cert), Some(key)) = (&options.x509_cert, &options.x509_private_key) {
        let identity = native_tls::Identity::from_pkcs8(cert.as_bytes(), key.as_bytes())
            .context("Unable to load the X.509 client identity")?;
        builder.identity(identity);
    }

    builder.build().context("Unable to build TLS connector")
}

/// Splits a PEM bundle into individual certificates.
fn split_pem_certificates(bundle: &str) -> Vec<String> {
    const END_MARKER: &str = "-----END CERTIFICATE-----";
    let mut certificates = Vec::new();
    let mut rest = bundle;
    while let Some(position) = rest.find(END_MARKER) {
        let end = position + END_MARKER.len();
        certificates.push(rest[..end].trim().to_owned());
        rest = &rest[end..];
    }
    certificates
}

struct UreqConnection {
    agent: ureq::Agent,
    host: String,
    timeout: Duration,
    verbose: bool,
}

impl HttpConnection for UreqConnection {
    fn execute(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let url = format!("https://{}{}", self.host, request.path);
        if self.verbose {
            log::debug!("{} {}", request.method, url);
        }

        let mut call = self
            .agent
            .request(request.method.as_str(), &url)
            .timeout(self.timeout);
        for (name, value) in request.headers {
            call = call.set(name, value);
        }

        let result = match request.body {
            Some(body) => call.send_bytes(body),
            None => call.call(),
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(e)) => {
                return Err(anyhow::Error::new(e)).context(format!("Request to {url} failed"));
            }
        };

        let status = response.status();
        let mut headers = Vec::new();
        for name in response.headers_names() {
            if let Some(value) = response.header(&name) {
                headers.push((name.to_ascii_lowercase(), value.to_owned()));
            }
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .context("Unable to read the response body")?;

        if self.verbose {
            log::debug!("{} {} -> {}", request.method, url, status);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
