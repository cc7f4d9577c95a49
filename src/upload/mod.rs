//! The file-upload-to-blob sub-protocol: obtain a SAS-signed blob URI
//! from the hub, upload the content in blocks to the blob endpoint,
//! commit the block list and report the outcome back to the hub.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{AuthModule, Credentials};
use crate::client::{compose_user_agent, DEFAULT_USER_AGENT};
use crate::error::ClientError;
use crate::httpapi::{Connector, HttpConnection, HttpOptions, HttpRequest, ProxyOptions, TlsConnector};
use crate::transport::OptionResult;

const API_VERSION: &str = "?api-version=2016-11-14";

/// Largest accepted block.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// Largest accepted number of blocks per blob.
pub const MAX_BLOCK_COUNT: u32 = 50_000;

/// One pull from the application's data source.
pub enum BlockInput {
    /// The next block. An empty block ends the upload like [`BlockInput::Done`].
    Block(Vec<u8>),
    /// End of data; commit what was uploaded.
    Done,
    /// Give up; the hub is notified of the failure.
    Abort,
}

/// Options recognized by the upload client; forwarded from
/// `DeviceClient::set_option`.
#[derive(Clone, Debug)]
pub enum UploadOption {
    TimeoutSecs(u64),
    /// Accepted for compatibility with TLS stacks that need renegotiation
    /// enabled explicitly; the `native-tls` stack negotiates on its own.
    TlsRenegotiation(bool),
    TrustedCerts(String),
    X509Cert(String),
    X509PrivateKey(String),
    OpensslPrivateKeyType(String),
    OpensslEngine(String),
    Proxy {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    Verbose(bool),
    NetworkInterface(String),
    ProductInfo(String),
}

/// Progress of one blob upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// SAS URI obtained, blob connection open.
    Connected,
    /// At least one block uploaded.
    Streaming,
    /// Block list committed.
    Committed,
    /// Outcome reported to the hub.
    Notified,
}

/// Only the used parts are deserialized.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileUploadInit {
    correlation_id: String,
    host_name: String,
    container_name: String,
    blob_name: String,
    sas_token: String,
}

/// Client for the upload-to-blob flow of one device.
///
/// Unlike telemetry, uploads run to completion within the calling thread;
/// every request is bounded by the configured timeout.
pub struct UploadClient {
    hostname: String,
    auth: AuthModule,
    connector: Box<dyn Connector>,
    options: HttpOptions,
    tls_renegotiation: bool,
    user_agent: String,
}

impl UploadClient {
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self::with_connector(hostname, device_id, credentials, Box::new(TlsConnector))
    }

    /// Builds the client on a custom connection factory; the seam the
    /// tests use to observe the wire traffic.
    pub fn with_connector(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        credentials: Credentials,
        connector: Box<dyn Connector>,
    ) -> Self {
        UploadClient {
            hostname: hostname.into(),
            auth: AuthModule::new(device_id, credentials),
            connector,
            options: HttpOptions::default(),
            tls_renegotiation: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }

    /// Whether TLS renegotiation was requested through the options.
    pub fn tls_renegotiation(&self) -> bool {
        self.tls_renegotiation
    }

    pub fn set_option(&mut self, option: &UploadOption) -> OptionResult {
        match option {
            UploadOption::TimeoutSecs(secs) => self.options.timeout_secs = *secs,
            UploadOption::TlsRenegotiation(enabled) => {
                self.tls_renegotiation = *enabled;
                if *enabled {
                    log::debug!("TLS renegotiation is negotiated automatically by this TLS stack");
                }
            }
            UploadOption::TrustedCerts(bundle) => {
                self.options.trusted_certs = Some(bundle.clone())
            }
            UploadOption::X509Cert(pem) => self.options.x509_cert = Some(pem.clone()),
            UploadOption::X509PrivateKey(pem) => {
                self.options.x509_private_key = Some(pem.clone())
            }
            UploadOption::OpensslPrivateKeyType(kind) => {
                self.options.openssl_private_key_type = Some(kind.clone())
            }
            UploadOption::OpensslEngine(engine) => {
                self.options.openssl_engine = Some(engine.clone())
            }
            UploadOption::Proxy {
                host,
                port,
                username,
                password,
            } => {
                self.options.proxy = Some(ProxyOptions {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                    password: password.clone(),
                });
            }
            UploadOption::Verbose(enabled) => self.options.verbose = *enabled,
            UploadOption::NetworkInterface(interface) => {
                self.options.network_interface = Some(interface.clone())
            }
            UploadOption::ProductInfo(info) => {
                self.user_agent = compose_user_agent(Some(info));
            }
        }
        OptionResult::Ok
    }

    /// Uploads a complete buffer as one blob, split into maximum-size
    /// blocks.
    pub fn upload_buffer(&mut self, blob_name: &str, data: &[u8]) -> Result<(), ClientError> {
        let mut offset = 0usize;
        let mut source = || {
            if offset >= data.len() {
                return BlockInput::Done;
            }
            let end = (offset + MAX_BLOCK_SIZE).min(data.len());
            let block = data[offset..end].to_vec();
            offset = end;
            BlockInput::Block(block)
        };
        self.upload_stream(blob_name, &mut source)
    }

    /// Uploads a blob from a pull-style source. The source is asked for
    /// blocks until it reports [`BlockInput::Done`] (or an empty block);
    /// [`BlockInput::Abort`] tears the upload down and notifies the hub
    /// of the failure.
    pub fn upload_stream(
        &mut self,
        blob_name: &str,
        source: &mut dyn FnMut() -> BlockInput,
    ) -> Result<(), ClientError> {
        let mut upload = self.initialize_upload(blob_name)?;

        let mut block_index: u32 = 0;
        loop {
            match source() {
                BlockInput::Abort => {
                    log::warn!("Blob upload aborted by the application");
                    if let Err(e) = upload.notify(false, 400, "Aborted by application") {
                        log::warn!("Unable to notify the hub about the aborted upload: {e:?}");
                    }
                    return Err(ClientError::failed("blob upload aborted by the application"));
                }
                BlockInput::Done => break,
                BlockInput::Block(block) if block.is_empty() => break,
                BlockInput::Block(block) => {
                    if let Err(e) = upload.put_block(block_index, &block) {
                        if let Err(notify_error) =
                            upload.notify(false, 500, "Block upload failed")
                        {
                            log::warn!(
                                "Unable to notify the hub about the failed upload: {notify_error:?}"
                            );
                        }
                        return Err(e);
                    }
                    block_index += 1;
                }
            }
        }

        if !upload.block_ids.is_empty() {
            if let Err(e) = upload.put_block_list() {
                if let Err(notify_error) = upload.notify(false, 500, "Block list commit failed") {
                    log::warn!(
                        "Unable to notify the hub about the failed upload: {notify_error:?}"
                    );
                }
                return Err(e);
            }
        }

        upload.notify(true, 200, "OK")
    }

    /// Stage one of the protocol: asks the hub for a SAS-signed blob URI
    /// and opens the connection to the blob endpoint. The returned handle
    /// exposes the discrete block operations for applications that drive
    /// chunking themselves.
    pub fn initialize_upload(&mut self, blob_name: &str) -> Result<BlobUpload, ClientError> {
        if blob_name.is_empty() {
            return Err(ClientError::InvalidArg("blob name is empty"));
        }

        let mut hub = self
            .connector
            .connect(&self.hostname, &self.options)
            .context("Unable to connect to the hub")?;

        let mut hub_headers = vec![(
            "Content-Type".to_owned(),
            "application/json".to_owned(),
        )];
        if let Some(authorization) = self
            .auth
            .authorization_header(&self.hostname)
            .context("Unable to build the hub authorization")?
        {
            hub_headers.push(("Authorization".to_owned(), authorization));
        }
        hub_headers.push(("User-Agent".to_owned(), self.user_agent.clone()));

        let encoded_device = urlencoding::encode(self.auth.device_id()).into_owned();
        let init_path = format!("/devices/{encoded_device}/files{API_VERSION}");
        let body = json!({ "blobName": blob_name }).to_string();

        let response = hub
            .execute(&HttpRequest {
                method: http::Method::POST,
                path: &init_path,
                headers: &hub_headers,
                body: Some(body.as_bytes()),
            })
            .context("Failed sending the request to initiate the file upload")?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Other(anyhow!(
                "file upload initiation answered with status code {}",
                response.status
            )));
        }

        let init: FileUploadInit = serde_json::from_slice(&response.body)
            .context("Failed parsing the file upload initiation response")?;

        let sas_uri = format!(
            "https://{}/{}/{}{}",
            init.host_name,
            init.container_name,
            urlencoding::encode(&init.blob_name),
            init.sas_token
        );
        let (blob_host, relative_path) =
            split_sas_uri(&sas_uri).context("The hub answered with an unusable SAS URI")?;

        let blob = self
            .connector
            .connect(blob_host, &self.options)
            .context("Unable to connect to the blob endpoint")?;

        log::debug!(
            "Upload of blob '{}' initiated with correlation ID {}",
            init.blob_name,
            init.correlation_id
        );

        Ok(BlobUpload {
            correlation_id: init.correlation_id,
            relative_path: relative_path.to_owned(),
            notification_path: format!("/devices/{encoded_device}/files/notifications{API_VERSION}"),
            blob,
            hub,
            hub_headers,
            user_agent: self.user_agent.clone(),
            block_ids: Vec::new(),
            state: UploadState::Connected,
        })
    }
}

/// One blob upload in flight: the connection to the blob endpoint plus
/// the accumulated block list.
pub struct BlobUpload {
    correlation_id: String,
    /// Blob path including the SAS query string.
    relative_path: String,
    notification_path: String,
    blob: Box<dyn HttpConnection>,
    hub: Box<dyn HttpConnection>,
    hub_headers: Vec<(String, String)>,
    user_agent: String,
    block_ids: Vec<String>,
    state: UploadState,
}

impl BlobUpload {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Uploads one block. Blocks are committed in the order of their
    /// indices by [`BlobUpload::put_block_list`].
    pub fn put_block(&mut self, block_index: u32, data: &[u8]) -> Result<(), ClientError> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(ClientError::InvalidArg("block exceeds the maximum size"));
        }
        if block_index >= MAX_BLOCK_COUNT {
            return Err(ClientError::InvalidArg("too many blocks for one blob"));
        }

        let block_id = block_id(block_index);
        let path = format!(
            "{}&comp=block&blockid={}",
            self.relative_path,
            urlencoding::encode(&block_id)
        );
        let headers = vec![
            ("x-ms-blob-type".to_owned(), "BlockBlob".to_owned()),
            ("User-Agent".to_owned(), self.user_agent.clone()),
        ];

        let response = self
            .blob
            .execute(&HttpRequest {
                method: http::Method::PUT,
                path: &path,
                headers: &headers,
                body: Some(data),
            })
            .context("Failed uploading a block to the blob endpoint")?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Other(anyhow!(
                "block upload answered with status code {}",
                response.status
            )));
        }

        self.block_ids.push(block_id);
        self.state = UploadState::Streaming;
        Ok(())
    }

    /// Commits the uploaded blocks, in upload order.
    pub fn put_block_list(&mut self) -> Result<(), ClientError> {
        if self.block_ids.is_empty() {
            return Err(ClientError::InvalidArg("no blocks to commit"));
        }

        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for block_id in &self.block_ids {
            body.push_str("<Latest>");
            body.push_str(block_id);
            body.push_str("</Latest>");
        }
        body.push_str("</BlockList>");

        let path = format!("{}&comp=blocklist", self.relative_path);
        let headers = vec![("User-Agent".to_owned(), self.user_agent.clone())];

        let response = self
            .blob
            .execute(&HttpRequest {
                method: http::Method::PUT,
                path: &path,
                headers: &headers,
                body: Some(body.as_bytes()),
            })
            .context("Failed committing the block list")?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Other(anyhow!(
                "block list commit answered with status code {}",
                response.status
            )));
        }

        self.state = UploadState::Committed;
        Ok(())
    }

    /// Stage three of the protocol: reports the outcome to the hub.
    pub fn notify(
        &mut self,
        success: bool,
        status_code: i32,
        description: &str,
    ) -> Result<(), ClientError> {
        let body = json!({
            "correlationId": self.correlation_id,
            "isSuccess": success,
            "statusCode": status_code,
            "statusDescription": description,
        })
        .to_string();

        let response = self
            .hub
            .execute(&HttpRequest {
                method: http::Method::POST,
                path: &self.notification_path,
                headers: &self.hub_headers,
                body: Some(body.as_bytes()),
            })
            .context("Failed sending the upload notification to the hub")?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Other(anyhow!(
                "upload notification answered with status code {}",
                response.status
            )));
        }

        self.state = UploadState::Notified;
        Ok(())
    }
}

/// Splits `https://<host>/<path>` at the first slash after the scheme.
fn split_sas_uri(sas_uri: &str) -> Result<(&str, &str)> {
    let rest = sas_uri
        .strip_prefix("https://")
        .ok_or_else(|| anyhow!("the SAS URI does not start with https://"))?;
    let slash = rest
        .find('/')
        .ok_or_else(|| anyhow!("the SAS URI has no path"))?;
    if slash == 0 {
        return Err(anyhow!("the SAS URI has an empty host"));
    }
    Ok((&rest[..slash], &rest[slash..]))
}

/// Zero-padded block numbers keep every base64 id the same length, which
/// the blob endpoint requires within one block list.
fn block_id(block_index: u32) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    BASE64.encode(format!("{block_index:06}"))
}
