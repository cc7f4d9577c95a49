//! Parsing of the semicolon-delimited device connection string.

use crate::auth::Credentials;
use crate::error::ClientError;

use super::{ClientConfig, DeviceConfig};

/// Parses `HostName=…;DeviceId=…;SharedAccessKey=…` (and friends) into a
/// [`ClientConfig`].
///
/// Exactly one of `SharedAccessKey`, `SharedAccessSignature` or
/// `x509=true` must be present. `GatewayHostName` overrides the effective
/// hostname; `HostName` itself must still name the hub as
/// `<name>.<suffix>`.
pub(crate) fn parse(connection_string: &str) -> Result<ClientConfig, ClientError> {
    let mut host_name = None;
    let mut device_id = None;
    let mut shared_access_key = None;
    let mut shared_access_signature = None;
    let mut gateway_host_name = None;
    let mut x509 = None;

    for part in connection_string.split(';') {
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            return Err(ClientError::InvalidArg(
                "connection string segment is not a key=value pair",
            ));
        };
        match key {
            "HostName" => host_name = Some(value),
            "DeviceId" => device_id = Some(value),
            "SharedAccessKey" => shared_access_key = Some(value),
            // The signature value itself may contain '=' characters, which
            // split_once left attached to `value`.
            "SharedAccessSignature" => shared_access_signature = Some(value),
            "GatewayHostName" => gateway_host_name = Some(value),
            "x509" => x509 = Some(value),
            other => {
                log::debug!("Ignoring unrecognized connection string key '{other}'");
            }
        }
    }

    let host_name =
        host_name.ok_or(ClientError::InvalidArg("connection string lacks HostName"))?;
    let device_id =
        device_id.ok_or(ClientError::InvalidArg("connection string lacks DeviceId"))?;

    let Some((hub_name, hub_suffix)) = host_name.split_once('.') else {
        return Err(ClientError::InvalidArg(
            "HostName must have the form <hub-name>.<hub-suffix>",
        ));
    };
    if hub_name.is_empty() || hub_suffix.is_empty() {
        return Err(ClientError::InvalidArg(
            "HostName must have the form <hub-name>.<hub-suffix>",
        ));
    }

    if let Some(x509) = x509 {
        if x509 != "true" {
            return Err(ClientError::InvalidArg("x509 only accepts the value true"));
        }
    }

    let credentials = match (shared_access_key, shared_access_signature, x509) {
        (Some(key), None, None) => Credentials::DeviceKey(key.to_owned()),
        (None, Some(signature), None) => Credentials::SasToken(signature.to_owned()),
        (None, None, Some(_)) => Credentials::X509 {
            cert: None,
            private_key: None,
        },
        (None, None, None) => {
            return Err(ClientError::InvalidArg(
                "connection string lacks a credential",
            ))
        }
        _ => {
            return Err(ClientError::InvalidArg(
                "connection string carries more than one credential",
            ))
        }
    };

    Ok(ClientConfig {
        hub_name: hub_name.to_owned(),
        hub_suffix: hub_suffix.to_owned(),
        gateway_hostname: gateway_host_name.map(str::to_owned),
        device: DeviceConfig {
            device_id: device_id.to_owned(),
            credentials,
            clock: None,
        },
    })
}
