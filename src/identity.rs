//! Device and module identities
//!
//! An [`Identity`] names one connection endpoint: a device, or a module running
//! on a device. It is the key for every per-identity lookup in the hub.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of identity, derived from the presence of a module id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Device,
    Module,
}

/// Immutable `(device_id, module_id)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    device_id: String,
    module_id: Option<String>,
}

impl Identity {
    /// Identity of a leaf device
    pub fn device<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
        }
    }

    /// Identity of a module hosted on `device_id`
    pub fn module<D: Into<String>, M: Into<String>>(device_id: D, module_id: M) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
        }
    }

    /// Parse `device` or `device/module`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(2, '/');
        let device_id = parts.next().filter(|d| is_valid_id(d))?;
        match parts.next() {
            None => Some(Self::device(device_id)),
            Some(module_id) if is_valid_id(module_id) => Some(Self::module(device_id, module_id)),
            Some(_) => None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn kind(&self) -> IdentityKind {
        if self.module_id.is_some() {
            IdentityKind::Module
        } else {
            IdentityKind::Device
        }
    }

    pub fn is_module(&self) -> bool {
        self.kind() == IdentityKind::Module
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            Some(module_id) => write!(f, "{}/{}", self.device_id, module_id),
            None => f.write_str(&self.device_id),
        }
    }
}

/// Identifier characters accepted by the hub: `[A-Za-z0-9._:-]+`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
}

/// How an identity authenticates upstream
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Shared access signature token
    SasToken { token: String },
    /// X.509 client certificate, referenced by thumbprint
    X509 { thumbprint: String },
}

/// Credentials presented by a transport session on connect
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth: AuthMethod,
    /// Product info string forwarded upstream, if the device sent one
    #[serde(default)]
    pub product_info: Option<String>,
}

impl Credentials {
    pub fn sas_token<S: Into<String>>(token: S) -> Self {
        Self {
            auth: AuthMethod::SasToken {
                token: token.into(),
            },
            product_info: None,
        }
    }

    pub fn x509<S: Into<String>>(thumbprint: S) -> Self {
        Self {
            auth: AuthMethod::X509 {
                thumbprint: thumbprint.into(),
            },
            product_info: None,
        }
    }

    pub fn with_product_info<S: Into<String>>(mut self, product_info: S) -> Self {
        self.product_info = Some(product_info.into());
        self
    }
}

// Tokens must never reach logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match &self.auth {
            AuthMethod::SasToken { .. } => "SasToken(***)".to_string(),
            AuthMethod::X509 { thumbprint } => format!("X509({thumbprint})"),
        };
        f.debug_struct("Credentials")
            .field("auth", &auth)
            .field("product_info", &self.product_info)
            .finish()
    }
}
