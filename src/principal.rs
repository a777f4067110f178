use crate::error::SyncError;
use std::fmt;
use std::str::FromStr;
use tracing::error;

/// The primary of the realm master key principal, `K/M@REALM`.
const MASTER_KEY_SERVICE: &str = "K";
const MASTER_KEY_INSTANCE: &str = "M";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Principal {
    service: String,
    instance: Option<String>,
    realm: String,
}

impl Principal {
    pub fn service(srvname: &str, hostname: &str, realm: &str) -> Self {
        Principal {
            service: srvname.to_string(),
            instance: Some(hostname.to_string()),
            realm: realm.to_string(),
        }
    }

    pub fn master_key(realm: &str) -> Self {
        Self::service(MASTER_KEY_SERVICE, MASTER_KEY_INSTANCE, realm)
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn is_master_key(&self) -> bool {
        self.service == MASTER_KEY_SERVICE && self.instance.as_deref() == Some(MASTER_KEY_INSTANCE)
    }

    /// Parse a principal that may omit its realm, qualifying it with `realm`.
    pub fn parse_in_realm(name: &str, realm: &str) -> Result<Self, SyncError> {
        if name.contains('@') {
            name.parse()
        } else {
            format!("{name}@{realm}").parse()
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}/{}@{}", self.service, instance, self.realm),
            None => write!(f, "{}@{}", self.service, self.realm),
        }
    }
}

impl FromStr for Principal {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let Some((name, realm)) = s.rsplit_once('@') else {
            error!(principal = %s, "principal name has no realm");
            return Err(SyncError::PrincipalNameInvalid);
        };

        if realm.is_empty() || name.is_empty() || s.chars().any(char::is_whitespace) {
            error!(principal = %s, "principal name is malformed");
            return Err(SyncError::PrincipalNameInvalid);
        }

        let (service, instance) = match name.split_once('/') {
            Some((service, instance)) => (service, Some(instance)),
            None => (name, None),
        };

        if service.is_empty() || instance.is_some_and(str::is_empty) {
            error!(principal = %s, "principal name has an empty component");
            return Err(SyncError::PrincipalNameInvalid);
        }

        Ok(Principal {
            service: service.to_string(),
            instance: instance.map(str::to_string),
            realm: realm.to_string(),
        })
    }
}
