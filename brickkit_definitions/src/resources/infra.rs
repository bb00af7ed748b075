use std::collections::BTreeMap;

use crate::Result;

/// Storage credential payload
///
/// Exactly one cloud identity must be set.
///
/// ```yaml
/// azure_managed_identity: /subscriptions/.../userAssignedIdentities/lake-mi
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_managed_identity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_iam_role: Option<String>,

    #[serde(default)]
    pub read_only: bool,
}

impl CredentialSpec {
    pub fn verify(&self, credential: &str) -> Result<()> {
        let set = self.azure_managed_identity.is_some() as u8 + self.aws_iam_role.is_some() as u8;
        if set != 1 {
            bail!(
                "Storage credential {} must set exactly one cloud identity ({} set)",
                credential,
                set
            );
        }
        Ok(())
    }
}

/// External location payload: a cloud path bound to a credential
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LocationSpec {
    /// Cloud url, e.g. `abfss://container@account.dfs.core.windows.net/lake`
    pub url: String,

    /// Name of the storage credential authorizing access
    pub credential_name: String,

    #[serde(default)]
    pub read_only: bool,
}

impl LocationSpec {
    pub fn verify(&self, location: &str) -> Result<()> {
        ensure!(!self.url.is_empty(), "External location {} has no url", location);
        if !self.url.contains("://") {
            bail!(
                "External location {} url '{}' is not a cloud url",
                location,
                self.url
            );
        }
        ensure!(
            !self.credential_name.is_empty(),
            "External location {} names no storage credential",
            location
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Mysql,
    Postgresql,
    Snowflake,
    Sqlserver,
    Http,
}

/// Foreign connection payload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSpec {
    pub connection_type: ConnectionType,

    /// Connection options (host, port, ...); secrets stay in the
    /// credential manager and are referenced, never inlined
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConnectionSpec {
    pub fn verify(&self, connection: &str) -> Result<()> {
        match self.connection_type {
            ConnectionType::Http => {}
            _ => {
                ensure!(
                    self.options.contains_key("host"),
                    "Connection {} needs a host option",
                    connection
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionSpec, ConnectionType, CredentialSpec, LocationSpec};

    #[test]
    fn credential_needs_exactly_one_identity() {
        let mut c = CredentialSpec::default();
        assert!(c.verify("lake_mi").is_err());
        c.azure_managed_identity = Some("/subscriptions/x/mi".into());
        assert!(c.verify("lake_mi").is_ok());
        c.aws_iam_role = Some("arn:aws:iam::1:role/lake".into());
        assert!(c.verify("lake_mi").is_err());
    }

    #[test]
    fn location_url_is_checked() {
        let mut l = LocationSpec {
            url: "not-a-url".into(),
            credential_name: "lake_mi".into(),
            read_only: false,
        };
        assert!(l.verify("lake_raw").is_err());
        l.url = "abfss://lake@acct.dfs.core.windows.net/raw".into();
        assert!(l.verify("lake_raw").is_ok());
    }

    #[test]
    fn sql_connections_need_hosts() {
        let mut c = ConnectionSpec {
            connection_type: ConnectionType::Postgresql,
            options: Default::default(),
        };
        assert!(c.verify("warehouse").is_err());
        c.options.insert("host".into(), "db.internal".into());
        assert!(c.verify("warehouse").is_ok());
    }
}
