use crate::Result;

/// Whether the catalog service or the caller owns the storage
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    Managed,
    External,
}

impl Default for VolumeType {
    fn default() -> Self {
        VolumeType::Managed
    }
}

/// Volume payload
///
/// External volumes need a storage location, either set directly on
/// the resource or inherited from an ancestor container.
///
/// ```yaml
/// volume_type: external
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeSpec {
    #[serde(default)]
    pub volume_type: VolumeType,
}

impl VolumeSpec {
    pub fn verify(&self, volume: &str, effective_location: Option<&str>) -> Result<()> {
        if self.volume_type == VolumeType::External && effective_location.is_none() {
            bail!(
                "External volume {} has no storage location (own or inherited)",
                volume
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{VolumeSpec, VolumeType};

    #[test]
    fn external_volume_needs_a_location() {
        let spec = VolumeSpec {
            volume_type: VolumeType::External,
        };
        assert!(spec.verify("raw_files", None).is_err());
        assert!(spec.verify("raw_files", Some("abfss://lake/raw")).is_ok());
        // managed volumes do not care
        let managed = VolumeSpec::default();
        assert!(managed.verify("scratch", None).is_ok());
    }
}
