use crate::Result;

/// Deployment stage of a registered model
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    Development,
    Staging,
    Production,
    Archived,
}

impl Default for ModelStage {
    fn default() -> Self {
        ModelStage::Development
    }
}

/// Registered ML model payload
///
/// Tier 1 is the most critical; ownership drift on tier-1 models is
/// classified as critical by the drift detector.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    /// Criticality tier, 1..=3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,

    #[serde(default)]
    pub stage: ModelStage,

    /// Upstream table fqns feeding the model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<String>,
}

impl ModelSpec {
    pub fn verify(&self, model: &str) -> Result<()> {
        if let Some(t) = self.tier {
            if t == 0 || t > 3 {
                bail!("Model {} tier {} out of range (1..=3)", model, t);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ModelSpec;

    #[test]
    fn tier_is_bounded() {
        let mut m = ModelSpec::default();
        assert!(m.verify("churn").is_ok());
        m.tier = Some(1);
        assert!(m.verify("churn").is_ok());
        m.tier = Some(4);
        assert!(m.verify("churn").is_err());
        m.tier = Some(0);
        assert!(m.verify("churn").is_err());
    }
}
