use crate::Result;

/// Conversational analytics space payload
///
/// Spaces reference tables and functions they may query; the engine
/// governs the space itself, not its conversations.
///
/// ```yaml
/// table_refs:
/// - analytics.sales.orders
/// instructions: "Prefer the curated gold tables."
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SpaceSpec {
    pub table_refs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_refs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl SpaceSpec {
    pub fn verify(&self, space: &str) -> Result<()> {
        ensure!(
            !self.table_refs.is_empty(),
            "Space {} references no tables",
            space
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Standard,
    Optimized,
}

impl Default for EndpointType {
    fn default() -> Self {
        EndpointType::Standard
    }
}

/// Vector search endpoint payload
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VectorEndpointSpec {
    #[serde(default)]
    pub endpoint_type: EndpointType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Kept in sync from a source delta table
    DeltaSync,
    /// Written to directly by the caller
    DirectAccess,
}

impl Default for IndexType {
    fn default() -> Self {
        IndexType::DeltaSync
    }
}

/// Vector search index payload
///
/// Indexes live in a schema and are served by an endpoint declared
/// (or referenced) elsewhere.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VectorIndexSpec {
    /// Name of the serving endpoint
    pub endpoint: String,

    #[serde(default)]
    pub index_type: IndexType,

    pub primary_key: String,

    /// Source table fqn, required for delta sync indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_source_column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimension: Option<u32>,
}

impl VectorIndexSpec {
    pub fn verify(&self, index: &str) -> Result<()> {
        ensure!(
            !self.endpoint.is_empty(),
            "Vector index {} names no endpoint",
            index
        );
        ensure!(
            !self.primary_key.is_empty(),
            "Vector index {} has no primary key",
            index
        );
        if self.index_type == IndexType::DeltaSync && self.source_table.is_none() {
            bail!("Delta sync index {} needs a source_table", index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexType, SpaceSpec, VectorIndexSpec};

    #[test]
    fn space_needs_tables() {
        let mut s = SpaceSpec::default();
        assert!(s.verify("sales_qa").is_err());
        s.table_refs.push("analytics.sales.orders".into());
        assert!(s.verify("sales_qa").is_ok());
    }

    #[test]
    fn delta_sync_index_needs_source() {
        let mut idx = VectorIndexSpec {
            endpoint: "vs_main".into(),
            primary_key: "id".into(),
            ..Default::default()
        };
        assert!(idx.verify("docs_idx").is_err());
        idx.source_table = Some("analytics.docs.chunks".into());
        assert!(idx.verify("docs_idx").is_ok());
        // direct access indexes do not need one
        idx.source_table = None;
        idx.index_type = IndexType::DirectAccess;
        assert!(idx.verify("docs_idx").is_ok());
    }
}
