use crate::Result;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionLanguage {
    Sql,
    Python,
}

impl Default for FunctionLanguage {
    fn default() -> Self {
        FunctionLanguage::Sql
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FunctionParam {
    pub name: String,
    pub data_type: String,
}

/// Function payload: scalar or table function, possibly a policy function
///
/// Row filter functions must return BOOLEAN; column mask functions
/// return the masked value and are referenced from column masks or
/// ABAC mask policies.
///
/// ```yaml
/// language: sql
/// parameters:
/// - name: region
///   data_type: STRING
/// return_type: BOOLEAN
/// definition: "region = current_user_region()"
/// is_row_filter: true
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FunctionSpec {
    #[serde(default)]
    pub language: FunctionLanguage,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<FunctionParam>,

    pub return_type: String,

    /// Function body (RETURN expression for SQL)
    pub definition: String,

    #[serde(default)]
    pub is_table_function: bool,

    #[serde(default)]
    pub is_row_filter: bool,

    #[serde(default)]
    pub is_column_mask: bool,
}

impl FunctionSpec {
    pub fn verify(&self, function: &str) -> Result<()> {
        ensure!(
            !self.definition.is_empty(),
            "Function {} has no definition",
            function
        );
        ensure!(
            !self.return_type.is_empty(),
            "Function {} has no return type",
            function
        );
        if self.is_row_filter && self.is_column_mask {
            bail!(
                "Function {} cannot be both a row filter and a column mask",
                function
            );
        }
        if self.is_row_filter && !self.return_type.eq_ignore_ascii_case("boolean") {
            bail!(
                "Row filter function {} must return BOOLEAN (returns {})",
                function,
                self.return_type
            );
        }
        if self.is_table_function && (self.is_row_filter || self.is_column_mask) {
            bail!("Policy function {} cannot be a table function", function);
        }
        for p in &self.parameters {
            ensure!(
                !p.name.is_empty() && !p.data_type.is_empty(),
                "Function {} has an incomplete parameter",
                function
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FunctionParam, FunctionSpec};

    fn filter_fn() -> FunctionSpec {
        FunctionSpec {
            parameters: vec![FunctionParam {
                name: "region".into(),
                data_type: "STRING".into(),
            }],
            return_type: "BOOLEAN".into(),
            definition: "region = current_user_region()".into(),
            is_row_filter: true,
            ..Default::default()
        }
    }

    #[test]
    fn row_filters_return_boolean() {
        let mut f = filter_fn();
        assert!(f.verify("only_own_region").is_ok());
        f.return_type = "STRING".into();
        assert!(f.verify("only_own_region").is_err());
    }

    #[test]
    fn filter_and_mask_are_exclusive() {
        let mut f = filter_fn();
        f.is_column_mask = true;
        assert!(f.verify("broken").is_err());
    }
}
