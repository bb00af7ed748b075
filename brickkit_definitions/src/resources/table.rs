use std::collections::BTreeMap;

use regex::Regex;

use crate::Result;

/// How the table's storage is managed
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Managed,
    External,
    View,
}

impl Default for TableType {
    fn default() -> Self {
        TableType::Managed
    }
}

/// A column mask bound directly to a column
///
/// The referenced function receives the column value plus any
/// `using_columns` and returns the masked value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ColumnMask {
    pub function_ref: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub using_columns: Vec<String>,
}

/// One column of a declared table
///
/// ```yaml
/// name: email
/// data_type: STRING
/// mask:
///   function_ref: mask_email
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Column {
    pub name: String,

    /// SQL data type, e.g. STRING, BIGINT, DECIMAL(10,2)
    pub data_type: String,

    #[serde(default = "default_nullable")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Direct column mask; mutually exclusive with ABAC mask policies
    /// that match this table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<ColumnMask>,
}

fn default_nullable() -> bool {
    true
}

/// A row filter bound directly to the table
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RowFilter {
    pub function_ref: String,
    /// Columns passed as arguments to the filter function
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_columns: Vec<String>,
}

/// Table payload: columns, type, partitioning and direct policies
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,

    #[serde(default)]
    pub table_type: TableType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_by: Vec<String>,

    /// Direct row filter; mutually exclusive with ABAC row filter
    /// policies that match this table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_filter: Option<RowFilter>,

    /// SELECT body for views
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_definition: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl TableSpec {
    pub fn verify(&self, table: &str) -> Result<()> {
        let colre = Regex::new(r"^[0-9a-zA-Z_]{1,255}$").unwrap();
        if self.table_type == TableType::View {
            ensure!(
                self.view_definition.is_some(),
                "View {} needs a view_definition",
                table
            );
            ensure!(
                self.row_filter.is_none(),
                "View {} cannot carry a direct row filter",
                table
            );
            return Ok(());
        }
        ensure!(!self.columns.is_empty(), "Table {} has no columns", table);
        for c in &self.columns {
            if !colre.is_match(&c.name) {
                bail!("Table {} column '{}' has an invalid name", table, c.name);
            }
            ensure!(
                !c.data_type.is_empty(),
                "Table {} column '{}' has no data type",
                table,
                c.name
            );
        }
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        for p in &self.partition_by {
            if !names.contains(&p.as_str()) {
                bail!("Table {} partitions by unknown column '{}'", table, p);
            }
        }
        if let Some(ref rf) = self.row_filter {
            ensure!(
                !rf.function_ref.is_empty(),
                "Table {} row filter needs a function reference",
                table
            );
            for col in &rf.on_columns {
                if !names.contains(&col.as_str()) {
                    bail!("Table {} row filter uses unknown column '{}'", table, col);
                }
            }
        }
        for c in &self.columns {
            if let Some(ref m) = c.mask {
                for u in &m.using_columns {
                    if !names.contains(&u.as_str()) {
                        bail!(
                            "Table {} mask on '{}' uses unknown column '{}'",
                            table,
                            c.name,
                            u
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Columns that carry a direct mask, as `(column, mask)` pairs
    pub fn masked_columns(&self) -> Vec<(&Column, &ColumnMask)> {
        self.columns
            .iter()
            .filter_map(|c| c.mask.as_ref().map(|m| (c, m)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Column, ColumnMask, RowFilter, TableSpec, TableType};

    fn col(name: &str) -> Column {
        Column {
            name: name.into(),
            data_type: "STRING".into(),
            nullable: true,
            comment: None,
            mask: None,
        }
    }

    #[test]
    fn verify_catches_unknown_partition_column() {
        let mut spec = TableSpec::default();
        spec.columns = vec![col("id"), col("region")];
        spec.partition_by = vec!["created_at".into()];
        assert!(spec.verify("orders").is_err());
        spec.partition_by = vec!["region".into()];
        assert!(spec.verify("orders").is_ok());
    }

    #[test]
    fn verify_checks_filter_and_mask_columns() {
        let mut spec = TableSpec::default();
        let mut email = col("email");
        email.mask = Some(ColumnMask {
            function_ref: "mask_email".into(),
            using_columns: vec!["tenant".into()],
        });
        spec.columns = vec![col("id"), email];
        assert!(spec.verify("users").is_err()); // `tenant` does not exist
        spec.columns.push(col("tenant"));
        assert!(spec.verify("users").is_ok());

        spec.row_filter = Some(RowFilter {
            function_ref: "only_own_tenant".into(),
            on_columns: vec!["nope".into()],
        });
        assert!(spec.verify("users").is_err());
    }

    #[test]
    fn views_need_definitions_not_columns() {
        let mut spec = TableSpec::default();
        spec.table_type = TableType::View;
        assert!(spec.verify("v_orders").is_err());
        spec.view_definition = Some("SELECT 1".into());
        assert!(spec.verify("v_orders").is_ok());
    }
}
