//! SQL statement builders for the warehouse path
//!
//! Everything the control plane cannot express goes through here:
//! table DDL, functions, policies, row filters, column masks, tags.

use brickkit_definitions::resources::{
    FunctionLanguage, FunctionSpec, ResourceType, TableSpec, TableType,
};
use brickkit_definitions::Resource;

use crate::backend::PolicyRecord;
use crate::Result;
use brickkit_definitions::access::PolicyType;

/// Backtick-quote one identifier
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a dotted fqn part by part
pub fn quote_fqn(fqn: &str) -> String {
    fqn.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Single-quote a string literal
pub fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// The securable keyword used in ALTER / GRANT statements
pub fn securable_keyword(rt: ResourceType) -> &'static str {
    match rt {
        ResourceType::Metastore => "METASTORE",
        ResourceType::Catalog => "CATALOG",
        ResourceType::Schema => "SCHEMA",
        ResourceType::Table => "TABLE",
        ResourceType::Volume => "VOLUME",
        ResourceType::Function => "FUNCTION",
        ResourceType::Space => "SPACE",
        ResourceType::VectorEndpoint => "VECTOR ENDPOINT",
        ResourceType::VectorIndex => "VECTOR INDEX",
        ResourceType::Model => "MODEL",
        ResourceType::StorageCredential => "STORAGE CREDENTIAL",
        ResourceType::ExternalLocation => "EXTERNAL LOCATION",
        ResourceType::Connection => "CONNECTION",
    }
}

/// Full CREATE TABLE / CREATE VIEW DDL for a declared table
///
/// Row filters and column masks are never part of the create; they
/// are applied afterwards so the statement is accepted everywhere.
pub fn create_table(resource: &Resource, spec: &TableSpec) -> Result<String> {
    let fqn = quote_fqn(&resource.fqn());
    if spec.table_type == TableType::View {
        let body = spec
            .view_definition
            .as_ref()
            .ok_or_else(|| format_err!("View {} has no definition", resource.fqn()))?;
        return Ok(format!("CREATE OR REPLACE VIEW {} AS {}", fqn, body));
    }
    let mut cols = Vec::new();
    for c in &spec.columns {
        let mut col = format!("{} {}", quote_ident(&c.name), c.data_type);
        if !c.nullable {
            col.push_str(" NOT NULL");
        }
        if let Some(ref comment) = c.comment {
            col.push_str(&format!(" COMMENT {}", quote_str(comment)));
        }
        cols.push(col);
    }
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} ({}) USING DELTA", fqn, cols.join(", "));
    if !spec.partition_by.is_empty() {
        let parts: Vec<String> = spec.partition_by.iter().map(|p| quote_ident(p)).collect();
        sql.push_str(&format!(" PARTITIONED BY ({})", parts.join(", ")));
    }
    if spec.table_type == TableType::External {
        if let Some(loc) = resource.effective_location() {
            sql.push_str(&format!(" LOCATION {}", quote_str(&loc)));
        }
    }
    if let Some(ref comment) = resource.comment {
        sql.push_str(&format!(" COMMENT {}", quote_str(comment)));
    }
    if !spec.properties.is_empty() {
        let props: Vec<String> = spec
            .properties
            .iter()
            .map(|(k, v)| format!("{} = {}", quote_str(k), quote_str(v)))
            .collect();
        sql.push_str(&format!(" TBLPROPERTIES ({})", props.join(", ")));
    }
    Ok(sql)
}

pub fn drop_table(fqn: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_fqn(fqn))
}

/// CREATE OR REPLACE FUNCTION for scalar, table and policy functions
pub fn create_function(resource: &Resource, spec: &FunctionSpec) -> String {
    let fqn = quote_fqn(&resource.fqn());
    let params: Vec<String> = spec
        .parameters
        .iter()
        .map(|p| format!("{} {}", quote_ident(&p.name), p.data_type))
        .collect();
    let returns = if spec.is_table_function {
        format!("RETURNS TABLE ({})", spec.return_type)
    } else {
        format!("RETURNS {}", spec.return_type)
    };
    match spec.language {
        FunctionLanguage::Sql => format!(
            "CREATE OR REPLACE FUNCTION {} ({}) {} RETURN {}",
            fqn,
            params.join(", "),
            returns,
            spec.definition
        ),
        FunctionLanguage::Python => format!(
            "CREATE OR REPLACE FUNCTION {} ({}) {} LANGUAGE PYTHON AS $$\n{}\n$$",
            fqn,
            params.join(", "),
            returns,
            spec.definition
        ),
    }
}

pub fn drop_function(fqn: &str) -> String {
    format!("DROP FUNCTION IF EXISTS {}", quote_fqn(fqn))
}

pub fn set_row_filter(table_fqn: &str, function_ref: &str, on_columns: &[String]) -> String {
    let cols: Vec<String> = on_columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "ALTER TABLE {} SET ROW FILTER {} ON ({})",
        quote_fqn(table_fqn),
        quote_fqn(function_ref),
        cols.join(", ")
    )
}

pub fn drop_row_filter(table_fqn: &str) -> String {
    format!("ALTER TABLE {} DROP ROW FILTER", quote_fqn(table_fqn))
}

pub fn set_column_mask(
    table_fqn: &str,
    column: &str,
    function_ref: &str,
    using_columns: &[String],
) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ALTER COLUMN {} SET MASK {}",
        quote_fqn(table_fqn),
        quote_ident(column),
        quote_fqn(function_ref)
    );
    if !using_columns.is_empty() {
        let cols: Vec<String> = using_columns.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" USING COLUMNS ({})", cols.join(", ")));
    }
    sql
}

pub fn drop_column_mask(table_fqn: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} DROP MASK",
        quote_fqn(table_fqn),
        quote_ident(column)
    )
}

/// CREATE OR REPLACE POLICY for tag-driven row filters and masks
pub fn create_policy(container_rt: ResourceType, container_fqn: &str, policy: &PolicyRecord) -> String {
    let conditions: Vec<String> = policy.match_conditions.iter().map(|c| c.as_sql()).collect();
    let action = match policy.policy_type {
        PolicyType::RowFilter => format!("ROW FILTER {}", quote_fqn(&policy.function_ref)),
        PolicyType::ColumnMask => format!(
            "COLUMN MASK {} ON COLUMN {}",
            quote_fqn(&policy.function_ref),
            quote_ident(policy.target_column.as_deref().unwrap_or_default())
        ),
    };
    format!(
        "CREATE OR REPLACE POLICY {} ON {} {} {} FOR TABLES WHEN {}",
        quote_ident(&policy.name),
        securable_keyword(container_rt),
        quote_fqn(container_fqn),
        action,
        conditions.join(" AND ")
    )
}

pub fn drop_policy(container_rt: ResourceType, container_fqn: &str, name: &str) -> String {
    format!(
        "DROP POLICY IF EXISTS {} ON {} {}",
        quote_ident(name),
        securable_keyword(container_rt),
        quote_fqn(container_fqn)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickkit_definitions::access::{MatchCondition, PolicyType};
    use brickkit_definitions::resources::{Column, TableSpec};
    use brickkit_definitions::Resource;

    fn spec() -> TableSpec {
        let mut s = TableSpec::default();
        s.columns = vec![
            Column {
                name: "id".into(),
                data_type: "BIGINT".into(),
                nullable: false,
                comment: None,
                mask: None,
            },
            Column {
                name: "region".into(),
                data_type: "STRING".into(),
                nullable: true,
                comment: Some("iso code".into()),
                mask: None,
            },
        ];
        s.partition_by = vec!["region".into()];
        s
    }

    #[test]
    fn create_table_ddl() {
        let mut table = Resource::table("orders", spec());
        table.catalog_name = Some("analytics_dev".into());
        table.schema_name = Some("sales".into());
        let spec = match &table.kind {
            brickkit_definitions::resources::ResourceKind::Table(s) => s.clone(),
            _ => unreachable!(),
        };
        let sql = create_table(&table, &spec).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `analytics_dev`.`sales`.`orders` \
             (`id` BIGINT NOT NULL, `region` STRING COMMENT 'iso code') USING DELTA \
             PARTITIONED BY (`region`)"
        );
    }

    #[test]
    fn row_filter_statements() {
        assert_eq!(
            set_row_filter("c.s.t", "c.s.f", &["region".to_string()]),
            "ALTER TABLE `c`.`s`.`t` SET ROW FILTER `c`.`s`.`f` ON (`region`)"
        );
        assert_eq!(drop_row_filter("c.s.t"), "ALTER TABLE `c`.`s`.`t` DROP ROW FILTER");
    }

    #[test]
    fn policy_ddl() {
        let p = crate::backend::PolicyRecord {
            name: "hide_pii_rows".into(),
            policy_type: PolicyType::RowFilter,
            function_ref: "prod.customers.pii_row_filter".into(),
            target_column: None,
            match_conditions: vec![MatchCondition {
                tag_key: "pii".into(),
                tag_value: Some("true".into()),
            }],
        };
        let sql = create_policy(ResourceType::Schema, "prod.customers", &p);
        assert_eq!(
            sql,
            "CREATE OR REPLACE POLICY `hide_pii_rows` ON SCHEMA `prod`.`customers` \
             ROW FILTER `prod`.`customers`.`pii_row_filter` FOR TABLES WHEN hasTagValue('pii', 'true')"
        );
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        assert_eq!(quote_str("it's"), "'it''s'");
    }
}
