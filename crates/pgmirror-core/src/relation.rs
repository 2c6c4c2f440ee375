use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::value::StorageClass;

/// A qualified source table name (`schema.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`. Exactly one separator, both parts non-empty.
    pub fn parse(name: &str) -> Result<Self> {
        match name.split_once('.') {
            Some((schema, table))
                if !schema.is_empty() && !table.is_empty() && !table.contains('.') =>
            {
                Ok(Self::new(schema, table))
            }
            _ => Err(Error::InvalidTableName(name.to_string())),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the mirrored table in the local store.
    pub fn local_name(&self) -> String {
        format!("{}_{}", self.schema, self.table)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_oid: u32,
    pub storage: StorageClass,
    pub primary_key: bool,
}

/// Why a relation announcement no longer matches the cached descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftReason {
    Renamed { cached: TableName, announced: TableName },
    ColumnCount { cached: usize, announced: usize },
    ColumnName { ordinal: usize, cached: String, announced: String },
    ColumnType { column: String, cached: u32, announced: u32 },
    KeyFlag { column: String, announced: bool },
    NewRelationId { cached: u32, announced: u32 },
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftReason::Renamed { cached, announced } => {
                write!(f, "renamed from {} to {}", cached, announced)
            }
            DriftReason::ColumnCount { cached, announced } => {
                write!(f, "column count changed from {} to {}", cached, announced)
            }
            DriftReason::ColumnName {
                ordinal,
                cached,
                announced,
            } => write!(
                f,
                "column {} renamed from '{}' to '{}'",
                ordinal, cached, announced
            ),
            DriftReason::ColumnType {
                column,
                cached,
                announced,
            } => write!(
                f,
                "column '{}' type changed from {} to {}",
                column, cached, announced
            ),
            DriftReason::KeyFlag { column, announced } => write!(
                f,
                "column '{}' is {} part of the primary key",
                column,
                if *announced { "now" } else { "no longer" }
            ),
            DriftReason::NewRelationId { cached, announced } => {
                write!(f, "relation id changed from {} to {}", cached, announced)
            }
        }
    }
}

/// Cached schema of one registered source table. Immutable; a schema change
/// produces a new descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub relation_id: u32,
    pub name: TableName,
    pub columns: Vec<ColumnDescriptor>,
    key_indices: Vec<usize>,
}

impl RelationDescriptor {
    /// Build a descriptor. Tables without a primary key cannot be mirrored.
    pub fn new(relation_id: u32, name: TableName, columns: Vec<ColumnDescriptor>) -> Result<Self> {
        let key_indices: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();

        if key_indices.is_empty() {
            return Err(Error::MissingPrimaryKey(name.to_string()));
        }

        Ok(Self {
            relation_id,
            name,
            columns,
            key_indices,
        })
    }

    pub fn local_name(&self) -> String {
        self.name.local_name()
    }

    /// Ordinals of the primary-key columns, in ordinal order.
    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.key_indices.iter().map(move |&i| &self.columns[i])
    }

    /// Compare an announced relation against this descriptor.
    ///
    /// `compare_keys` should be false when the source announces key flags for
    /// something other than the primary key (replica identity FULL or INDEX).
    pub fn detect_drift(
        &self,
        relation_id: u32,
        name: &TableName,
        columns: &[ColumnDescriptor],
        compare_keys: bool,
    ) -> Option<DriftReason> {
        if relation_id != self.relation_id {
            return Some(DriftReason::NewRelationId {
                cached: self.relation_id,
                announced: relation_id,
            });
        }
        if name != &self.name {
            return Some(DriftReason::Renamed {
                cached: self.name.clone(),
                announced: name.clone(),
            });
        }
        if columns.len() != self.columns.len() {
            return Some(DriftReason::ColumnCount {
                cached: self.columns.len(),
                announced: columns.len(),
            });
        }
        for (ordinal, (cached, announced)) in self.columns.iter().zip(columns).enumerate() {
            if cached.name != announced.name {
                return Some(DriftReason::ColumnName {
                    ordinal,
                    cached: cached.name.clone(),
                    announced: announced.name.clone(),
                });
            }
            if cached.type_oid != announced.type_oid {
                return Some(DriftReason::ColumnType {
                    column: cached.name.clone(),
                    cached: cached.type_oid,
                    announced: announced.type_oid,
                });
            }
            if compare_keys && cached.primary_key != announced.primary_key {
                return Some(DriftReason::KeyFlag {
                    column: cached.name.clone(),
                    announced: announced.primary_key,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, type_oid: u32, primary_key: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            type_oid,
            storage: StorageClass::Integer,
            primary_key,
        }
    }

    fn users() -> RelationDescriptor {
        RelationDescriptor::new(
            16384,
            TableName::new("public", "users"),
            vec![column("id", 23, true), column("name", 25, false)],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_table_name() {
        let name = TableName::parse("public.users").unwrap();
        assert_eq!(name.schema(), "public");
        assert_eq!(name.table(), "users");
        assert_eq!(name.to_string(), "public.users");
        assert_eq!(name.local_name(), "public_users");

        assert!(TableName::parse("users").is_err());
        assert!(TableName::parse(".users").is_err());
        assert!(TableName::parse("public.").is_err());
        assert!(TableName::parse("a.b.c").is_err());
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let err = RelationDescriptor::new(
            1,
            TableName::new("s", "t"),
            vec![column("a", 23, false)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingPrimaryKey(ref t) if t == "s.t"));
    }

    #[test]
    fn test_composite_key_order() {
        let desc = RelationDescriptor::new(
            1,
            TableName::new("s", "t"),
            vec![
                column("tenant", 23, true),
                column("body", 25, false),
                column("id", 23, true),
            ],
        )
        .unwrap();
        assert_eq!(desc.key_indices(), &[0, 2]);
        let names: Vec<_> = desc.key_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tenant", "id"]);
    }

    #[test]
    fn test_no_drift_for_identical_announcement() {
        let desc = users();
        assert_eq!(
            desc.detect_drift(16384, &desc.name, &desc.columns, true),
            None
        );
    }

    #[test]
    fn test_drift_detection() {
        let desc = users();

        let mut added = desc.columns.clone();
        added.push(column("email", 25, false));
        assert_eq!(
            desc.detect_drift(16384, &desc.name, &added, true),
            Some(DriftReason::ColumnCount {
                cached: 2,
                announced: 3
            })
        );

        let mut retyped = desc.columns.clone();
        retyped[1].type_oid = 1043;
        assert!(matches!(
            desc.detect_drift(16384, &desc.name, &retyped, true),
            Some(DriftReason::ColumnType { .. })
        ));

        let mut renamed = desc.columns.clone();
        renamed[1].name = "full_name".to_string();
        assert!(matches!(
            desc.detect_drift(16384, &desc.name, &renamed, true),
            Some(DriftReason::ColumnName { ordinal: 1, .. })
        ));

        let mut rekeyed = desc.columns.clone();
        rekeyed[1].primary_key = true;
        assert!(matches!(
            desc.detect_drift(16384, &desc.name, &rekeyed, true),
            Some(DriftReason::KeyFlag { .. })
        ));
        assert_eq!(desc.detect_drift(16384, &desc.name, &rekeyed, false), None);

        assert!(matches!(
            desc.detect_drift(16384, &TableName::new("public", "people"), &desc.columns, true),
            Some(DriftReason::Renamed { .. })
        ));
        assert!(matches!(
            desc.detect_drift(16999, &desc.name, &desc.columns, true),
            Some(DriftReason::NewRelationId { .. })
        ));
    }
}
