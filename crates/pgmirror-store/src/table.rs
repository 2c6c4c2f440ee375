use pgmirror_core::RelationDescriptor;

/// Quote an identifier for SQLite, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The local mirror of one registered table: its name plus the statements
/// used to maintain it. Statements are prepared through the connection's
/// statement cache, keyed by their SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTable {
    name: String,
    columns: Vec<String>,
    key_columns: Vec<String>,
    create_sql: String,
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    truncate_sql: String,
}

impl LocalTable {
    pub fn new(descriptor: &RelationDescriptor) -> Self {
        let name = descriptor.local_name();
        let table = quote_ident(&name);
        let columns: Vec<String> = descriptor.columns.iter().map(|c| c.name.clone()).collect();
        let key_columns: Vec<String> = descriptor.key_columns().map(|c| c.name.clone()).collect();

        let column_defs: Vec<String> = descriptor
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.storage.as_sql()))
            .collect();
        let quoted_keys: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();
        let create_sql = format!(
            "CREATE TABLE {} ({}, PRIMARY KEY ({}))",
            table,
            column_defs.join(", "),
            quoted_keys.join(", ")
        );

        let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let insert_sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table,
            quoted_columns.join(", "),
            placeholders.join(", ")
        );

        let all_present = vec![true; columns.len()];
        let update_sql = build_update(&table, &columns, &key_columns, &all_present);
        let delete_sql = format!(
            "DELETE FROM {} WHERE {}",
            table,
            key_predicate(&key_columns, 1)
        );
        let truncate_sql = format!("DELETE FROM {}", table);

        Self {
            name,
            columns,
            key_columns,
            create_sql,
            insert_sql,
            update_sql,
            delete_sql,
            truncate_sql,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub(crate) fn create_sql(&self) -> &str {
        &self.create_sql
    }

    pub(crate) fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_ident(&self.name))
    }

    pub(crate) fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    pub(crate) fn delete_sql(&self) -> &str {
        &self.delete_sql
    }

    pub(crate) fn truncate_sql(&self) -> &str {
        &self.truncate_sql
    }

    /// UPDATE for a given set of present columns. The full-row shape is
    /// built once; shapes that skip unchanged columns are built on demand.
    pub(crate) fn update_sql(&self, present: &[bool]) -> String {
        if present.iter().all(|p| *p) {
            self.update_sql.clone()
        } else {
            build_update(
                &quote_ident(&self.name),
                &self.columns,
                &self.key_columns,
                present,
            )
        }
    }

    /// The four maintenance statements, in the order they are prepared.
    pub(crate) fn statements(&self) -> [&str; 4] {
        [
            &self.insert_sql,
            &self.update_sql,
            &self.delete_sql,
            &self.truncate_sql,
        ]
    }
}

fn key_predicate(key_columns: &[String], first_param: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn build_update(table: &str, columns: &[String], key_columns: &[String], present: &[bool]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .zip(present)
        .filter(|(_, p)| **p)
        .enumerate()
        .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        key_predicate(key_columns, assignments.len() + 1)
    )
}
