//! Applies decoded change messages to the local store.
//!
//! Everything here runs under the engine's single writer lock. Row-level
//! failures are logged and skipped so one bad row never stalls the stream.

use pgmirror_core::{ColumnDescriptor, DriftReason, RelationDescriptor, TableName, TypeRegistry, Value};
use pgmirror_pg::wire::pgoutput::{DeleteMessage, InsertMessage, TruncateMessage, UpdateMessage};
use pgmirror_pg::wire::{
    ColumnValue, PgOutputMessage, RawTuple, RelationMessage, ReplicaIdentity, TupleData,
};
use pgmirror_store::LocalStore;
use tracing::{debug, error, info, warn};

use crate::error::{ReplicaError, ReplicaResult};
use crate::registry::{RegisteredTable, RegistrationOptions, SchemaRegistry};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ApplyOutcome {
    Applied,
    /// Transaction markers, type announcements, unregistered relations.
    Ignored,
    /// The row failed to decode or apply.
    Skipped,
    /// Held back until the table's snapshot completes.
    Queued,
    /// A relation announcement no longer matches the registered schema.
    Drift { table: TableName, reason: DriftReason },
}

/// The local replica: store, registered tables and the type table.
pub(crate) struct Replica {
    pub store: LocalStore,
    pub registry: SchemaRegistry,
    pub types: TypeRegistry,
}

impl Replica {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            registry: SchemaRegistry::new(),
            types: TypeRegistry::new(),
        }
    }

    pub fn column(&self, name: &str, type_oid: u32, primary_key: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            type_oid,
            storage: self.types.storage_class(type_oid),
            primary_key,
        }
    }

    /// Create the local table for a new generation and register it. Any
    /// previous generation is dropped first; events it had queued move to
    /// the new one when that loads a snapshot.
    pub fn install(
        &mut self,
        descriptor: RelationDescriptor,
        options: RegistrationOptions,
    ) -> ReplicaResult<()> {
        let carried = match self.registry.remove(&descriptor.name) {
            Some(mut previous) => {
                self.store.drop_table(&previous.local)?;
                previous.finish_loading()
            }
            None => Vec::new(),
        };
        let local = self.store.create_table(&descriptor)?;
        info!(
            table = %descriptor.name,
            local = %local.name(),
            relation_id = descriptor.relation_id,
            columns = descriptor.columns.len(),
            "Installed table"
        );
        let mut table = RegisteredTable::new(descriptor, local, options);
        table.carry_over(carried);
        self.registry.insert(table);
        Ok(())
    }

    /// Unregister a table and drop its local copy.
    pub fn remove(&mut self, name: &TableName) -> ReplicaResult<bool> {
        match self.registry.remove(name) {
            Some(table) => {
                self.store.drop_table(&table.local)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Insert snapshot tuples (binary format) into a registered table.
    /// Returns the number of rows written.
    pub fn load_rows(&mut self, name: &TableName, tuples: Vec<RawTuple>) -> ReplicaResult<u64> {
        let table = self
            .registry
            .get(name)
            .ok_or_else(|| ReplicaError::NotRegistered(name.to_string()))?;

        let mut loaded = 0;
        for tuple in tuples {
            let result = decode_snapshot_row(&self.types, &table.descriptor, tuple)
                .and_then(|values| Ok(self.store.insert(&table.local, &values)?));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => warn!(table = %name, error = %e, "Skipping snapshot row"),
            }
        }
        Ok(loaded)
    }

    /// End a table's loading phase and apply the events queued meanwhile.
    /// Stops at the first drift and queues the rest again for the next
    /// generation.
    pub fn finish_loading(&mut self, name: &TableName) -> Option<DriftReason> {
        let queued = self
            .registry
            .get_mut(name)
            .map(RegisteredTable::finish_loading)
            .unwrap_or_default();

        if !queued.is_empty() {
            debug!(table = %name, events = queued.len(), "Replaying queued events");
        }
        let mut queued = queued.into_iter();
        while let Some(msg) = queued.next() {
            if let ApplyOutcome::Drift { reason, .. } = self.apply(msg) {
                if let Some(table) = self.registry.get_mut(name) {
                    table.carry_over(queued.collect());
                }
                return Some(reason);
            }
        }
        None
    }

    /// Apply one decoded message.
    pub fn apply(&mut self, msg: PgOutputMessage) -> ApplyOutcome {
        let Some(msg) = self.defer_if_loading(msg) else {
            return ApplyOutcome::Queued;
        };

        let outcome = match msg {
            PgOutputMessage::Relation(rel) => self.apply_relation(&rel),
            PgOutputMessage::Insert(m) => self.apply_insert(m),
            PgOutputMessage::Update(m) => self.apply_update(m),
            PgOutputMessage::Delete(m) => self.apply_delete(m),
            PgOutputMessage::Truncate(m) => self.apply_truncate(m),
            other => {
                debug!(kind = other.kind(), "Ignoring message");
                ApplyOutcome::Ignored
            }
        };

        // A drifted table holds its events until it is rebuilt.
        if let ApplyOutcome::Drift { table, .. } = &outcome {
            if let Some(registered) = self.registry.get_mut(table) {
                registered.start_loading();
            }
        }
        outcome
    }

    fn defer_if_loading(&mut self, msg: PgOutputMessage) -> Option<PgOutputMessage> {
        let msg = match msg {
            PgOutputMessage::Truncate(truncate) => return self.defer_truncate(truncate),
            other => other,
        };
        let target = match &msg {
            PgOutputMessage::Relation(rel) => self.relation_target(rel),
            other => other
                .relation_id()
                .and_then(|id| self.registry.name_of(id))
                .cloned(),
        };

        match target.and_then(|name| self.registry.get_mut(&name)) {
            Some(table) => table.defer(msg),
            None => Some(msg),
        }
    }

    /// Queue the part of a truncate that targets loading tables; return the rest.
    fn defer_truncate(&mut self, truncate: TruncateMessage) -> Option<PgOutputMessage> {
        let mut remaining = Vec::new();
        let mut queued = false;

        for id in truncate.relation_ids {
            match self.registry.get_by_id_mut(id) {
                Some(table) if table.is_loading() => {
                    table.defer(PgOutputMessage::Truncate(TruncateMessage {
                        options: truncate.options,
                        relation_ids: vec![id],
                    }));
                    queued = true;
                }
                _ => remaining.push(id),
            }
        }

        if queued && remaining.is_empty() {
            return None;
        }
        Some(PgOutputMessage::Truncate(TruncateMessage {
            options: truncate.options,
            relation_ids: remaining,
        }))
    }

    /// The registered table a relation announcement refers to: by id, or by
    /// name when the source assigned a new id.
    fn relation_target(&self, rel: &RelationMessage) -> Option<TableName> {
        if let Some(name) = self.registry.name_of(rel.relation_id) {
            return Some(name.clone());
        }
        let name = rel.table_name();
        self.registry.contains(&name).then_some(name)
    }

    fn apply_relation(&self, rel: &RelationMessage) -> ApplyOutcome {
        let Some(target) = self.relation_target(rel) else {
            debug!(relation_id = rel.relation_id, table = %rel.table_name(), "Relation is not registered");
            return ApplyOutcome::Ignored;
        };
        let Some(table) = self.registry.get(&target) else {
            return ApplyOutcome::Ignored;
        };

        let columns: Vec<ColumnDescriptor> = rel
            .columns
            .iter()
            .map(|c| self.column(&c.name, c.type_oid, c.is_key()))
            .collect();
        let compare_keys = rel.replica_identity == ReplicaIdentity::Default;

        match table
            .descriptor
            .detect_drift(rel.relation_id, &rel.table_name(), &columns, compare_keys)
        {
            Some(reason) => {
                warn!(table = %target, reason = %reason, "Schema drift detected");
                ApplyOutcome::Drift {
                    table: target,
                    reason,
                }
            }
            None => {
                debug!(table = %target, relation_id = rel.relation_id, "Relation matches registered schema");
                ApplyOutcome::Ignored
            }
        }
    }

    fn apply_insert(&self, m: InsertMessage) -> ApplyOutcome {
        let Some(table) = self.registry.get_by_id(m.relation_id) else {
            return unregistered("insert", m.relation_id);
        };
        let result = decode_row(&self.types, &table.descriptor, &m.tuple)
            .and_then(|values| Ok(self.store.insert(&table.local, &values)?));
        outcome("insert", &table.descriptor.name, result)
    }

    fn apply_update(&self, m: UpdateMessage) -> ApplyOutcome {
        let Some(table) = self.registry.get_by_id(m.relation_id) else {
            return unregistered("update", m.relation_id);
        };
        let descriptor = &table.descriptor;

        let result = decode_update(&self.types, descriptor, &m.new_tuple).and_then(|values| {
            let key = match &m.old_tuple {
                Some(old) => decode_key(&self.types, descriptor, old)?,
                None => key_from_values(descriptor, &values)?,
            };
            Ok(self.store.update(&table.local, &values, &key)?)
        });
        if let Ok(0) = result {
            debug!(table = %descriptor.name, "Update matched no local row");
        }
        outcome("update", &descriptor.name, result)
    }

    fn apply_delete(&self, m: DeleteMessage) -> ApplyOutcome {
        let Some(table) = self.registry.get_by_id(m.relation_id) else {
            return unregistered("delete", m.relation_id);
        };
        let result = decode_key(&self.types, &table.descriptor, &m.old_tuple)
            .and_then(|key| Ok(self.store.delete(&table.local, &key)?));
        outcome("delete", &table.descriptor.name, result)
    }

    fn apply_truncate(&self, m: TruncateMessage) -> ApplyOutcome {
        let mut applied = false;
        for id in m.relation_ids {
            let Some(table) = self.registry.get_by_id(id) else {
                warn!(relation_id = id, "Truncate for unregistered relation, dropping");
                continue;
            };
            match self.store.truncate(&table.local) {
                Ok(rows) => {
                    info!(table = %table.descriptor.name, rows, "Truncated table");
                    applied = true;
                }
                Err(e) => error!(table = %table.descriptor.name, error = %e, "Truncate failed"),
            }
        }
        if applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Skipped
        }
    }
}

fn unregistered(op: &'static str, relation_id: u32) -> ApplyOutcome {
    warn!(op, relation_id, "Change for unregistered relation, dropping");
    ApplyOutcome::Ignored
}

fn outcome(op: &'static str, table: &TableName, result: ReplicaResult<usize>) -> ApplyOutcome {
    match result {
        Ok(rows) => {
            debug!(op, table = %table, rows, "Applied change");
            ApplyOutcome::Applied
        }
        Err(e) => {
            warn!(op, table = %table, error = %e, "Skipping change");
            ApplyOutcome::Skipped
        }
    }
}

fn check_shape(descriptor: &RelationDescriptor, actual: usize) -> ReplicaResult<()> {
    if actual != descriptor.columns.len() {
        return Err(ReplicaError::RowShape {
            table: descriptor.name.to_string(),
            expected: descriptor.columns.len(),
            actual,
        });
    }
    Ok(())
}

/// Decode one streamed column. `None` means unchanged (not resent).
fn decode_column(
    types: &TypeRegistry,
    column: &ColumnDescriptor,
    value: &ColumnValue,
) -> ReplicaResult<Option<Value>> {
    Ok(match value {
        ColumnValue::Null => Some(Value::Null),
        ColumnValue::Unchanged => None,
        ColumnValue::Text(text) => Some(types.decode_text(column.type_oid, text)?),
        ColumnValue::Binary(bytes) => Some(types.decode_binary(column.type_oid, bytes)?),
    })
}

/// A full row for insert. Unchanged columns are stored as NULL.
fn decode_row(
    types: &TypeRegistry,
    descriptor: &RelationDescriptor,
    tuple: &TupleData,
) -> ReplicaResult<Vec<Value>> {
    Ok(decode_update(types, descriptor, tuple)?
        .into_iter()
        .map(|v| v.unwrap_or(Value::Null))
        .collect())
}

/// New values for update; unchanged columns stay `None` and are left untouched.
fn decode_update(
    types: &TypeRegistry,
    descriptor: &RelationDescriptor,
    tuple: &TupleData,
) -> ReplicaResult<Vec<Option<Value>>> {
    check_shape(descriptor, tuple.columns.len())?;
    descriptor
        .columns
        .iter()
        .zip(&tuple.columns)
        .map(|(column, value)| decode_column(types, column, value))
        .collect()
}

/// Primary-key values from a key or old tuple.
fn decode_key(
    types: &TypeRegistry,
    descriptor: &RelationDescriptor,
    tuple: &TupleData,
) -> ReplicaResult<Vec<Value>> {
    check_shape(descriptor, tuple.columns.len())?;
    descriptor
        .key_indices()
        .iter()
        .map(|&i| {
            let column = &descriptor.columns[i];
            match decode_column(types, column, &tuple.columns[i])? {
                Some(value) if !value.is_null() => Ok(value),
                _ => Err(missing_key(descriptor, column)),
            }
        })
        .collect()
}

/// Primary-key values taken from the new row when the key did not change.
fn key_from_values(
    descriptor: &RelationDescriptor,
    values: &[Option<Value>],
) -> ReplicaResult<Vec<Value>> {
    descriptor
        .key_indices()
        .iter()
        .map(|&i| match &values[i] {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ => Err(missing_key(descriptor, &descriptor.columns[i])),
        })
        .collect()
}

fn missing_key(descriptor: &RelationDescriptor, column: &ColumnDescriptor) -> ReplicaError {
    ReplicaError::MissingKey {
        table: descriptor.name.to_string(),
        column: column.name.clone(),
    }
}

/// A snapshot tuple, decoded from the binary format.
fn decode_snapshot_row(
    types: &TypeRegistry,
    descriptor: &RelationDescriptor,
    tuple: RawTuple,
) -> ReplicaResult<Vec<Value>> {
    check_shape(descriptor, tuple.len())?;
    descriptor
        .columns
        .iter()
        .zip(tuple)
        .map(|(column, field)| match field {
            None => Ok(Value::Null),
            Some(bytes) => Ok(types.decode_binary(column.type_oid, &bytes)?),
        })
        .collect()
}
