//! Registered tables, keyed by source relation id and by name.

use std::collections::HashMap;

use pgmirror_core::{RelationDescriptor, TableName};
use pgmirror_pg::wire::PgOutputMessage;
use pgmirror_store::LocalTable;

/// How a table was registered; reused when drift forces a resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    pub snapshot: bool,
    pub filter_query: Option<String>,
}

/// One generation of a registered table.
#[derive(Debug)]
pub(crate) struct RegisteredTable {
    pub descriptor: RelationDescriptor,
    pub local: LocalTable,
    pub options: RegistrationOptions,
    /// Events held back while a snapshot is loading, in arrival order.
    pending: Option<Vec<PgOutputMessage>>,
}

impl RegisteredTable {
    pub fn new(descriptor: RelationDescriptor, local: LocalTable, options: RegistrationOptions) -> Self {
        let pending = options.snapshot.then(Vec::new);
        Self {
            descriptor,
            local,
            options,
            pending,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Queue an event if a snapshot is loading. Returns the event back when
    /// it should be applied right away.
    pub fn defer(&mut self, msg: PgOutputMessage) -> Option<PgOutputMessage> {
        match &mut self.pending {
            Some(queue) => {
                queue.push(msg);
                None
            }
            None => Some(msg),
        }
    }

    /// Start queueing events, keeping anything already queued.
    pub fn start_loading(&mut self) {
        self.pending.get_or_insert_with(Vec::new);
    }

    /// Put events ahead of anything queued since. Dropped unless this
    /// generation is loading.
    pub fn carry_over(&mut self, mut earlier: Vec<PgOutputMessage>) {
        if let Some(queue) = &mut self.pending {
            earlier.append(queue);
            *queue = earlier;
        }
    }

    /// End the loading phase and hand back whatever was queued.
    pub fn finish_loading(&mut self) -> Vec<PgOutputMessage> {
        self.pending.take().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SchemaRegistry {
    ids: HashMap<u32, TableName>,
    tables: HashMap<TableName, RegisteredTable>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a table, replacing and returning any previous generation.
    pub fn insert(&mut self, table: RegisteredTable) -> Option<RegisteredTable> {
        let name = table.descriptor.name.clone();
        let previous = self.remove(&name);
        self.ids.insert(table.descriptor.relation_id, name.clone());
        self.tables.insert(name, table);
        previous
    }

    pub fn remove(&mut self, name: &TableName) -> Option<RegisteredTable> {
        let table = self.tables.remove(name)?;
        if self.ids.get(&table.descriptor.relation_id) == Some(name) {
            self.ids.remove(&table.descriptor.relation_id);
        }
        Some(table)
    }

    pub fn get(&self, name: &TableName) -> Option<&RegisteredTable> {
        self.tables.get(name)
    }

    pub fn get_mut(&mut self, name: &TableName) -> Option<&mut RegisteredTable> {
        self.tables.get_mut(name)
    }

    pub fn name_of(&self, relation_id: u32) -> Option<&TableName> {
        self.ids.get(&relation_id)
    }

    pub fn get_by_id(&self, relation_id: u32) -> Option<&RegisteredTable> {
        self.ids.get(&relation_id).and_then(|name| self.tables.get(name))
    }

    pub fn get_by_id_mut(&mut self, relation_id: u32) -> Option<&mut RegisteredTable> {
        let name = self.ids.get(&relation_id)?;
        self.tables.get_mut(name)
    }

    pub fn contains(&self, name: &TableName) -> bool {
        self.tables.contains_key(name)
    }

    /// The registered table, other than `name`, that mirrors into the same
    /// local table.
    pub fn local_conflict(&self, name: &TableName) -> Option<&TableName> {
        let local = name.local_name();
        self.tables
            .iter()
            .find(|(other, table)| *other != name && table.local.name() == local)
            .map(|(other, _)| other)
    }

    pub fn names(&self) -> Vec<TableName> {
        let mut names: Vec<TableName> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgmirror_core::{ColumnDescriptor, StorageClass};
    use pgmirror_pg::wire::pgoutput::{BeginMessage, TruncateMessage};

    fn registered(relation_id: u32, table: &str, snapshot: bool) -> RegisteredTable {
        registered_as(relation_id, TableName::new("public", table), snapshot)
    }

    fn registered_as(relation_id: u32, name: TableName, snapshot: bool) -> RegisteredTable {
        let descriptor = RelationDescriptor::new(
            relation_id,
            name,
            vec![ColumnDescriptor {
                name: "id".into(),
                type_oid: 23,
                storage: StorageClass::Integer,
                primary_key: true,
            }],
        )
        .unwrap();
        let local = LocalTable::new(&descriptor);
        RegisteredTable::new(
            descriptor,
            local,
            RegistrationOptions {
                snapshot,
                filter_query: None,
            },
        )
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.insert(registered(16384, "users", false)).is_none());

        let name = TableName::new("public", "users");
        assert_eq!(registry.name_of(16384), Some(&name));
        assert!(registry.get_by_id(16384).is_some());
        assert!(registry.get(&name).is_some());
        assert!(registry.get_by_id(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replacing_generation_rebinds_relation_id() {
        let mut registry = SchemaRegistry::new();
        registry.insert(registered(16384, "users", false));

        let previous = registry.insert(registered(16500, "users", false));
        assert_eq!(previous.map(|t| t.descriptor.relation_id), Some(16384));
        assert!(registry.get_by_id(16384).is_none());
        assert!(registry.get_by_id(16500).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut registry = SchemaRegistry::new();
        registry.insert(registered(16384, "users", false));
        registry.insert(registered(16385, "orders", false));

        let removed = registry.remove(&TableName::new("public", "users"));
        assert!(removed.is_some());
        assert!(registry.name_of(16384).is_none());
        assert_eq!(registry.names(), vec![TableName::new("public", "orders")]);
        assert!(registry.remove(&TableName::new("public", "users")).is_none());
    }

    #[test]
    fn test_local_name_conflict() {
        let mut registry = SchemaRegistry::new();
        registry.insert(registered_as(16384, TableName::new("a", "b_c"), false));
        registry.insert(registered(16385, "users", false));

        let taken = TableName::new("a_b", "c");
        assert_eq!(taken.local_name(), "a_b_c");
        assert_eq!(registry.local_conflict(&taken), Some(&TableName::new("a", "b_c")));

        assert_eq!(registry.local_conflict(&TableName::new("a", "b_c")), None);
        assert_eq!(registry.local_conflict(&TableName::new("public", "orders")), None);
    }

    #[test]
    fn test_pending_queue_only_while_loading() {
        let mut loading = registered(16384, "users", true);
        assert!(loading.is_loading());

        let msg = PgOutputMessage::Truncate(TruncateMessage {
            options: 0,
            relation_ids: vec![16384],
        });
        assert!(loading.defer(msg.clone()).is_none());
        assert_eq!(loading.finish_loading(), vec![msg]);
        assert!(!loading.is_loading());

        let begin = PgOutputMessage::Begin(BeginMessage {
            final_lsn: 1,
            timestamp: 0,
            xid: 7,
        });
        assert_eq!(loading.defer(begin.clone()), Some(begin));
    }

    #[test]
    fn test_carried_events_go_first() {
        let truncate = |id| {
            PgOutputMessage::Truncate(TruncateMessage {
                options: 0,
                relation_ids: vec![id],
            })
        };

        let mut table = registered(16384, "users", true);
        table.defer(truncate(2));
        table.carry_over(vec![truncate(1)]);
        assert_eq!(table.finish_loading(), vec![truncate(1), truncate(2)]);

        table.carry_over(vec![truncate(3)]);
        assert!(!table.is_loading());

        table.start_loading();
        table.defer(truncate(4));
        table.start_loading();
        assert_eq!(table.finish_loading(), vec![truncate(4)]);
    }
}
