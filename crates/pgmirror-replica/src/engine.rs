//! The engine instance: owns the source, the local replica and the
//! replication session, and exposes table registration and queries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pgmirror_core::{DriftReason, RelationDescriptor, TableName, Value};
use pgmirror_pg::{PgError, Source, TableCatalog};
use pgmirror_store::{LocalColumn, LocalStore, QueryResult};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::applier::Replica;
use crate::error::{ReplicaError, ReplicaResult};
use crate::registry::RegistrationOptions;
use crate::session::Session;
use crate::snapshot::load_snapshot;

/// Attempts at registering a table whose schema changes while it loads.
const MAX_REGISTER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub slot_name: String,
    pub publication_name: String,
    /// Interval between standby status updates.
    pub status_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_name: "pgmirror_slot".to_string(),
            publication_name: "pgmirror_slot".to_string(),
            status_interval: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}

pub(crate) struct EngineInner<S> {
    pub source: S,
    pub config: EngineConfig,
    /// The single writer lock over the local store and registry.
    pub replica: Mutex<Replica>,
    /// Serializes registration, deregistration and resync.
    admin: Mutex<()>,
    started: AtomicBool,
}

/// A replication engine. Cheap to clone; clones share one instance.
pub struct Engine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Source> Engine<S> {
    pub fn new(source: S, store: LocalStore, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                source,
                config,
                replica: Mutex::new(Replica::new(store)),
                admin: Mutex::new(()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// Set up the publication and slot, start streaming and spawn the
    /// receive loop. One session per engine.
    pub async fn start(&self) -> ReplicaResult<SessionHandle> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ReplicaError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut session = Session::new(Arc::clone(&self.inner), shutdown_rx);
        if let Err(e) = session.establish().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let lsn = session.subscribe_lsn();
        let task = tokio::spawn(session.run());
        Ok(SessionHandle {
            shutdown: shutdown_tx,
            lsn,
            task: Some(task),
        })
    }

    /// Add a table to replication: publication membership, local schema
    /// and, when requested, an initial snapshot.
    pub async fn register_table(
        &self,
        name: &str,
        snapshot: bool,
        filter_query: Option<&str>,
    ) -> ReplicaResult<()> {
        let table = TableName::parse(name)?;
        let options = RegistrationOptions {
            snapshot,
            filter_query: filter_query
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from),
        };
        self.inner.register(&table, options).await
    }

    /// Remove a table from replication and drop its local copy.
    pub async fn deregister_table(&self, name: &str) -> ReplicaResult<()> {
        let table = TableName::parse(name)?;
        self.inner.deregister(&table).await
    }

    /// Source names of the registered tables.
    pub async fn registered_tables(&self) -> Vec<TableName> {
        self.inner.replica.lock().await.registry.names()
    }

    /// Run a read query against the local store.
    pub async fn query(&self, sql: &str, params: &[Value]) -> ReplicaResult<QueryResult> {
        Ok(self.inner.replica.lock().await.store.query(sql, params)?)
    }

    /// Select from a local table, by source name (`schema.table`) or local name.
    pub async fn query_table(
        &self,
        name: &str,
        where_clause: Option<&str>,
        params: &[Value],
    ) -> ReplicaResult<QueryResult> {
        let local = local_name(name)?;
        let replica = self.inner.replica.lock().await;
        Ok(replica.store.query_table(&local, where_clause, params)?)
    }

    /// Names of the tables in the local store.
    pub async fn tables(&self) -> ReplicaResult<Vec<String>> {
        Ok(self.inner.replica.lock().await.store.tables()?)
    }

    pub async fn table_info(&self, name: &str) -> ReplicaResult<Vec<LocalColumn>> {
        let local = local_name(name)?;
        Ok(self.inner.replica.lock().await.store.table_info(&local)?)
    }

    /// Drop the slot and publication, then close the store if no other
    /// handle to this engine remains. Shut the session down first.
    pub async fn close(self) -> ReplicaResult<()> {
        let config = &self.inner.config;
        info!(slot = %config.slot_name, publication = %config.publication_name, "Closing engine");

        let mut first_error: Option<ReplicaError> = None;
        match self.inner.source.drop_slot(&config.slot_name).await {
            Ok(()) | Err(PgError::SlotNotFound(_)) => {}
            Err(e) => {
                warn!(error = %e, "Failed to drop replication slot");
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.inner.source.drop_publication(&config.publication_name).await {
            warn!(error = %e, "Failed to drop publication");
            first_error.get_or_insert(e.into());
        }

        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.replica.into_inner().store.close()?,
            Err(_) => debug!("Engine still shared, local store stays open"),
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// `schema.table` maps to its local name; anything else is taken as a
/// local name already.
fn local_name(name: &str) -> ReplicaResult<String> {
    if name.contains('.') {
        Ok(TableName::parse(name)?.local_name())
    } else {
        Ok(name.to_string())
    }
}

impl<S: Source> EngineInner<S> {
    pub(crate) async fn register(
        &self,
        table: &TableName,
        options: RegistrationOptions,
    ) -> ReplicaResult<()> {
        let _admin = self.admin.lock().await;

        if let Some(existing) = self.replica.lock().await.registry.local_conflict(table) {
            return Err(ReplicaError::LocalNameTaken {
                table: table.to_string(),
                local: table.local_name(),
                existing: existing.to_string(),
            });
        }

        for attempt in 1..=MAX_REGISTER_ATTEMPTS {
            match self.register_once(table, &options).await? {
                None => {
                    info!(table = %table, snapshot = options.snapshot, "Registered table");
                    return Ok(());
                }
                Some(reason) => {
                    warn!(table = %table, reason = %reason, attempt, "Schema changed during registration");
                }
            }
        }

        self.cleanup(table, false).await;
        Err(ReplicaError::SchemaUnstable(table.to_string()))
    }

    async fn register_once(
        &self,
        table: &TableName,
        options: &RegistrationOptions,
    ) -> ReplicaResult<Option<DriftReason>> {
        let catalog = self
            .source
            .describe_table(table)
            .await
            .map_err(|e| match e {
                PgError::TableNotFound { .. } => ReplicaError::TableNotFound(table.to_string()),
                other => other.into(),
            })?;

        let publication = &self.config.publication_name;
        self.source.ensure_publication(publication).await?;

        let added = if self.source.publication_has_table(publication, table).await? {
            false
        } else {
            self.source.add_publication_table(publication, table).await?;
            true
        };

        match self.install(table, catalog, options).await {
            Ok(drift) => Ok(drift),
            Err(e) => {
                warn!(table = %table, error = %e, "Registration failed, cleaning up");
                self.cleanup(table, added).await;
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        table: &TableName,
        catalog: TableCatalog,
        options: &RegistrationOptions,
    ) -> ReplicaResult<Option<DriftReason>> {
        {
            let mut replica = self.replica.lock().await;
            let columns = catalog
                .columns
                .iter()
                .map(|c| replica.column(&c.name, c.type_oid, c.primary_key))
                .collect();
            let descriptor = RelationDescriptor::new(catalog.relation_id, table.clone(), columns)?;
            replica.install(descriptor, options.clone())?;
        }

        if options.snapshot {
            load_snapshot(
                &self.source,
                &self.replica,
                table,
                options.filter_query.as_deref(),
            )
            .await?;
        }

        Ok(self.replica.lock().await.finish_loading(table))
    }

    /// Undo a failed registration, best effort.
    async fn cleanup(&self, table: &TableName, remove_from_publication: bool) {
        if let Err(e) = self.replica.lock().await.remove(table) {
            warn!(table = %table, error = %e, "Failed to drop local table");
        }
        if remove_from_publication {
            if let Err(e) = self
                .source
                .drop_publication_table(&self.config.publication_name, table)
                .await
            {
                warn!(table = %table, error = %e, "Failed to remove table from publication");
            }
        }
    }

    /// Rebuild a drifted table from the live catalog with a fresh snapshot.
    /// Runs on its own task; the table's events stay queued until it is done.
    pub(crate) async fn resync(&self, table: &TableName) {
        let options = {
            let replica = self.replica.lock().await;
            match replica.registry.get(table) {
                Some(registered) => registered.options.clone(),
                None => return,
            }
        };

        let options = RegistrationOptions {
            snapshot: true,
            ..options
        };
        if let Err(e) = self.register(table, options).await {
            error!(table = %table, error = %e, "Resync failed, table is no longer replicated");
            let _admin = self.admin.lock().await;
            self.cleanup(table, true).await;
        }
    }

    async fn deregister(&self, table: &TableName) -> ReplicaResult<()> {
        let _admin = self.admin.lock().await;

        if !self.replica.lock().await.registry.contains(table) {
            return Err(ReplicaError::NotRegistered(table.to_string()));
        }

        let publication = &self.config.publication_name;
        if self.source.publication_has_table(publication, table).await? {
            self.source.drop_publication_table(publication, table).await?;
        }
        self.replica.lock().await.remove(table)?;

        info!(table = %table, "Deregistered table");
        Ok(())
    }
}

/// Handle to a running replication session.
#[derive(Debug)]
pub struct SessionHandle {
    shutdown: watch::Sender<bool>,
    lsn: watch::Receiver<u64>,
    task: Option<JoinHandle<ReplicaResult<()>>>,
}

impl SessionHandle {
    /// Position just past the last change read and applied.
    pub fn lsn(&self) -> u64 {
        *self.lsn.borrow()
    }

    pub fn subscribe_lsn(&self) -> watch::Receiver<u64> {
        self.lsn.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the receive loop to end and return its result. Returns
    /// `Ok(())` once the result has already been taken.
    pub async fn wait(&mut self) -> ReplicaResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.map_err(|e| ReplicaError::Task(e.to_string()))?
    }

    /// Signal the loop to stop and wait for it. An apply in flight finishes
    /// first.
    pub async fn shutdown(mut self) -> ReplicaResult<()> {
        self.shutdown.send_replace(true);
        self.wait().await
    }
}
