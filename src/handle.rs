//! Checkout handles

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::bag::BagEntry;
use crate::config::PoolConfiguration;
use crate::entry::PoolEntry;
use crate::errors::{PoolError, PoolResult, ResourceError};
use crate::factory::{IsolationLevel, ResourceFactory, SessionProperty};
use crate::leak::LeakTask;
use crate::pool::PoolInner;

bitflags! {
    /// Session properties changed through a handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyBits: u8 {
        const READ_ONLY = 0b0000_0001;
        const AUTO_COMMIT = 0b0000_0010;
        const ISOLATION = 0b0000_0100;
        const CATALOG = 0b0000_1000;
        const NETWORK_TIMEOUT = 0b0001_0000;
        const SCHEMA = 0b0010_0000;
    }
}

/// Session property values as seen by one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionState {
    read_only: bool,
    auto_commit: bool,
    isolation: Option<IsolationLevel>,
    catalog: Option<String>,
    schema: Option<String>,
    network_timeout: Option<Duration>,
}

impl SessionState {
    pub fn from_config(config: &PoolConfiguration, network_timeout: Option<Duration>) -> Self {
        Self {
            read_only: config.read_only,
            auto_commit: config.auto_commit,
            isolation: config.transaction_isolation,
            catalog: config.catalog.clone(),
            schema: config.schema.clone(),
            network_timeout,
        }
    }

    /// The properties selected by `bits`, carrying this state's values.
    pub fn properties(&self, bits: DirtyBits) -> Vec<SessionProperty> {
        let mut properties = Vec::new();
        if bits.contains(DirtyBits::READ_ONLY) {
            properties.push(SessionProperty::ReadOnly(self.read_only));
        }
        if bits.contains(DirtyBits::AUTO_COMMIT) {
            properties.push(SessionProperty::AutoCommit(self.auto_commit));
        }
        if bits.contains(DirtyBits::ISOLATION) {
            properties.push(SessionProperty::Isolation(self.isolation));
        }
        if bits.contains(DirtyBits::CATALOG) {
            properties.push(SessionProperty::Catalog(self.catalog.clone()));
        }
        if bits.contains(DirtyBits::NETWORK_TIMEOUT)
            && let Some(timeout) = self.network_timeout
        {
            properties.push(SessionProperty::NetworkTimeout(timeout));
        }
        if bits.contains(DirtyBits::SCHEMA) {
            properties.push(SessionProperty::Schema(self.schema.clone()));
        }
        properties
    }

    fn apply(&mut self, property: &SessionProperty) -> DirtyBits {
        match property {
            SessionProperty::ReadOnly(value) => {
                self.read_only = *value;
                DirtyBits::READ_ONLY
            }
            SessionProperty::AutoCommit(value) => {
                self.auto_commit = *value;
                DirtyBits::AUTO_COMMIT
            }
            SessionProperty::Isolation(level) => {
                self.isolation = *level;
                DirtyBits::ISOLATION
            }
            SessionProperty::Catalog(catalog) => {
                self.catalog = catalog.clone();
                DirtyBits::CATALOG
            }
            SessionProperty::Schema(schema) => {
                self.schema = schema.clone();
                DirtyBits::SCHEMA
            }
            SessionProperty::NetworkTimeout(timeout) => {
                self.network_timeout = Some(*timeout);
                DirtyBits::NETWORK_TIMEOUT
            }
        }
    }
}

type Cleanup<R> = Box<dyn FnOnce(&mut R) -> Result<(), ResourceError> + Send>;

/// Exclusive checkout of one pooled resource.
///
/// Dropping the handle returns the resource to the pool. [`close`] does the
/// same explicitly and reports errors raised while resetting the session;
/// closing twice is a no-op.
///
/// Session properties changed through the handle are put back to the pool
/// defaults on close, and only those.
///
/// [`close`]: PooledResource::close
pub struct PooledResource<F: ResourceFactory> {
    pool: Arc<PoolInner<F>>,
    entry: Arc<PoolEntry<F::Resource>>,
    resource: Option<F::Resource>,
    leak: Option<LeakTask>,
    session: SessionState,
    dirty: DirtyBits,
    commit_dirty: bool,
    cleanups: Vec<Cleanup<F::Resource>>,
}

impl<F: ResourceFactory> PooledResource<F> {
    pub(crate) fn new(
        pool: Arc<PoolInner<F>>,
        entry: Arc<PoolEntry<F::Resource>>,
        resource: F::Resource,
        leak: Option<LeakTask>,
    ) -> Self {
        let session = pool.session_defaults();
        Self {
            pool,
            entry,
            resource: Some(resource),
            leak,
            session,
            dirty: DirtyBits::empty(),
            commit_dirty: false,
            cleanups: Vec::new(),
        }
    }

    /// Identifier of the underlying pool entry
    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    pub fn is_closed(&self) -> bool {
        self.resource.is_none()
    }

    pub fn resource(&self) -> PoolResult<&F::Resource> {
        self.resource.as_ref().ok_or(PoolError::HandleClosed)
    }

    pub fn resource_mut(&mut self) -> PoolResult<&mut F::Resource> {
        self.resource.as_mut().ok_or(PoolError::HandleClosed)
    }

    /// Change a session property and remember to reset it on close.
    pub fn set_property(&mut self, property: SessionProperty) -> PoolResult<()> {
        let resource = self.resource.as_mut().ok_or(PoolError::HandleClosed)?;
        if let Err(err) = self.pool.factory.set_session_property(resource, &property) {
            return Err(self.failed(err));
        }

        if matches!(property, SessionProperty::AutoCommit(_)) {
            self.commit_dirty = false;
        }
        self.dirty |= self.session.apply(&property);
        Ok(())
    }

    pub fn set_read_only(&mut self, read_only: bool) -> PoolResult<()> {
        self.set_property(SessionProperty::ReadOnly(read_only))
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) -> PoolResult<()> {
        self.set_property(SessionProperty::AutoCommit(auto_commit))
    }

    pub fn set_transaction_isolation(&mut self, level: Option<IsolationLevel>) -> PoolResult<()> {
        self.set_property(SessionProperty::Isolation(level))
    }

    pub fn set_catalog(&mut self, catalog: Option<String>) -> PoolResult<()> {
        self.set_property(SessionProperty::Catalog(catalog))
    }

    pub fn set_schema(&mut self, schema: Option<String>) -> PoolResult<()> {
        self.set_property(SessionProperty::Schema(schema))
    }

    pub fn set_network_timeout(&mut self, timeout: Duration) -> PoolResult<()> {
        self.set_property(SessionProperty::NetworkTimeout(timeout))
    }

    pub fn is_read_only(&self) -> bool {
        self.session.read_only
    }

    pub fn auto_commit(&self) -> bool {
        self.session.auto_commit
    }

    pub fn transaction_isolation(&self) -> Option<IsolationLevel> {
        self.session.isolation
    }

    pub fn catalog(&self) -> Option<&str> {
        self.session.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.session.schema.as_deref()
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.session.network_timeout
    }

    /// Properties that will be reset on close
    pub fn dirty_bits(&self) -> DirtyBits {
        self.dirty
    }

    /// Run an operation that may change transactional state. With
    /// auto-commit off, the handle rolls back on close unless the caller
    /// commits or rolls back first.
    pub fn execute<T>(
        &mut self,
        operation: impl FnOnce(&mut F::Resource) -> Result<T, ResourceError>,
    ) -> PoolResult<T> {
        let resource = self.resource.as_mut().ok_or(PoolError::HandleClosed)?;
        if !self.session.auto_commit {
            self.commit_dirty = true;
        }
        operation(resource).map_err(|err| self.failed(err))
    }

    pub fn commit(&mut self) -> PoolResult<()> {
        let resource = self.resource.as_mut().ok_or(PoolError::HandleClosed)?;
        self.pool.factory.commit(resource).map_err(|err| self.failed(err))?;
        self.commit_dirty = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> PoolResult<()> {
        let resource = self.resource.as_mut().ok_or(PoolError::HandleClosed)?;
        self.pool.factory.rollback(resource).map_err(|err| self.failed(err))?;
        self.commit_dirty = false;
        Ok(())
    }

    /// Register a cleanup for something opened through this checkout, such
    /// as a statement or cursor. Cleanups run on close, newest first.
    pub fn on_close<C>(&mut self, cleanup: C)
    where
        C: FnOnce(&mut F::Resource) -> Result<(), ResourceError> + Send + 'static,
    {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Return the resource to the pool.
    pub fn close(&mut self) -> PoolResult<()> {
        let Some(mut resource) = self.resource.take() else {
            return Ok(());
        };

        let mut failure: Option<ResourceError> = None;
        while let Some(cleanup) = self.cleanups.pop() {
            if let Err(err) = cleanup(&mut resource) {
                failure.get_or_insert(err);
            }
        }

        if self.commit_dirty && !self.session.auto_commit {
            tracing::debug!(pool = %self.pool.name(), entry = %self.entry,
                "rolling back uncommitted work on close");
            if let Err(err) = self.pool.factory.rollback(&mut resource) {
                failure.get_or_insert(err);
            }
        }

        if !self.dirty.is_empty()
            && let Err(err) = self.pool.reset_session(&mut resource, self.dirty)
        {
            failure.get_or_insert(err);
        }

        if let Some(leak) = self.leak.take() {
            leak.cancel();
        }

        if let Some(err) = &failure
            && self.pool.factory.is_fatal(err)
        {
            self.entry.mark_evicted();
        }

        self.entry.restore_resource(resource);
        self.pool.recycle(&self.entry);

        match failure {
            Some(err) if !self.entry.is_evicted() => Err(PoolError::resource(err)),
            _ => Ok(()),
        }
    }

    /// Close the handle and discard the resource instead of reusing it.
    pub fn evict(mut self) -> PoolResult<()> {
        self.entry.mark_evicted();
        self.close()
    }

    fn failed(&self, err: ResourceError) -> PoolError {
        if self.pool.factory.is_fatal(&err) {
            tracing::warn!(pool = %self.pool.name(), entry = %self.entry, error = %err,
                "fatal resource error, evicting");
            self.entry.mark_evicted();
        }
        PoolError::resource(err)
    }
}

impl<F: ResourceFactory> Deref for PooledResource<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("handle used after close")
    }
}

impl<F: ResourceFactory> DerefMut for PooledResource<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("handle used after close")
    }
}

impl<F: ResourceFactory> Drop for PooledResource<F> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(pool = %self.pool.name(), entry = %self.entry, error = %err,
                "error while returning resource to the pool");
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for PooledResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("entry", &self.entry)
            .field("closed", &self.is_closed())
            .field("held_for", &self.entry.borrowed_for(Instant::now()))
            .field("dirty", &self.dirty)
            .field("commit_dirty", &self.commit_dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SessionState {
        let config = PoolConfiguration::new().with_catalog("main");
        SessionState::from_config(&config, Some(Duration::from_secs(3)))
    }

    #[test]
    fn no_bits_means_no_properties() {
        assert!(defaults().properties(DirtyBits::empty()).is_empty());
    }

    #[test]
    fn properties_carry_current_values() {
        let state = defaults();
        assert_eq!(
            state.properties(DirtyBits::CATALOG | DirtyBits::NETWORK_TIMEOUT),
            vec![
                SessionProperty::Catalog(Some("main".to_string())),
                SessionProperty::NetworkTimeout(Duration::from_secs(3)),
            ]
        );
    }

    #[test]
    fn unsupported_network_timeout_is_skipped() {
        let state = SessionState::from_config(&PoolConfiguration::new(), None);
        assert!(state.properties(DirtyBits::NETWORK_TIMEOUT).is_empty());
    }

    #[test]
    fn apply_reports_the_touched_bit() {
        let mut state = defaults();
        assert_eq!(state.apply(&SessionProperty::ReadOnly(true)), DirtyBits::READ_ONLY);
        assert_eq!(state.apply(&SessionProperty::Schema(None)), DirtyBits::SCHEMA);
        assert!(state.read_only);
        assert_eq!(state.schema, None);
    }
}
