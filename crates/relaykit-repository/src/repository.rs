//! Typed repositories.
//!
//! Reads go straight to the entity store; writes are version-checked against
//! the current state (staged or stored) and staged into the caller's unit of
//! work. Both pass through the repository's interceptor chain.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use relaykit_core::error::DomainError;
use relaykit_core::repository::{EntityRecord, EntityStore, EntityWrite, Query};
use relaykit_uow::UnitOfWork;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::chain::{InterceptorChain, Terminal};
use crate::interceptors::DELETED_AT_FIELD;
use crate::operation::{
    DeleteMode, Operation, OperationContext, OperationOutcome, RecordDelete, RecordUpdate,
};

/// A persistable entity.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    /// Type name used for storage and cache keys.
    const ENTITY_TYPE: &'static str;

    /// Entity identifier.
    fn id(&self) -> String;

    /// Version the entity was loaded at; 0 for an entity never persisted.
    fn version(&self) -> i64;

    /// Sets the version after a load or a write.
    fn set_version(&mut self, version: i64);
}

fn to_record<E: Entity>(entity: &E) -> Result<EntityRecord, DomainError> {
    Ok(EntityRecord {
        entity_type: E::ENTITY_TYPE.to_owned(),
        id: entity.id(),
        version: entity.version(),
        data: serde_json::to_value(entity)?,
    })
}

fn from_record<E: Entity>(record: EntityRecord) -> Result<E, DomainError> {
    let mut entity: E = serde_json::from_value(record.data)?;
    entity.set_version(record.version);
    Ok(entity)
}

fn conflict(id: &str, expected: i64, actual: i64) -> DomainError {
    DomainError::ConcurrencyConflict {
        aggregate_id: id.to_owned(),
        expected,
        actual,
    }
}

/// The end of a repository chain: the entity store for reads, the unit of
/// work for writes.
pub struct StoreTerminal<'a> {
    store: &'a dyn EntityStore,
    uow: Option<&'a mut UnitOfWork>,
}

impl<'a> StoreTerminal<'a> {
    /// A terminal that can only read.
    #[must_use]
    pub fn reader(store: &'a dyn EntityStore) -> Self {
        Self { store, uow: None }
    }

    /// A terminal that reads from `store` and stages writes into `uow`.
    #[must_use]
    pub fn writer(store: &'a dyn EntityStore, uow: &'a mut UnitOfWork) -> Self {
        Self {
            store,
            uow: Some(uow),
        }
    }

    /// Current state of an entity as this unit of work sees it: the last
    /// staged write if any, otherwise the stored record.
    async fn current(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>, DomainError> {
        if let Some(write) = self
            .uow
            .as_deref()
            .and_then(|uow| uow.staged_for(entity_type, id))
        {
            return Ok(match write {
                EntityWrite::Insert(record) | EntityWrite::Update { record, .. } => {
                    Some(record.clone())
                }
                EntityWrite::Delete { .. } => None,
            });
        }
        self.store.load(entity_type, id).await
    }

    fn stage(&mut self, write: EntityWrite) -> Result<(), DomainError> {
        match self.uow.as_deref_mut() {
            Some(uow) => uow.stage(write),
            None => Err(DomainError::Validation(
                "writes require a unit of work".into(),
            )),
        }
    }

    async fn create(&mut self, record: &EntityRecord) -> Result<EntityRecord, DomainError> {
        if let Some(existing) = self.current(&record.entity_type, &record.id).await? {
            return Err(conflict(&record.id, 0, existing.version));
        }
        self.stage(EntityWrite::Insert(record.clone()))?;
        Ok(record.clone())
    }

    async fn update(&mut self, update: &RecordUpdate) -> Result<EntityRecord, DomainError> {
        let record = &update.record;
        let Some(current) = self.current(&record.entity_type, &record.id).await? else {
            return Err(DomainError::NotFound {
                entity_type: record.entity_type.clone(),
                id: record.id.clone(),
            });
        };
        if current.version != update.expected_version {
            return Err(conflict(&record.id, update.expected_version, current.version));
        }
        self.stage(EntityWrite::Update {
            record: record.clone(),
            expected_version: update.expected_version,
        })?;
        Ok(record.clone())
    }

    async fn delete(
        &mut self,
        entity_type: &str,
        delete: &RecordDelete,
    ) -> Result<Option<EntityRecord>, DomainError> {
        let Some(current) = self.current(entity_type, &delete.id).await? else {
            return Err(DomainError::NotFound {
                entity_type: entity_type.to_owned(),
                id: delete.id.clone(),
            });
        };
        if let Some(expected) = delete.expected_version {
            if current.version != expected {
                return Err(conflict(&delete.id, expected, current.version));
            }
        }
        match delete.mode {
            DeleteMode::Hard => {
                self.stage(EntityWrite::Delete {
                    entity_type: entity_type.to_owned(),
                    id: delete.id.clone(),
                    expected_version: Some(current.version),
                })?;
                Ok(None)
            }
            DeleteMode::Soft { deleted_at } => {
                let mut marked = current.clone();
                if let Some(object) = marked.data.as_object_mut() {
                    object.insert(DELETED_AT_FIELD.to_owned(), serde_json::to_value(deleted_at)?);
                }
                marked.version = current.version + 1;
                self.stage(EntityWrite::Update {
                    record: marked.clone(),
                    expected_version: current.version,
                })?;
                Ok(Some(marked))
            }
        }
    }

    async fn delete_all(
        &mut self,
        entity_type: &str,
        deletes: &[RecordDelete],
    ) -> Result<OperationOutcome, DomainError> {
        let mut written = Vec::new();
        let mut removed = Vec::new();
        for delete in deletes {
            match self.delete(entity_type, delete).await? {
                Some(record) => written.push(record),
                None => removed.push(delete.id.clone()),
            }
        }
        // A batch is either all soft or all hard once interceptors ran.
        if written.is_empty() {
            Ok(OperationOutcome::Removed(removed))
        } else {
            Ok(OperationOutcome::Written(written))
        }
    }
}

#[async_trait]
impl<'a> Terminal for StoreTerminal<'a> {
    async fn execute(&mut self, ctx: &OperationContext) -> Result<OperationOutcome, DomainError> {
        let entity_type = ctx.entity_type.as_str();
        match &ctx.operation {
            Operation::Get { id } => Ok(OperationOutcome::Found(
                self.store.load(entity_type, id).await?,
            )),
            Operation::Query(query) => Ok(OperationOutcome::Listed(
                self.store.query(entity_type, query).await?,
            )),
            Operation::Create(record) => Ok(OperationOutcome::Written(vec![
                self.create(record).await?,
            ])),
            Operation::Update(update) => Ok(OperationOutcome::Written(vec![
                self.update(update).await?,
            ])),
            Operation::Delete(delete) => self.delete_all(entity_type, std::slice::from_ref(delete)).await,
            Operation::CreateMany(records) => {
                let mut written = Vec::with_capacity(records.len());
                for record in records {
                    written.push(self.create(record).await?);
                }
                Ok(OperationOutcome::Written(written))
            }
            Operation::UpdateMany(updates) => {
                let mut written = Vec::with_capacity(updates.len());
                for update in updates {
                    written.push(self.update(update).await?);
                }
                Ok(OperationOutcome::Written(written))
            }
            Operation::DeleteMany(deletes) => self.delete_all(entity_type, deletes).await,
        }
    }
}

/// Typed repository for one entity type.
pub struct Repository<E: Entity> {
    store: Arc<dyn EntityStore>,
    chain: InterceptorChain,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    /// Creates a repository.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, chain: InterceptorChain) -> Self {
        Self {
            store,
            chain,
            _entity: PhantomData,
        }
    }

    /// Returns the interceptor chain.
    #[must_use]
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    async fn read(&self, operation: Operation) -> Result<OperationOutcome, DomainError> {
        let mut ctx = OperationContext::new(E::ENTITY_TYPE, operation);
        let mut terminal = StoreTerminal::reader(self.store.as_ref());
        self.chain.execute(&mut ctx, &mut terminal).await
    }

    async fn write(
        &self,
        uow: &mut UnitOfWork,
        operation: Operation,
    ) -> Result<OperationOutcome, DomainError> {
        let mut ctx = OperationContext::new(E::ENTITY_TYPE, operation);
        debug!(
            entity_type = E::ENTITY_TYPE,
            operation = ctx.operation.name(),
            uow_id = %uow.id(),
            "staging write"
        );
        let mut terminal = StoreTerminal::writer(self.store.as_ref(), uow);
        let outcome = self.chain.execute(&mut ctx, &mut terminal).await?;
        for hook in ctx.take_deferred() {
            uow.on_commit(hook)?;
        }
        Ok(outcome)
    }

    fn written(outcome: OperationOutcome) -> Result<Vec<E>, DomainError> {
        match outcome {
            OperationOutcome::Written(records) => records.into_iter().map(from_record::<E>).collect(),
            other => Err(DomainError::Infrastructure(format!(
                "unexpected outcome for a write: {other:?}"
            ))),
        }
    }

    fn single(mut entities: Vec<E>) -> Result<E, DomainError> {
        entities.pop().ok_or_else(|| {
            DomainError::Infrastructure(format!("write on {} returned no record", E::ENTITY_TYPE))
        })
    }

    /// Loads an entity by id.
    ///
    /// # Errors
    ///
    /// Returns store errors, or `DomainError::Serialization` if the stored
    /// data does not decode.
    pub async fn get(&self, id: &str) -> Result<Option<E>, DomainError> {
        match self.read(Operation::Get { id: id.to_owned() }).await? {
            OperationOutcome::Found(record) => record.map(from_record::<E>).transpose(),
            other => Err(DomainError::Infrastructure(format!(
                "unexpected outcome for get: {other:?}"
            ))),
        }
    }

    /// Lists entities matching `query`.
    ///
    /// # Errors
    ///
    /// Returns store errors, or `DomainError::Serialization` if stored data
    /// does not decode.
    pub async fn find(&self, query: &Query) -> Result<Vec<E>, DomainError> {
        match self.read(Operation::Query(query.clone())).await? {
            OperationOutcome::Listed(records) => records.into_iter().map(from_record::<E>).collect(),
            other => Err(DomainError::Infrastructure(format!(
                "unexpected outcome for query: {other:?}"
            ))),
        }
    }

    /// Stages the insert of a new entity and returns it as it will be
    /// stored.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the id already exists.
    pub async fn create(&self, uow: &mut UnitOfWork, entity: &E) -> Result<E, DomainError> {
        let outcome = self.write(uow, Operation::Create(to_record(entity)?)).await?;
        Self::single(Self::written(outcome)?)
    }

    /// Stages an update checked against the version `entity` was loaded at.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stored version
    /// differs, or `DomainError::NotFound` if the entity does not exist.
    pub async fn update(&self, uow: &mut UnitOfWork, entity: &E) -> Result<E, DomainError> {
        let update = RecordUpdate {
            record: to_record(entity)?,
            expected_version: entity.version(),
        };
        let outcome = self.write(uow, Operation::Update(update)).await?;
        Self::single(Self::written(outcome)?)
    }

    /// Stages the deletion of `entity`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stored version
    /// differs, or `DomainError::NotFound` if the entity does not exist.
    pub async fn delete(&self, uow: &mut UnitOfWork, entity: &E) -> Result<(), DomainError> {
        let delete = RecordDelete {
            id: entity.id(),
            expected_version: Some(entity.version()),
            mode: DeleteMode::Hard,
        };
        self.write(uow, Operation::Delete(delete)).await?;
        Ok(())
    }

    /// Stages inserts for several entities.
    ///
    /// # Errors
    ///
    /// Fails on the first conflicting id; nothing from the batch is staged
    /// past that point.
    pub async fn create_many(&self, uow: &mut UnitOfWork, entities: &[E]) -> Result<Vec<E>, DomainError> {
        let records = entities.iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
        Self::written(self.write(uow, Operation::CreateMany(records)).await?)
    }

    /// Stages updates for several entities.
    ///
    /// # Errors
    ///
    /// Fails on the first stale or missing entity.
    pub async fn update_many(&self, uow: &mut UnitOfWork, entities: &[E]) -> Result<Vec<E>, DomainError> {
        let updates = entities
            .iter()
            .map(|entity| {
                Ok(RecordUpdate {
                    record: to_record(entity)?,
                    expected_version: entity.version(),
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;
        Self::written(self.write(uow, Operation::UpdateMany(updates)).await?)
    }

    /// Stages deletion of several entities and returns how many were
    /// deleted.
    ///
    /// # Errors
    ///
    /// Fails on the first stale or missing entity.
    pub async fn delete_many(&self, uow: &mut UnitOfWork, entities: &[E]) -> Result<usize, DomainError> {
        let deletes = entities
            .iter()
            .map(|entity| RecordDelete {
                id: entity.id(),
                expected_version: Some(entity.version()),
                mode: DeleteMode::Hard,
            })
            .collect::<Vec<_>>();
        let count = deletes.len();
        self.write(uow, Operation::DeleteMany(deletes)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use relaykit_core::clock::Clock;
    use relaykit_test_support::{FixedClock, InMemoryStore, MockRng, RecordingBus};
    use relaykit_uow::UnitOfWorkFactory;
    use serde::Deserialize;

    use super::*;
    use crate::interceptors::{AuditInterceptor, OptimisticLockInterceptor, SoftDeleteInterceptor};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        sku: String,
        price_cents: i64,
        #[serde(skip)]
        version: i64,
    }

    impl Entity for Product {
        const ENTITY_TYPE: &'static str = "Product";

        fn id(&self) -> String {
            self.sku.clone()
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }

    fn product(sku: &str, price_cents: i64) -> Product {
        Product {
            sku: sku.into(),
            price_cents,
            version: 0,
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()))
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        factory: UnitOfWorkFactory,
        repo: Repository<Product>,
    }

    fn fixture(chain: InterceptorChain) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let factory = UnitOfWorkFactory::new(store.clone(), store.clone(), Arc::new(RecordingBus::new()))
            .with_clock(clock())
            .with_rng(Box::new(MockRng));
        let repo = Repository::new(store.clone(), chain);
        Fixture {
            store,
            factory,
            repo,
        }
    }

    fn versioned() -> InterceptorChain {
        InterceptorChain::new()
            .with(OptimisticLockInterceptor::new())
            .with(AuditInterceptor::new(clock()))
    }

    #[tokio::test]
    async fn test_create_then_get_round_trips_with_version_one() {
        // Arrange
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();

        // Act
        let created = fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();
        uow.commit().await.unwrap();
        let loaded = fx.repo.get("sku-1").await.unwrap().unwrap();

        // Assert
        assert_eq!(created.version, 1);
        assert_eq!(loaded, created);
        let stored = fx.store.entity("Product", "sku-1").unwrap();
        assert_eq!(stored.data["created_at"], "2026-06-01T08:00:00Z");
    }

    #[tokio::test]
    async fn test_update_bumps_the_version() {
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();
        uow.commit().await.unwrap();

        let mut loaded = fx.repo.get("sku-1").await.unwrap().unwrap();
        loaded.price_cents = 450;
        let mut uow = fx.factory.begin();
        let updated = fx.repo.update(&mut uow, &loaded).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(updated.version, 2);
        let stored = fx.store.entity("Product", "sku-1").unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.data["price_cents"], 450);
    }

    #[tokio::test]
    async fn test_stale_update_fails_and_never_applies() {
        // Arrange
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();
        uow.commit().await.unwrap();
        let mut first = fx.repo.get("sku-1").await.unwrap().unwrap();
        let mut second = first.clone();
        first.price_cents = 400;
        let mut uow = fx.factory.begin();
        fx.repo.update(&mut uow, &first).await.unwrap();
        uow.commit().await.unwrap();

        // Act
        second.price_cents = 300;
        let mut uow = fx.factory.begin();
        let err = fx.repo.update(&mut uow, &second).await.unwrap_err();
        uow.rollback().unwrap();

        // Assert
        assert_eq!(
            err,
            DomainError::ConcurrencyConflict {
                aggregate_id: "sku-1".into(),
                expected: 1,
                actual: 2,
            }
        );
        assert_eq!(fx.store.entity("Product", "sku-1").unwrap().data["price_cents"], 400);
    }

    #[tokio::test]
    async fn test_stale_write_slipping_past_the_eager_check_fails_at_commit() {
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();
        uow.commit().await.unwrap();
        let mut loaded = fx.repo.get("sku-1").await.unwrap().unwrap();
        loaded.price_cents = 100;

        let mut slow = fx.factory.begin();
        fx.repo.update(&mut slow, &loaded).await.unwrap();
        let mut fast = fx.factory.begin();
        fx.repo.update(&mut fast, &loaded).await.unwrap();
        fast.commit().await.unwrap();
        let err = slow.commit().await.unwrap_err();

        assert_eq!(err.reason_code(), "CONCURRENCY_CONFLICT");
        assert_eq!(fx.store.entity("Product", "sku-1").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_create_of_existing_id_conflicts() {
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();

        let err = fx.repo.create(&mut uow, &product("sku-1", 600)).await.unwrap_err();
        uow.rollback().unwrap();

        assert!(matches!(err, DomainError::ConcurrencyConflict { expected: 0, actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_update_of_missing_entity_is_not_found() {
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        let mut ghost = product("ghost", 1);
        ghost.version = 3;

        let err = fx.repo.update(&mut uow, &ghost).await.unwrap_err();
        uow.rollback().unwrap();

        assert_eq!(err.reason_code(), "ENTITY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_batch_create_find_and_delete() {
        // Arrange
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        let created = fx
            .repo
            .create_many(&mut uow, &[product("a", 100), product("b", 100), product("c", 200)])
            .await
            .unwrap();
        uow.commit().await.unwrap();

        // Act
        let cheap = fx.repo.find(&Query::new().eq("price_cents", 100)).await.unwrap();
        let mut uow = fx.factory.begin();
        let deleted = fx.repo.delete_many(&mut uow, &cheap).await.unwrap();
        uow.commit().await.unwrap();

        // Assert
        assert_eq!(created.len(), 3);
        assert_eq!(cheap.len(), 2);
        assert_eq!(deleted, 2);
        let remaining = fx.repo.find(&Query::new()).await.unwrap();
        assert_eq!(remaining.iter().map(|p| p.sku.as_str()).collect::<Vec<_>>(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_update_many_checks_every_version() {
        let fx = fixture(versioned());
        let mut uow = fx.factory.begin();
        let mut created = fx
            .repo
            .create_many(&mut uow, &[product("a", 1), product("b", 2)])
            .await
            .unwrap();
        uow.commit().await.unwrap();
        created[1].version = 7;

        let mut uow = fx.factory.begin();
        let err = fx.repo.update_many(&mut uow, &created).await.unwrap_err();
        uow.rollback().unwrap();

        assert!(matches!(err, DomainError::ConcurrencyConflict { expected: 7, actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_the_row_but_hides_it() {
        // Arrange
        let chain = versioned().with(SoftDeleteInterceptor::new(clock()));
        let fx = fixture(chain);
        let mut uow = fx.factory.begin();
        let created = fx.repo.create(&mut uow, &product("sku-1", 500)).await.unwrap();
        uow.commit().await.unwrap();

        // Act
        let mut uow = fx.factory.begin();
        fx.repo.delete(&mut uow, &created).await.unwrap();
        uow.commit().await.unwrap();

        // Assert
        assert!(fx.repo.get("sku-1").await.unwrap().is_none());
        assert!(fx.repo.find(&Query::new()).await.unwrap().is_empty());
        let stored = fx.store.entity("Product", "sku-1").unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.data["deleted_at"], "2026-06-01T08:00:00Z");
    }

    #[tokio::test]
    async fn test_limited_find_skips_soft_deleted_rows() {
        // Arrange
        let chain = versioned().with(SoftDeleteInterceptor::new(clock()));
        let fx = fixture(chain);
        let mut uow = fx.factory.begin();
        let first = fx.repo.create(&mut uow, &product("sku-a", 100)).await.unwrap();
        fx.repo.create(&mut uow, &product("sku-b", 200)).await.unwrap();
        uow.commit().await.unwrap();
        let mut uow = fx.factory.begin();
        fx.repo.delete(&mut uow, &first).await.unwrap();
        uow.commit().await.unwrap();

        // Act
        let page = fx.repo.find(&Query::new().limit(1)).await.unwrap();

        // Assert
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sku, "sku-b");
    }

    #[tokio::test]
    async fn test_writes_through_a_reader_are_rejected() {
        let store = InMemoryStore::new();
        let mut terminal = StoreTerminal::reader(&store);
        let mut ctx = OperationContext::new(
            "Product",
            Operation::Create(to_record(&product("sku-1", 1)).unwrap()),
        );

        let err = InterceptorChain::new()
            .execute(&mut ctx, &mut terminal)
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }
}
