//! Per-connection service container.
//!
//! Each connection gets its own [`ServiceContainer`]. Services registered as
//! scoped are built lazily by their factory the first time they are looked
//! up, at most once per container, and live until the container is disposed.
//! The connection's [`Registration`] and [`RequestContext`] are seeded at
//! construction so factories can depend on them like any other service.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::ReentrantMutex;
use srpc_transport::{Registration, RequestContext};
use tracing::debug;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceContainer) -> Instance + Send + Sync>;

/// Factories for scoped services, keyed by the type they produce.
#[derive(Clone, Default)]
pub(crate) struct ScopedFactories {
    factories: HashMap<TypeId, Factory>,
}

impl ScopedFactories {
    /// Register `factory` for `T`, replacing any earlier factory for `T`.
    pub(crate) fn insert<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceContainer) -> T + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |container| Arc::new(factory(container)) as Instance);
        self.factories.insert(TypeId::of::<T>(), factory);
    }

    pub(crate) fn contains(&self, type_id: &TypeId) -> bool {
        self.factories.contains_key(type_id)
    }

    fn get(&self, type_id: &TypeId) -> Option<Factory> {
        self.factories.get(type_id).cloned()
    }
}

/// Isolated service instances for one connection.
pub struct ServiceContainer {
    registration: Arc<Registration>,
    context: Arc<RequestContext>,
    factories: Arc<ScopedFactories>,
    /// Reentrant so a factory can resolve its own dependencies; the `RefCell`
    /// is never borrowed while a factory runs.
    instances: ReentrantMutex<RefCell<HashMap<TypeId, Instance>>>,
    disposed: AtomicBool,
}

impl ServiceContainer {
    pub(crate) fn new(
        registration: Arc<Registration>,
        context: Arc<RequestContext>,
        factories: Arc<ScopedFactories>,
    ) -> Self {
        let mut seeded: HashMap<TypeId, Instance> = HashMap::new();
        seeded.insert(TypeId::of::<Registration>(), registration.clone());
        seeded.insert(TypeId::of::<RequestContext>(), context.clone());

        Self {
            registration,
            context,
            factories,
            instances: ReentrantMutex::new(RefCell::new(seeded)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    /// Resolve a service for this connection.
    ///
    /// Returns the cached instance if one exists, otherwise runs the
    /// registered factory and caches its result. `None` if no factory is
    /// registered for `T` or the container has been disposed.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let guard = self.instances.lock();

        let cached = guard.borrow().get(&type_id).cloned();
        if let Some(instance) = cached {
            return instance.downcast::<T>().ok();
        }
        if self.is_disposed() {
            return None;
        }

        let factory = self.factories.get(&type_id)?;
        let created = factory(self);
        debug!(
            connection = %self.context.id(),
            service = std::any::type_name::<T>(),
            "scoped service created"
        );

        let instance = guard
            .borrow_mut()
            .entry(type_id)
            .or_insert(created)
            .clone();
        instance.downcast::<T>().ok()
    }

    /// Whether an instance of `T` has been created (or seeded) in this container.
    pub fn is_resolved<T: 'static>(&self) -> bool {
        self.instances.lock().borrow().contains_key(&TypeId::of::<T>())
    }

    /// Whether a factory for `T` is registered.
    pub fn can_resolve<T: 'static>(&self) -> bool {
        let type_id = TypeId::of::<T>();
        self.is_resolved::<T>() || self.factories.contains(&type_id)
    }

    /// Drop every instance held by this container. Idempotent; returns the
    /// number of instances released by this call.
    pub fn dispose(&self) -> usize {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let released = {
            let guard = self.instances.lock();
            std::mem::take(&mut *guard.borrow_mut())
        };
        released.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("connection", self.context.id())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        value: usize,
    }

    struct Greeter {
        connection: String,
        counter: Arc<Counter>,
    }

    fn container(factories: ScopedFactories) -> ServiceContainer {
        ServiceContainer::new(
            Arc::new(Registration::new("c1".into())),
            Arc::new(RequestContext::detached("c1".into())),
            Arc::new(factories),
        )
    }

    #[test]
    fn seeds_registration_and_context() {
        let c = container(ScopedFactories::default());
        let ctx = c.get::<RequestContext>().unwrap();
        assert_eq!(ctx.id().as_str(), "c1");
        assert!(Arc::ptr_eq(&ctx, c.context()));
        assert!(Arc::ptr_eq(&c.get::<Registration>().unwrap(), c.registration()));
    }

    #[test]
    fn factory_runs_once_per_container() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut factories = ScopedFactories::default();
        {
            let calls = calls.clone();
            factories.insert(move |_| Counter {
                value: calls.fetch_add(1, Ordering::SeqCst) + 1,
            });
        }
        let factories = Arc::new(factories);

        let a = ServiceContainer::new(
            Arc::new(Registration::new("a".into())),
            Arc::new(RequestContext::detached("a".into())),
            factories.clone(),
        );
        let b = ServiceContainer::new(
            Arc::new(Registration::new("b".into())),
            Arc::new(RequestContext::detached("b".into())),
            factories,
        );

        assert!(!a.is_resolved::<Counter>());
        let first = a.get::<Counter>().unwrap();
        let again = a.get::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.value, 1);

        let other = b.get::<Counter>().unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn factories_resolve_dependencies() {
        let mut factories = ScopedFactories::default();
        factories.insert(|_| Counter { value: 7 });
        factories.insert(|c: &ServiceContainer| Greeter {
            connection: c.context().id().to_string(),
            counter: c.get::<Counter>().unwrap(),
        });
        let c = container(factories);

        let greeter = c.get::<Greeter>().unwrap();
        assert_eq!(greeter.connection, "c1");
        assert_eq!(greeter.counter.value, 7);
        assert!(Arc::ptr_eq(&greeter.counter, &c.get::<Counter>().unwrap()));
    }

    #[test]
    fn unknown_type_is_none() {
        let c = container(ScopedFactories::default());
        assert!(!c.can_resolve::<Counter>());
        assert!(c.get::<Counter>().is_none());
    }

    #[test]
    fn dispose_releases_instances() {
        let mut factories = ScopedFactories::default();
        factories.insert(|_| Counter { value: 1 });
        let c = container(factories);
        let held = c.get::<Counter>().unwrap();
        assert_eq!(Arc::strong_count(&held), 2);

        // counter + registration + context
        assert_eq!(c.dispose(), 3);
        assert_eq!(c.dispose(), 0);
        assert!(c.is_disposed());
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(c.get::<Counter>().is_none());
    }
}
