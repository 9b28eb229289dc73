use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{Lifetime, LifetimeTag};
use crate::error::{ConfigError, ResolveError, UnitOfWorkError};
use crate::unit_of_work::{CacheKey, CachedValue, InvalidateFn, ProcessingCycle, UnitOfWorkParticipant};

type Factory = Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<CachedValue> + Send + Sync>;
type Disposer = fn(&CachedValue);
type ParticipantCast = fn(CachedValue) -> Option<Arc<dyn UnitOfWorkParticipant>>;

// ---------------------------------------------------------------------------
// Disposable
// ---------------------------------------------------------------------------

/// A resolved instance holding resources released when its lifetime ends:
/// at cycle end for per-unit-of-work instances, at
/// [`Container::dispose_singletons`] for singletons.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

fn dispose_erased<T: Disposable + Any>(value: &CachedValue) {
    if let Some(instance) = (**value).downcast_ref::<T>() {
        instance.dispose();
    }
}

fn participant_erased<T: UnitOfWorkParticipant + Any>(
    value: CachedValue,
) -> Option<Arc<dyn UnitOfWorkParticipant>> {
    value
        .downcast::<T>()
        .ok()
        .map(|instance| instance as Arc<dyn UnitOfWorkParticipant>)
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct Registration {
    type_name: &'static str,
    lifetime: Lifetime,
    factory: Factory,
    disposer: Option<Disposer>,
    participant: Option<ParticipantCast>,
    /// Serializes singleton construction for this type.
    init_lock: Mutex<()>,
}

// ---------------------------------------------------------------------------
// ContainerBuilder
// ---------------------------------------------------------------------------

/// Collects registrations. Every `register*` call validates its lifetime tag
/// and rejects a second registration of the same type.
#[derive(Default)]
pub struct ContainerBuilder {
    registrations: HashMap<TypeId, Registration>,
    order: Vec<TypeId>,
    instances: Vec<(TypeId, CachedValue)>,
}

impl ContainerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` with `lifetime`, built by `factory`. The factory receives
    /// a resolver for its own dependencies.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidLifetime` if the tag names no lifetime,
    /// `ConfigError::DuplicateRegistration` if `T` is already registered.
    pub fn register<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T, F>(lifetime.into(), factory, None, None)
    }

    /// Register a [`Disposable`] type; `dispose` runs when its lifetime ends.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_disposable<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: Disposable + Any,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T, F>(lifetime.into(), factory, Some(dispose_erased::<T>), None)
    }

    /// Register a [`UnitOfWorkParticipant`]; every resolution inside a cycle
    /// enlists the resolved instance for that cycle's flush.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_participant<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: UnitOfWorkParticipant + Any,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T, F>(lifetime.into(), factory, None, Some(participant_erased::<T>))
    }

    /// Register a pre-built singleton.
    ///
    /// # Errors
    ///
    /// `ConfigError::DuplicateRegistration` if `T` is already registered.
    pub fn register_instance<T: Any + Send + Sync>(
        &mut self,
        instance: Arc<T>,
    ) -> Result<&mut Self, ConfigError> {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        self.check_unregistered(type_id, type_name)?;

        let value: CachedValue = instance;
        let shared = Arc::clone(&value);
        self.registrations.insert(
            type_id,
            Registration {
                type_name,
                lifetime: Lifetime::Singleton,
                factory: Arc::new(move |_: &Resolver<'_>| Ok(Arc::clone(&shared))),
                disposer: None,
                participant: None,
                init_lock: Mutex::new(()),
            },
        );
        self.order.push(type_id);
        self.instances.push((type_id, value));
        Ok(self)
    }

    /// Whether `T` has a registration.
    #[must_use]
    pub fn is_registered<T: Any>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    /// Lifetime `T` was registered with.
    #[must_use]
    pub fn lifetime_of<T: Any>(&self) -> Option<Lifetime> {
        self.registrations.get(&TypeId::of::<T>()).map(|r| r.lifetime)
    }

    #[must_use]
    pub fn build(self) -> Container {
        let singletons = DashMap::new();
        for (type_id, value) in self.instances {
            singletons.insert(type_id, value);
        }
        Container {
            registrations: self.registrations,
            order: self.order,
            singletons,
        }
    }

    fn check_unregistered(&self, type_id: TypeId, type_name: &'static str) -> Result<(), ConfigError> {
        if self.registrations.contains_key(&type_id) {
            return Err(ConfigError::DuplicateRegistration { type_name });
        }
        Ok(())
    }

    fn insert<T, F>(
        &mut self,
        tag: LifetimeTag,
        factory: F,
        disposer: Option<Disposer>,
        participant: Option<ParticipantCast>,
    ) -> Result<&mut Self, ConfigError>
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let lifetime = tag
            .resolve()
            .map_err(|value| ConfigError::InvalidLifetime { type_name, value })?;
        let type_id = TypeId::of::<T>();
        self.check_unregistered(type_id, type_name)?;

        let factory: Factory =
            Arc::new(move |resolver: &Resolver<'_>| factory(resolver).map(|value| Arc::new(value) as CachedValue));
        self.registrations.insert(
            type_id,
            Registration {
                type_name,
                lifetime,
                factory,
                disposer,
                participant,
                init_lock: Mutex::new(()),
            },
        );
        self.order.push(type_id);
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Immutable set of registrations plus the constructed singletons.
pub struct Container {
    registrations: HashMap<TypeId, Registration>,
    /// Registration order, reversed for singleton disposal.
    order: Vec<TypeId>,
    singletons: DashMap<TypeId, CachedValue>,
}

impl Container {
    #[must_use]
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// Resolver bound to `cycle` (or to no cycle).
    #[must_use]
    pub fn resolver<'a>(&'a self, cycle: Option<&'a ProcessingCycle>) -> Resolver<'a> {
        Resolver {
            container: self,
            cycle,
            enlist: true,
            frame: None,
        }
    }

    #[must_use]
    pub fn is_registered<T: Any>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn lifetime_of<T: Any>(&self) -> Option<Lifetime> {
        self.registrations.get(&TypeId::of::<T>()).map(|r| r.lifetime)
    }

    /// Number of singletons constructed (or pre-built) so far.
    #[must_use]
    pub fn singleton_count(&self) -> usize {
        self.singletons.len()
    }

    /// Dispose constructed singletons in reverse registration order and drop
    /// them. A later resolution constructs a fresh instance.
    pub fn dispose_singletons(&self) {
        for type_id in self.order.iter().rev() {
            let Some((_, instance)) = self.singletons.remove(type_id) else {
                continue;
            };
            if let Some(registration) = self.registrations.get(type_id) {
                debug!(service = registration.type_name, "disposing singleton");
                if let Some(dispose) = registration.disposer {
                    dispose(&instance);
                }
            }
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registrations", &self.registrations.len())
            .field("singletons", &self.singletons.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// One step of the resolution chain, used to detect cycles and captive
/// dependencies.
struct Frame<'a> {
    type_id: TypeId,
    type_name: &'static str,
    lifetime: Lifetime,
    parent: Option<&'a Frame<'a>>,
}

impl<'a> Frame<'a> {
    fn ancestors(&'a self) -> impl Iterator<Item = &'a Frame<'a>> {
        std::iter::successors(Some(self), |frame| frame.parent)
    }
}

/// Resolves registrations against a container and, optionally, the active
/// processing cycle. Factories receive a child resolver that tracks the
/// chain of types being constructed.
pub struct Resolver<'a> {
    container: &'a Container,
    cycle: Option<&'a ProcessingCycle>,
    enlist: bool,
    frame: Option<Frame<'a>>,
}

impl Resolver<'_> {
    /// The processing cycle this resolver is bound to.
    #[must_use]
    pub fn cycle(&self) -> Option<&ProcessingCycle> {
        self.cycle
    }

    /// Resolve without enlisting participants, for reads inside a
    /// read-write cycle. Per-unit-of-work instances are still shared.
    #[must_use]
    pub fn without_enlistment(mut self) -> Self {
        self.enlist = false;
        self
    }

    /// Resolve `T` according to its registered lifetime.
    ///
    /// # Errors
    ///
    /// - `NotRegistered` if `T` has no registration
    /// - `NoActiveCycle` for a per-unit-of-work `T` outside a cycle
    /// - `CircularDependency` if `T` is already being constructed in this chain
    /// - `CaptiveDependency` if a singleton (transitively) depends on a
    ///   per-unit-of-work `T`
    /// - `Construction` if a factory fails
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ResolveError> {
        let type_name = std::any::type_name::<T>();
        let value = self.resolve_erased(TypeId::of::<T>(), type_name)?;
        value.downcast::<T>().map_err(|_| ResolveError::Construction {
            type_name,
            source: anyhow::anyhow!("factory produced a value of another type"),
        })
    }

    fn resolve_erased(&self, type_id: TypeId, type_name: &'static str) -> Result<CachedValue, ResolveError> {
        let registration = self
            .container
            .registrations
            .get(&type_id)
            .ok_or(ResolveError::NotRegistered { type_name })?;
        self.check_chain(type_id, registration)?;

        let value = match registration.lifetime {
            Lifetime::Singleton => self.singleton(type_id, registration)?,
            Lifetime::PerResolve => self.construct(type_id, registration, self.cycle)?,
            Lifetime::PerUnitOfWork => self.per_unit_of_work(type_id, registration)?,
        };

        if let (true, Some(cycle), Some(cast)) = (self.enlist, self.cycle, registration.participant) {
            if let Some(participant) = cast(Arc::clone(&value)) {
                cycle.enlist(participant);
            }
        }
        Ok(value)
    }

    fn check_chain(&self, type_id: TypeId, registration: &Registration) -> Result<(), ResolveError> {
        let Some(frame) = &self.frame else {
            return Ok(());
        };

        if frame.ancestors().any(|f| f.type_id == type_id) {
            let mut path: Vec<&str> = frame.ancestors().map(|f| f.type_name).collect();
            path.reverse();
            path.push(registration.type_name);
            return Err(ResolveError::CircularDependency {
                path: path.join(" -> "),
            });
        }

        if registration.lifetime == Lifetime::PerUnitOfWork {
            if let Some(singleton) = frame.ancestors().find(|f| f.lifetime == Lifetime::Singleton) {
                return Err(ResolveError::CaptiveDependency {
                    singleton: singleton.type_name,
                    dependency: registration.type_name,
                });
            }
        }
        Ok(())
    }

    fn singleton(&self, type_id: TypeId, registration: &Registration) -> Result<CachedValue, ResolveError> {
        if let Some(existing) = self.container.singletons.get(&type_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let _guard = registration.init_lock.lock();
        if let Some(existing) = self.container.singletons.get(&type_id) {
            return Ok(Arc::clone(existing.value()));
        }
        // Singletons outlive every cycle, so they are built without one.
        let value = self.construct(type_id, registration, None)?;
        debug!(service = registration.type_name, "constructed singleton");
        self.container.singletons.insert(type_id, Arc::clone(&value));
        Ok(value)
    }

    fn per_unit_of_work(&self, type_id: TypeId, registration: &Registration) -> Result<CachedValue, ResolveError> {
        let cycle = self.cycle.ok_or(ResolveError::NoActiveCycle {
            type_name: registration.type_name,
        })?;
        let key = CacheKey::from_parts(type_id, registration.type_name);
        if let Some(value) = cycle.cache().get(&key).and_then(|entry| entry.try_get_value()) {
            return Ok(value);
        }

        let value = self.construct(type_id, registration, self.cycle)?;
        let on_invalidate = registration
            .disposer
            .map(|dispose| Box::new(move |value: CachedValue| dispose(&value)) as InvalidateFn);
        match cycle.cache().add_keyed(key.clone(), Arc::clone(&value), on_invalidate) {
            Ok(_) => Ok(value),
            Err(UnitOfWorkError::DuplicateKey { .. }) => {
                // Constructed concurrently within the same cycle: keep the
                // first instance, release ours.
                if let Some(dispose) = registration.disposer {
                    dispose(&value);
                }
                cycle
                    .cache()
                    .get(&key)
                    .and_then(|entry| entry.try_get_value())
                    .ok_or(ResolveError::UnitOfWork(UnitOfWorkError::CycleEnded))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn construct(
        &self,
        type_id: TypeId,
        registration: &Registration,
        cycle: Option<&ProcessingCycle>,
    ) -> Result<CachedValue, ResolveError> {
        let child = Resolver {
            container: self.container,
            cycle,
            enlist: self.enlist,
            frame: Some(Frame {
                type_id,
                type_name: registration.type_name,
                lifetime: registration.lifetime,
                parent: self.frame.as_ref(),
            }),
        };
        (registration.factory)(&child).map_err(|err| match err.downcast::<ResolveError>() {
            Ok(nested) => nested,
            Err(source) => ResolveError::Construction {
                type_name: registration.type_name,
                source,
            },
        })
    }
}

impl fmt::Debug for Resolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("cycle", &self.cycle.map(ProcessingCycle::id))
            .field("enlist", &self.enlist)
            .field("resolving", &self.frame.as_ref().map(|frame| frame.type_name))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
