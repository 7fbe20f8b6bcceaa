//! Cache options: the view model, identity-keyed override maps, the
//! identity↔kind translation they go through, layer composition, and
//! defaulting.

use std::time::Duration;

use kube::Client;
use rustc_hash::FxHashMap;
use tracing::warn;

use kelpie_core::{KindKey, Selector, Transform};
use kelpie_schema::{ObjectIdentity, SchemaError, SchemaRegistry};
use kelpie_watch::{ByKindConfig, ResourceMapper};

use crate::{CacheError, CacheResult};

/// Base frequency at which stores re-deliver their contents to handlers.
/// Long on purpose: the watch stream keeps stores current, resync only heals
/// drift.
pub const DEFAULT_RESYNC_EVERY: Duration = Duration::from_secs(10 * 60 * 60);

/// Restriction a cache applies: which namespaces, which objects, and how
/// objects are rewritten or returned.
#[derive(Default)]
pub struct ViewOptions {
    /// Namespaces to watch. Empty means all namespaces.
    pub namespaces: Vec<String>,

    /// Selector for every kind without a more specific entry in `by_object`.
    pub default_selector: Selector,

    /// Transform for every kind without a more specific entry in `by_object`.
    pub default_transform: Transform,

    /// Per-kind overrides, keyed by object identity.
    pub by_object: ViewByObject,
}

/// Fine-grained per-kind view overrides.
#[derive(Default)]
pub struct ViewByObject {
    pub selectors: SelectorsByObject,
    pub transforms: TransformsByObject,
    pub disable_deep_copy: DisableDeepCopyByObject,
}

/// Identity-keyed selector overrides. The identity's concrete type, resolved
/// through the schema registry, decides which kind an entry applies to.
#[derive(Default)]
pub struct SelectorsByObject {
    entries: Vec<(Box<dyn ObjectIdentity>, Selector)>,
}

/// Identity-keyed transform overrides.
#[derive(Default)]
pub struct TransformsByObject {
    entries: Vec<(Box<dyn ObjectIdentity>, Transform)>,
}

/// Key of a deep-copy override: one concrete identity, or the wildcard that
/// stands in for every kind.
pub enum IdentityKey {
    AllObjects,
    Object(Box<dyn ObjectIdentity>),
}

/// Identity-keyed "skip the defensive copy on reads" overrides.
#[derive(Default)]
pub struct DisableDeepCopyByObject {
    entries: Vec<(IdentityKey, bool)>,
}

impl SelectorsByObject {
    /// Record a selector override for `K`.
    pub fn of<K>(mut self, selector: Selector) -> Self
    where
        K: ObjectIdentity + Default + 'static,
    {
        self.entries.push((Box::new(K::default()), selector));
        self
    }

    pub fn insert(&mut self, identity: Box<dyn ObjectIdentity>, selector: Selector) {
        self.entries.push((identity, selector));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&dyn ObjectIdentity, &Selector)> {
        self.entries.iter().map(|(id, s)| (id.as_ref(), s))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[(Box<dyn ObjectIdentity>, Selector)] {
        &self.entries
    }

    pub(crate) fn from_entries(entries: Vec<(Box<dyn ObjectIdentity>, Selector)>) -> Self {
        Self { entries }
    }
}

impl TransformsByObject {
    /// Record a transform override for `K`.
    pub fn of<K>(mut self, transform: Transform) -> Self
    where
        K: ObjectIdentity + Default + 'static,
    {
        self.entries.push((Box::new(K::default()), transform));
        self
    }

    pub fn insert(&mut self, identity: Box<dyn ObjectIdentity>, transform: Transform) {
        self.entries.push((identity, transform));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&dyn ObjectIdentity, &Transform)> {
        self.entries.iter().map(|(id, t)| (id.as_ref(), t))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[(Box<dyn ObjectIdentity>, Transform)] {
        &self.entries
    }

    pub(crate) fn from_entries(entries: Vec<(Box<dyn ObjectIdentity>, Transform)>) -> Self {
        Self { entries }
    }
}

impl DisableDeepCopyByObject {
    /// Record a deep-copy override for `K`.
    pub fn of<K>(mut self, disable: bool) -> Self
    where
        K: ObjectIdentity + Default + 'static,
    {
        self.entries.push((IdentityKey::Object(Box::new(K::default())), disable));
        self
    }

    /// Record the wildcard override applying to every kind.
    pub fn all_objects(mut self, disable: bool) -> Self {
        self.entries.push((IdentityKey::AllObjects, disable));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, bool)> {
        self.entries.iter().map(|(k, d)| (k, *d))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[(IdentityKey, bool)] {
        &self.entries
    }
}

/// Arguments for building a cache. Every field is optional; absent ones are
/// filled by [`Options::apply_defaults`] before use.
#[derive(Default)]
pub struct Options {
    /// Client used for watch streams and discovery.
    pub client: Option<Client>,

    /// Registry resolving object identities to kinds and back.
    pub registry: Option<SchemaRegistry>,

    /// Kind to API-resource mapping; discovered from the server if absent.
    pub mapper: Option<ResourceMapper>,

    /// Base store resync frequency.
    pub resync_every: Option<Duration>,

    /// What this cache watches and how.
    pub view: ViewOptions,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("client", &self.client.as_ref().map(|_| "Client"))
            .field("registry", &self.registry.as_ref().map(|_| "SchemaRegistry"))
            .field("mapper", &self.mapper.as_ref().map(|_| "ResourceMapper"))
            .field("resync_every", &self.resync_every)
            .field("view", &"ViewOptions")
            .finish()
    }
}

impl Options {
    /// Fill every unset field with its process default. Each field is
    /// independent, and filling is idempotent.
    pub async fn apply_defaults(mut self, config: &kube::Config) -> CacheResult<Options> {
        let client = match self.client.take() {
            Some(c) => c,
            None => Client::try_from(config.clone()).map_err(|e| {
                warn!(error = %e, "failed to build client from config");
                CacheError::Transport(e)
            })?,
        };
        if self.registry.is_none() {
            self.registry = Some(SchemaRegistry::core_kinds());
        }
        if self.mapper.is_none() {
            let mapper = ResourceMapper::discover(&client).await.map_err(|e| {
                warn!(error = %e, "failed to discover API resources");
                CacheError::Discovery(e)
            })?;
            self.mapper = Some(mapper);
        }
        if self.resync_every.is_none() {
            self.resync_every = Some(DEFAULT_RESYNC_EVERY);
        }
        self.client = Some(client);
        Ok(self)
    }

    /// Compose this (override) option set on top of an inherited one.
    ///
    /// Per-kind option maps are merged over their kind-keyed forms: selectors
    /// combine, transforms chain with the inherited side first, deep-copy
    /// flags take the override when it has an entry for the exact kind. The
    /// client is dropped and rebuilt at defaulting time.
    pub fn inherit_from(self, inherited: Options) -> CacheResult<Options> {
        let registry = SchemaRegistry::union(inherited.registry.as_ref(), self.registry.as_ref());
        let reg = registry.as_ref();

        // Selectors: combine pairwise per kind over the union of both maps'
        // keys. Each side contributes its effective selector for the kind —
        // the specific entry when it has one, its sentinel default otherwise —
        // so an inherited default still restricts kinds only the override
        // names.
        let own_selectors = to_by_kind(self.view.by_object.selectors.entries(), &self.view.default_selector, reg)
            .map_err(CacheError::Composition)?;
        let inherited_selectors = to_by_kind(
            inherited.view.by_object.selectors.entries(),
            &inherited.view.default_selector,
            reg,
        )
        .map_err(CacheError::Composition)?;
        let mut selectors: FxHashMap<KindKey, Selector> = FxHashMap::default();
        for key in inherited_selectors.keys().chain(own_selectors.keys()) {
            let sides = effective(&inherited_selectors, key)
                .into_iter()
                .chain(effective(&own_selectors, key));
            selectors.insert(key.clone(), Selector::combine(sides));
        }
        let (selector_entries, default_selector) = to_by_object(selectors, reg).map_err(CacheError::Composition)?;

        // Transforms: chain per kind over the same union, inherited side
        // always running first.
        let own_transforms = to_by_kind(self.view.by_object.transforms.entries(), &self.view.default_transform, reg)
            .map_err(CacheError::Composition)?;
        let inherited_transforms = to_by_kind(
            inherited.view.by_object.transforms.entries(),
            &inherited.view.default_transform,
            reg,
        )
        .map_err(CacheError::Composition)?;
        let mut transforms: FxHashMap<KindKey, Transform> = FxHashMap::default();
        for key in inherited_transforms.keys().chain(own_transforms.keys()) {
            let inh = effective(&inherited_transforms, key).cloned().unwrap_or_default();
            let own = effective(&own_transforms, key).cloned().unwrap_or_default();
            transforms.insert(key.clone(), Transform::chain(&inh, &own));
        }
        let (transform_entries, default_transform) = to_by_object(transforms, reg).map_err(CacheError::Composition)?;

        // Deep-copy flags: the override wins whenever it has an entry for the
        // exact kind, even one re-enabling copies.
        let mut deep_copy =
            deep_copy_to_by_kind(self.view.by_object.disable_deep_copy.entries(), reg).map_err(CacheError::Composition)?;
        let inherited_deep_copy = deep_copy_to_by_kind(inherited.view.by_object.disable_deep_copy.entries(), reg)
            .map_err(CacheError::Composition)?;
        for (key, inherited_flag) in inherited_deep_copy {
            deep_copy.entry(key).or_insert(inherited_flag);
        }
        let disable_deep_copy = deep_copy_to_by_object(deep_copy, reg).map_err(CacheError::Composition)?;

        let namespaces = if self.view.namespaces.is_empty() {
            inherited.view.namespaces
        } else {
            self.view.namespaces
        };

        Ok(Options {
            client: None,
            registry,
            mapper: self.mapper.or(inherited.mapper),
            resync_every: self.resync_every.or(inherited.resync_every),
            view: ViewOptions {
                namespaces,
                default_selector,
                default_transform,
                by_object: ViewByObject {
                    selectors: SelectorsByObject::from_entries(selector_entries),
                    transforms: TransformsByObject::from_entries(transform_entries),
                    disable_deep_copy,
                },
            },
        })
    }

    /// Translate the view's identity-keyed maps to canonical kind-keyed form.
    pub(crate) fn view_by_kind(&self, registry: &SchemaRegistry) -> Result<ByKindConfig, SchemaError> {
        let reg = Some(registry);
        Ok(ByKindConfig {
            selectors: to_by_kind(self.view.by_object.selectors.entries(), &self.view.default_selector, reg)?,
            transforms: to_by_kind(self.view.by_object.transforms.entries(), &self.view.default_transform, reg)?,
            disable_deep_copy: deep_copy_to_by_kind(self.view.by_object.disable_deep_copy.entries(), reg)?,
        })
    }
}

/// A map's effective value for a key: the exact entry, else its sentinel.
fn effective<'a, T>(map: &'a FxHashMap<KindKey, T>, key: &KindKey) -> Option<&'a T> {
    map.get(key).or_else(|| map.get(&KindKey::All))
}

fn no_registry() -> SchemaError {
    SchemaError::KindResolution("no schema registry available to resolve object identities".into())
}

/// Resolve an identity-keyed map to kind-keyed form. The default always goes
/// in under the sentinel key and overwrites nothing else.
fn to_by_kind<T: Clone>(
    entries: &[(Box<dyn ObjectIdentity>, T)],
    default: &T,
    registry: Option<&SchemaRegistry>,
) -> Result<FxHashMap<KindKey, T>, SchemaError> {
    let mut by_kind = FxHashMap::default();
    for (identity, value) in entries {
        let registry = registry.ok_or_else(no_registry)?;
        let kind = registry.kind_for(identity.as_ref())?;
        by_kind.insert(KindKey::Kind(kind), value.clone());
    }
    by_kind.insert(KindKey::All, default.clone());
    Ok(by_kind)
}

/// Reverse translation: materialize a representative identity per kind. The
/// sentinel entry becomes the returned default and never lands in the map.
fn to_by_object<T: Default>(
    mut by_kind: FxHashMap<KindKey, T>,
    registry: Option<&SchemaRegistry>,
) -> Result<(Vec<(Box<dyn ObjectIdentity>, T)>, T), SchemaError> {
    let default = by_kind.remove(&KindKey::All).unwrap_or_default();
    let mut entries = Vec::new();
    for (key, value) in by_kind {
        let KindKey::Kind(kind) = key else { continue };
        let registry = registry.ok_or_else(no_registry)?;
        entries.push((registry.identity_for(&kind)?, value));
    }
    Ok((entries, default))
}

/// Deep-copy variant of [`to_by_kind`]: the wildcard identity maps straight
/// to the sentinel kind, without a registry lookup, and there is no implicit
/// default entry.
fn deep_copy_to_by_kind(
    entries: &[(IdentityKey, bool)],
    registry: Option<&SchemaRegistry>,
) -> Result<FxHashMap<KindKey, bool>, SchemaError> {
    let mut by_kind = FxHashMap::default();
    for (key, disable) in entries {
        match key {
            IdentityKey::AllObjects => {
                by_kind.insert(KindKey::All, *disable);
            }
            IdentityKey::Object(identity) => {
                let registry = registry.ok_or_else(no_registry)?;
                let kind = registry.kind_for(identity.as_ref())?;
                by_kind.insert(KindKey::Kind(kind), *disable);
            }
        }
    }
    Ok(by_kind)
}

fn deep_copy_to_by_object(
    by_kind: FxHashMap<KindKey, bool>,
    registry: Option<&SchemaRegistry>,
) -> Result<DisableDeepCopyByObject, SchemaError> {
    let mut entries = Vec::new();
    for (key, disable) in by_kind {
        match key {
            KindKey::All => entries.push((IdentityKey::AllObjects, disable)),
            KindKey::Kind(kind) => {
                let registry = registry.ok_or_else(no_registry)?;
                entries.push((IdentityKey::Object(registry.identity_for(&kind)?), disable));
            }
        }
    }
    Ok(DisableDeepCopyByObject { entries })
}
