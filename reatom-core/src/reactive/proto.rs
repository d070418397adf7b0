//! Atom Prototypes
//!
//! An [`AtomProto`] is the static descriptor shared by every context that
//! evaluates the same atom or action: identity, name, computer function,
//! equality and the lifecycle hook registries. It is created once per
//! declaration and never changes afterwards, except for the hook lists,
//! which collaborators may extend at any time.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{ReatomError, Result};

use super::context::ComputeCtx;
use super::runtime::Ctx;

/// Type-erased atom state.
pub type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type Computer =
    Arc<dyn Fn(&ComputeCtx, Option<&Value>) -> Result<Option<Value>> + Send + Sync>;
pub(crate) type Initial = Arc<dyn Fn() -> Value + Send + Sync>;
pub(crate) type Equality = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
pub(crate) type LifecycleHook = Arc<dyn Fn(&Ctx) + Send + Sync>;
pub(crate) type UpdateHook = Arc<dyn Fn(&Ctx, &Value) + Send + Sync>;

/// Stable identity of an atom, assigned at declaration.
///
/// Contexts use it as an index into their slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AtomId(u32);

impl AtomId {
    fn next() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a proto describes a value node or an event node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AtomKind {
    Atom,
    Action,
}

/// Handle returned by hook registration, used to remove the hook again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Hooks {
    connect: RwLock<Vec<(HookId, LifecycleHook)>>,
    disconnect: RwLock<Vec<(HookId, LifecycleHook)>>,
    update: RwLock<Vec<(HookId, UpdateHook)>>,
}

/// Static, shared descriptor of an atom or action.
pub struct AtomProto {
    id: AtomId,
    name: Arc<str>,
    kind: AtomKind,
    computer: Option<Computer>,
    initial: Option<Initial>,
    is_equal: Equality,
    hooks: Hooks,
}

impl AtomProto {
    pub(crate) fn new(
        kind: AtomKind,
        name: Option<&str>,
        computer: Option<Computer>,
        initial: Option<Initial>,
        is_equal: Equality,
    ) -> Result<Arc<Self>> {
        if computer.is_none() && initial.is_none() {
            return Err(ReatomError::InvalidDeclaration {
                reason: "an atom needs an initial value or a computer".to_string(),
            });
        }

        let id = AtomId::next();
        let name: Arc<str> = match name {
            Some(name) => {
                validate_name(name)?;
                name.into()
            }
            None => match kind {
                AtomKind::Atom => format!("_atom{id}").into(),
                AtomKind::Action => format!("_action{id}").into(),
            },
        };

        Ok(Arc::new(Self {
            id,
            name,
            kind,
            computer,
            initial,
            is_equal,
            hooks: Hooks::default(),
        }))
    }

    pub fn id(&self) -> AtomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn kind(&self) -> AtomKind {
        self.kind
    }

    pub fn is_action(&self) -> bool {
        self.kind == AtomKind::Action
    }

    pub(crate) fn computer(&self) -> Option<&Computer> {
        self.computer.as_ref()
    }

    pub(crate) fn initial_state(&self) -> Option<Value> {
        self.initial.as_ref().map(|init| init())
    }

    /// Identity first, then the declared equality.
    pub(crate) fn equals(&self, a: &Value, b: &Value) -> bool {
        Arc::ptr_eq(a, b) || (self.is_equal)(a, b)
    }

    pub fn on_connect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        let id = next_hook_id();
        self.hooks.connect.write().push((id, Arc::new(hook)));
        id
    }

    pub fn on_disconnect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        let id = next_hook_id();
        self.hooks.disconnect.write().push((id, Arc::new(hook)));
        id
    }

    pub(crate) fn on_update_erased(&self, hook: UpdateHook) -> HookId {
        let id = next_hook_id();
        self.hooks.update.write().push((id, hook));
        id
    }

    /// Remove a previously registered hook of any kind.
    pub fn off(&self, hook: HookId) -> bool {
        let mut removed = false;
        removed |= retain_without(&self.hooks.connect, hook);
        removed |= retain_without(&self.hooks.disconnect, hook);
        removed |= retain_without(&self.hooks.update, hook);
        removed
    }

    pub(crate) fn connect_hooks(&self) -> Vec<LifecycleHook> {
        self.hooks.connect.read().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn disconnect_hooks(&self) -> Vec<LifecycleHook> {
        self.hooks.disconnect.read().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn update_hooks(&self) -> Vec<UpdateHook> {
        self.hooks.update.read().iter().map(|(_, h)| h.clone()).collect()
    }
}

impl fmt::Debug for AtomProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomProto")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("computed", &self.computer.is_some())
            .finish()
    }
}

fn next_hook_id() -> HookId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    HookId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn retain_without<H>(hooks: &RwLock<Vec<(HookId, H)>>, id: HookId) -> bool {
    let mut hooks = hooks.write();
    let before = hooks.len();
    hooks.retain(|(hook_id, _)| *hook_id != id);
    hooks.len() != before
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReatomError::InvalidDeclaration {
            reason: "name must not be empty".to_string(),
        });
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ReatomError::InvalidDeclaration {
            reason: format!("name `{}` contains whitespace", name.escape_debug()),
        });
    }
    Ok(())
}

/// Equality for states that implement `PartialEq`.
pub(crate) fn partial_eq<T: PartialEq + 'static>() -> Equality {
    Arc::new(|a: &Value, b: &Value| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    })
}

/// Downcast an erased state, reporting a mismatch as a graph error.
pub(crate) fn downcast<T: Clone + 'static>(value: &Value, atom: &str) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ReatomError::message(format!("state of `{atom}` has an unexpected type")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial(value: i32) -> Option<Initial> {
        Some(Arc::new(move || Arc::new(value) as Value))
    }

    #[test]
    fn atom_ids_are_unique() {
        let a = AtomProto::new(AtomKind::Atom, None, None, initial(0), partial_eq::<i32>()).unwrap();
        let b = AtomProto::new(AtomKind::Atom, None, None, initial(0), partial_eq::<i32>()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn anonymous_names_carry_the_id() {
        let proto =
            AtomProto::new(AtomKind::Action, None, None, initial(0), partial_eq::<i32>()).unwrap();
        assert_eq!(proto.name(), format!("_action#{}", proto.id().raw()));
        assert!(proto.is_action());
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in ["", "two words", "tab\tbed"] {
            let err = AtomProto::new(AtomKind::Atom, Some(name), None, initial(0), partial_eq::<i32>())
                .unwrap_err();
            assert!(matches!(err, ReatomError::InvalidDeclaration { .. }), "{name:?}");
        }
    }

    #[test]
    fn declarations_need_a_state_source() {
        let err = AtomProto::new(AtomKind::Atom, Some("empty"), None, None, partial_eq::<i32>())
            .unwrap_err();
        assert!(matches!(err, ReatomError::InvalidDeclaration { .. }));
    }

    #[test]
    fn equality_checks_identity_then_value() {
        let proto =
            AtomProto::new(AtomKind::Atom, Some("eq"), None, initial(0), partial_eq::<i32>()).unwrap();
        let a: Value = Arc::new(1);
        let b: Value = Arc::new(1);
        let c: Value = Arc::new(2);
        assert!(proto.equals(&a, &a));
        assert!(proto.equals(&a, &b));
        assert!(!proto.equals(&a, &c));
    }

    #[test]
    fn hooks_can_be_removed() {
        let proto =
            AtomProto::new(AtomKind::Atom, Some("hooked"), None, initial(0), partial_eq::<i32>())
                .unwrap();
        let connect = proto.on_connect(|_| {});
        let _disconnect = proto.on_disconnect(|_| {});
        assert_eq!(proto.connect_hooks().len(), 1);

        assert!(proto.off(connect));
        assert!(!proto.off(connect));
        assert!(proto.connect_hooks().is_empty());
        assert_eq!(proto.disconnect_hooks().len(), 1);
    }
}
