use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies a category of notification for [`Listeners::update()`][crate::Listeners::update].
///
/// Pending updates of the same kind replace each other, so each kind should correspond to one
/// piece of state whose latest value is all that listeners care about, such as "progress changed"
/// or "selection changed".
///
/// A kind is either a static name or a marker type. Kinds of different origin never compare equal.
///
/// # Example
///
/// ```rust
/// use listeners::NotificationKind;
///
/// struct SelectionChanged;
///
/// assert_eq!(NotificationKind::named("progress"), NotificationKind::named("progress"));
/// assert_ne!(
///     NotificationKind::named("progress"),
///     NotificationKind::of::<SelectionChanged>()
/// );
/// ```
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct NotificationKind(Origin);

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
enum Origin {
    Named(&'static str),
    Type {
        id: TypeId,
        // Only for diagnostics. TypeId alone decides equality.
        name: TypeName,
    },
}

/// A type name that takes no part in comparisons.
#[derive(Clone, Copy)]
struct TypeName(&'static str);

impl PartialEq for TypeName {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for TypeName {}

impl Hash for TypeName {
    fn hash<H: Hasher>(&self, _state: &mut H) {}
}

impl NotificationKind {
    /// A kind identified by a static name.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self(Origin::Named(name))
    }

    /// A kind identified by a marker type.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(Origin::Type {
            id: TypeId::of::<T>(),
            name: TypeName(type_name::<T>()),
        })
    }

    /// Human-readable name of the kind, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self.0 {
            Origin::Named(name) => name,
            Origin::Type { name, .. } => name.0,
        }
    }
}

impl fmt::Debug for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NotificationKind").field(&self.name()).finish()
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
